//! Cell-level cleanup. Every function here is total: a cell that cannot be
//! read becomes `None` (or `0` for integer columns), never an error.

/// Parse a locale-formatted number such as `"1 226,13"`.
///
/// Only the first line of a multi-line cell is read. Anything other than
/// digits, separators and a leading minus is dropped, and the decimal comma
/// becomes a dot.
pub fn clean_number(raw: &str) -> Option<f64> {
    let first_line = raw.split(['\n', '\r']).next().unwrap_or("");

    let mut cleaned = String::with_capacity(first_line.len());
    for c in first_line.chars() {
        match c {
            '0'..='9' | '.' => cleaned.push(c),
            ',' => cleaned.push('.'),
            '-' if cleaned.is_empty() => cleaned.push('-'),
            _ => {}
        }
    }

    if cleaned.is_empty() || cleaned == "-" {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// `"2,35 %"` → `2.35`.
pub fn clean_percent(raw: &str) -> Option<f64> {
    clean_number(raw.trim().trim_end_matches('%'))
}

/// Volume and traded value: spaces are thousands separators, absent is zero.
/// Values outside the `i64` range are unreadable and also become zero.
pub fn clean_integer(raw: Option<&str>) -> i64 {
    raw.map(|s| s.replace([' ', '\u{a0}', '\u{202f}'], ""))
        .as_deref()
        .and_then(clean_number)
        .map(f64::trunc)
        .filter(|v| (i64::MIN as f64..i64::MAX as f64).contains(v))
        .map(|v| v as i64)
        .unwrap_or(0)
}

/// P/E column: the bulletin prints it with a trailing decimal part that is
/// often wrapped, so only the integral part before the comma is kept.
pub fn clean_ratio(raw: &str) -> Option<f64> {
    let joined = raw.replace(['\n', '\r'], " ");
    let integral = joined.split(',').next().unwrap_or("");
    clean_number(integral)
}

/// Trim and fold a wrapped text cell onto one line.
pub fn clean_text(raw: &str) -> Option<String> {
    let text = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thousands_and_decimal_comma() {
        assert_eq!(clean_number("1 226,13"), Some(1226.13));
        assert_eq!(clean_number("100"), Some(100.0));
        assert_eq!(clean_number("  15 000  "), Some(15000.0));
    }

    #[test]
    fn stops_at_first_line_break() {
        assert_eq!(clean_number("1 226,\n13"), Some(1226.0));
        assert_eq!(clean_number("7 450\r\n(ex)"), Some(7450.0));
    }

    #[test]
    fn absent_values() {
        assert_eq!(clean_number("-"), None);
        assert_eq!(clean_number(""), None);
        assert_eq!(clean_number("N/A"), None);
        assert_eq!(clean_number("\n12"), None);
        assert_eq!(clean_number(","), None);
        // two decimal separators cannot be read unambiguously
        assert_eq!(clean_number("1.226,13"), None);
    }

    #[test]
    fn negative_numbers() {
        assert_eq!(clean_number("-2,5"), Some(-2.5));
        assert_eq!(clean_number(" - 3"), Some(-3.0));
    }

    #[test]
    fn percent() {
        assert_eq!(clean_percent("1.0%"), Some(1.0));
        assert_eq!(clean_percent("-0,75 %"), Some(-0.75));
        assert_eq!(clean_percent("%"), None);
        assert_eq!(clean_percent(""), None);
    }

    #[test]
    fn integer_coerces_to_zero() {
        assert_eq!(clean_integer(Some("1 000")), 1000);
        assert_eq!(clean_integer(Some("102 000")), 102000);
        assert_eq!(clean_integer(Some("   ")), 0);
        assert_eq!(clean_integer(Some(" , ")), 0);
        assert_eq!(clean_integer(Some("-")), 0);
        assert_eq!(clean_integer(None), 0);
        assert_eq!(clean_integer(Some("12\u{a0}345")), 12345);
        assert_eq!(clean_integer(Some("99 999 999 999 999 999 999")), 0);
        assert_eq!(clean_integer(Some("-99 999 999 999 999 999 999")), 0);
    }

    #[test]
    fn ratio_keeps_integral_part() {
        assert_eq!(clean_ratio("12,45"), Some(12.0));
        assert_eq!(clean_ratio("1\n2,5"), Some(12.0));
        assert_eq!(clean_ratio("NS"), None);
    }

    #[test]
    fn text_folds_lines() {
        assert_eq!(
            clean_text("  SOCIETE GENERALE\nCOTE D'IVOIRE ").as_deref(),
            Some("SOCIETE GENERALE COTE D'IVOIRE")
        );
        assert_eq!(clean_text(" \n "), None);
        assert_eq!(clean_text("15/06/2025").as_deref(), Some("15/06/2025"));
    }
}
