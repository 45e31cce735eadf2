use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use regex::Regex;

use super::cells::{clean_integer, clean_number, clean_percent, clean_ratio, clean_text};
use crate::config::MarketConfig;
use crate::db::SecurityRecord;

/// Shortest row that still carries sector through YTD change.
const MIN_CELLS: usize = 12;

type Setter = fn(&mut SecurityRecord, Option<&str>);

/// Physical layout of the security tables: column index → field.
/// Columns 12 and up are missing from some table variants.
const COLUMNS: &[(usize, Setter)] = &[
    (2, |r, c| r.company_name = c.and_then(clean_text)),
    (4, |r, c| r.previous_close = c.and_then(clean_number)),
    (5, |r, c| r.open = c.and_then(clean_number)),
    (6, |r, c| r.close = c.and_then(clean_number)),
    (7, |r, c| r.day_change_pct = c.and_then(clean_percent)),
    (8, |r, c| r.volume = clean_integer(c)),
    (9, |r, c| r.traded_value = clean_integer(c)),
    (10, |r, c| r.reference_price = c.and_then(clean_number)),
    (11, |r, c| r.ytd_change_pct = c.and_then(clean_percent)),
    (12, |r, c| r.last_dividend = c.and_then(clean_number)),
    (13, |r, c| r.dividend_date = c.and_then(clean_text)),
    (14, |r, c| r.net_yield_pct = c.and_then(clean_percent)),
    (15, |r, c| r.per = c.and_then(clean_ratio)),
];

/// Decides which grid rows are security rows and turns them into records.
pub struct RowClassifier {
    sectors: BTreeSet<String>,
    ticker_re: Regex,
}

impl RowClassifier {
    pub fn new(sectors: impl IntoIterator<Item = String>, ticker_pattern: &str) -> Result<Self> {
        let ticker_re = Regex::new(&format!("^(?:{})$", ticker_pattern))
            .with_context(|| format!("Invalid ticker pattern {:?}", ticker_pattern))?;
        Ok(Self {
            sectors: sectors.into_iter().collect(),
            ticker_re,
        })
    }

    pub fn from_config(config: &MarketConfig) -> Result<Self> {
        Self::new(config.sectors.iter().cloned(), &config.ticker_pattern)
    }

    /// Row gate: returns `(sector, ticker)` for rows shaped like a security.
    pub fn accept<'r>(&self, row: &'r [Option<String>]) -> Option<(&'r str, &'r str)> {
        if row.len() < MIN_CELLS {
            return None;
        }
        let sector = cell(row, 0)?.trim();
        if !self.sectors.contains(sector) {
            return None;
        }
        let ticker = cell(row, 1)?.trim();
        if !self.ticker_re.is_match(ticker) {
            return None;
        }
        Some((sector, ticker))
    }

    pub fn classify(&self, row: &[Option<String>], date: NaiveDate) -> Option<SecurityRecord> {
        let (sector, ticker) = self.accept(row)?;
        let mut record = SecurityRecord::new(date, sector, ticker);
        map_columns(&mut record, row);
        Some(record)
    }
}

/// Fill every mapped field from `row`; cells past the end read as absent.
pub fn map_columns(record: &mut SecurityRecord, row: &[Option<String>]) {
    for (idx, set) in COLUMNS {
        set(record, cell(row, *idx));
    }
}

fn cell(row: &[Option<String>], idx: usize) -> Option<&str> {
    row.get(idx)?.as_deref()
}
