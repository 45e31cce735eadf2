use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;

const DEFAULT_BULLETIN_URL: &str = "https://www.brvm.org/sites/default/files/boc_{date}_2.pdf";
const DEFAULT_SECTORS: &[&str] = &["CB", "CD", "TEL", "FIN", "IND", "ENE", "SPU"];
const DEFAULT_TICKER_PATTERN: &str = r"^[A-Z]{3,6}$";

/// Everything that ties the parser to one exchange's bulletin layout.
///
/// Defaults describe the BRVM daily BOC. A TOML file can override any field,
/// e.g. to add holidays for a new year without a rebuild.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// URL template; `{date}` is replaced with `YYYYMMDD`.
    pub bulletin_url: String,
    /// Closed set of sector codes found in the first column of security rows.
    pub sectors: BTreeSet<String>,
    /// Regex every ticker must match in full.
    pub ticker_pattern: String,
    /// First page (1-based) holding security tables.
    pub first_page: usize,
    /// Last page (1-based, inclusive) holding security tables.
    pub last_page: usize,
    /// Public holidays on which no bulletin is published.
    pub holidays: Vec<NaiveDate>,
    pub fetch_attempts: u32,
    pub fetch_timeout_secs: u64,
    /// Delay unit between fetch attempts; attempt `n` waits `n` units.
    pub fetch_backoff_secs: u64,
    pub accept_invalid_certs: bool,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            bulletin_url: DEFAULT_BULLETIN_URL.to_string(),
            sectors: DEFAULT_SECTORS.iter().map(|s| s.to_string()).collect(),
            ticker_pattern: DEFAULT_TICKER_PATTERN.to_string(),
            first_page: 2,
            last_page: 5,
            holidays: default_holidays(),
            fetch_attempts: 3,
            fetch_timeout_secs: 30,
            fetch_backoff_secs: 5,
            accept_invalid_certs: true,
        }
    }
}

impl MarketConfig {
    /// Load overrides from a TOML file; missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read market config {}", path.display()))?;
        let config: MarketConfig = toml::from_str(&text)
            .with_context(|| format!("Invalid market config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.sectors.is_empty(), "sectors must not be empty");
        anyhow::ensure!(
            self.first_page >= 1 && self.first_page <= self.last_page,
            "invalid page window {}..={}",
            self.first_page,
            self.last_page
        );
        anyhow::ensure!(self.fetch_attempts >= 1, "fetch_attempts must be at least 1");
        anyhow::ensure!(
            self.bulletin_url.contains("{date}"),
            "bulletin_url must contain a {{date}} placeholder"
        );
        Ok(())
    }

    pub fn page_window(&self) -> RangeInclusive<usize> {
        self.first_page..=self.last_page
    }
}

// UEMOA public holidays
fn default_holidays() -> Vec<NaiveDate> {
    [
        (2025, 1, 1),
        (2025, 4, 21),
        (2025, 5, 1),
        (2025, 11, 1),
        (2025, 12, 25),
        (2026, 1, 1),
        (2026, 4, 6),
        (2026, 5, 1),
        (2026, 11, 1),
        (2026, 12, 25),
    ]
    .into_iter()
    .filter_map(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d))
    .collect()
}
