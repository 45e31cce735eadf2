pub mod cells;
pub mod rows;

use std::collections::HashSet;
use std::ops::RangeInclusive;

use anyhow::Result;
use chrono::NaiveDate;
use tracing::{debug, info};

use crate::config::MarketConfig;
use crate::db::SecurityRecord;
use crate::pdf::{self, PageTables};
use rows::RowClassifier;

/// What a date's document turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum BulletinParse {
    /// No document was published for the date.
    Missing,
    /// A document was present but no security row was recognised.
    Empty,
    Parsed(Vec<SecurityRecord>),
}

/// Two-pass pipeline: PDF → ruled tables → security records.
pub struct BulletinParser {
    classifier: RowClassifier,
    pages: RangeInclusive<usize>,
}

impl BulletinParser {
    pub fn new(classifier: RowClassifier, pages: RangeInclusive<usize>) -> Self {
        Self { classifier, pages }
    }

    pub fn from_config(config: &MarketConfig) -> Result<Self> {
        Ok(Self::new(RowClassifier::from_config(config)?, config.page_window()))
    }

    /// Records in order of first appearance (page, table, row).
    pub fn parse(&self, bytes: &[u8], date: NaiveDate) -> Result<Vec<SecurityRecord>> {
        let pages = pdf::extract_tables(bytes, self.pages.clone())?;
        let records = self.records_from_tables(&pages, date);
        info!("Parsed {} securities for {}", records.len(), date);
        Ok(records)
    }

    /// Classify every row; the first row seen for a ticker wins.
    pub fn records_from_tables(&self, pages: &[PageTables], date: NaiveDate) -> Vec<SecurityRecord> {
        let mut records = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for page in pages {
            for row in page.tables.iter().flatten() {
                let Some(record) = self.classifier.classify(row, date) else {
                    continue;
                };
                if seen.contains(&record.ticker) {
                    debug!("Page {}: duplicate {} ignored", page.page, record.ticker);
                    continue;
                }
                seen.insert(record.ticker.clone());
                records.push(record);
            }
        }
        records
    }

    pub fn evaluate(&self, document: Option<&[u8]>, date: NaiveDate) -> Result<BulletinParse> {
        let Some(bytes) = document else {
            return Ok(BulletinParse::Missing);
        };
        let records = self.parse(bytes, date)?;
        if records.is_empty() {
            Ok(BulletinParse::Empty)
        } else {
            Ok(BulletinParse::Parsed(records))
        }
    }
}
