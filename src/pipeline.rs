use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::NaiveDate;
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use thiserror::Error;
use tracing::{error, info};

use crate::db::SecurityRecord;
use crate::fetcher::BulletinFetcher;
use crate::parser::{BulletinParse, BulletinParser};
use crate::sink::Sink;

static FILE_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"boc_(\d{4})(\d{2})(\d{2})").unwrap());

/// Pause between dates in multi-date runs.
pub const DATE_PAUSE: Duration = Duration::from_secs(1);

/// A date that completed without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateOutcome {
    /// Nothing was published (weekend, holiday, or not yet online).
    NoBulletin,
    Stored(usize),
    Printed(usize),
}

#[derive(Debug, Error)]
pub enum DateError {
    #[error("download failed: {0:#}")]
    Fetch(anyhow::Error),
    #[error("unreadable bulletin: {0:#}")]
    Unreadable(anyhow::Error),
    #[error("parser returned 0 securities, check the document layout")]
    EmptyExtraction,
    #[error("sink failed: {0:#}")]
    Sink(anyhow::Error),
}

/// What to do with the records of a parsed bulletin.
pub enum Mode {
    DryRun,
    Persist(Sink),
}

pub struct BatchSummary {
    pub succeeded: usize,
    pub total: usize,
}

impl BatchSummary {
    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.total
    }
}

pub struct Pipeline {
    fetcher: BulletinFetcher,
    parser: BulletinParser,
    mode: Mode,
    pause: Duration,
}

impl Pipeline {
    pub fn new(fetcher: BulletinFetcher, parser: BulletinParser, mode: Mode) -> Self {
        Self {
            fetcher,
            parser,
            mode,
            pause: DATE_PAUSE,
        }
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    /// Fetch, parse and store (or print) the bulletin of one date.
    pub async fn process_date(&self, date: NaiveDate) -> Result<DateOutcome, DateError> {
        let document = self.fetcher.fetch(date).await.map_err(DateError::Fetch)?;
        let parsed = self.parser.evaluate(document.as_deref(), date);
        let Some(records) = settle(parsed)? else {
            return Ok(DateOutcome::NoBulletin);
        };

        match &self.mode {
            Mode::DryRun => {
                print_records(&records);
                Ok(DateOutcome::Printed(records.len()))
            }
            Mode::Persist(sink) => {
                let n = sink.upsert(&records).await.map_err(DateError::Sink)?;
                Ok(DateOutcome::Stored(n))
            }
        }
    }

    /// Process `dates` in order; one failing date never stops the batch.
    pub async fn run(&self, dates: &[NaiveDate]) -> BatchSummary {
        let multi = dates.len() > 1;
        let pb = if multi {
            ProgressBar::new(dates.len() as u64)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) =
            ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("=> "));
        }

        let mut succeeded = 0usize;
        for (i, &date) in dates.iter().enumerate() {
            pb.set_message(date.to_string());
            info!("--- Processing {} ---", date);
            match self.process_date(date).await {
                Ok(outcome) => {
                    match outcome {
                        DateOutcome::NoBulletin => info!("{}: nothing published", date),
                        DateOutcome::Stored(n) => info!("{}: stored {} securities", date, n),
                        DateOutcome::Printed(n) => info!("{}: {} securities (dry run)", date, n),
                    }
                    succeeded += 1;
                }
                Err(e) => error!("Failed for {}: {}", date, e),
            }
            pb.inc(1);
            if multi && i + 1 < dates.len() {
                tokio::time::sleep(self.pause).await;
            }
        }
        pb.finish_and_clear();

        info!("Done: {}/{} dates processed successfully", succeeded, dates.len());
        BatchSummary {
            succeeded,
            total: dates.len(),
        }
    }
}

/// Map a bulletin parse onto the date-level taxonomy.
/// `Ok(None)` means there was nothing to process.
pub fn settle(
    parsed: anyhow::Result<BulletinParse>,
) -> Result<Option<Vec<SecurityRecord>>, DateError> {
    match parsed {
        Ok(BulletinParse::Missing) => Ok(None),
        Ok(BulletinParse::Empty) => Err(DateError::EmptyExtraction),
        Ok(BulletinParse::Parsed(records)) => Ok(Some(records)),
        Err(e) => Err(DateError::Unreadable(e)),
    }
}

pub fn print_records(records: &[SecurityRecord]) {
    for r in records {
        println!(
            "  {:8} | {:>10} | {:>6}%",
            r.ticker,
            display(r.close),
            display(r.day_change_pct)
        );
    }
}

fn display(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".into())
}

/// `.../boc_20260213_2.pdf` → 2026-02-13.
pub fn date_from_file_name(path: &Path) -> Option<NaiveDate> {
    let name = path.file_name()?.to_str()?;
    let caps = FILE_DATE_RE.captures(name)?;
    NaiveDate::from_ymd_opt(
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MarketConfig;
    use crate::db;
    use crate::fetcher::mock_server;
    use crate::pdf::fixtures;
    use rusqlite::Connection;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 13).unwrap()
    }

    fn security_row() -> Vec<&'static str> {
        vec![
            "FIN", "SGBC", "SOC GEN CI", "", "28 500", "28 600", "29 000", "1,75 %",
            "1 254", "36 366 000", "28 500", "12,40 %",
        ]
    }

    fn pipeline(base: &str, mode: Mode) -> Pipeline {
        let config = MarketConfig {
            bulletin_url: format!("{}/boc_{{date}}_2.pdf", base),
            fetch_attempts: 1,
            fetch_backoff_secs: 0,
            ..MarketConfig::default()
        };
        let fetcher = BulletinFetcher::new(mock_server::client(), &config);
        let parser = BulletinParser::from_config(&config).unwrap();
        Pipeline::new(fetcher, parser, mode).with_pause(Duration::ZERO)
    }

    fn sqlite() -> Mode {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        Mode::Persist(Sink::Sqlite(conn))
    }

    fn stored_rows(p: &Pipeline) -> usize {
        match &p.mode {
            Mode::Persist(Sink::Sqlite(conn)) => db::get_stats(conn).unwrap().rows,
            _ => panic!("not a sqlite pipeline"),
        }
    }

    #[test]
    fn settle_maps_each_parse_outcome() {
        assert!(matches!(settle(Ok(BulletinParse::Missing)), Ok(None)));
        assert!(matches!(
            settle(Ok(BulletinParse::Empty)),
            Err(DateError::EmptyExtraction)
        ));
        assert!(matches!(
            settle(Err(anyhow::anyhow!("bad xref"))),
            Err(DateError::Unreadable(_))
        ));
        let record = SecurityRecord::new(date(), "FIN", "SGBC");
        let parsed = settle(Ok(BulletinParse::Parsed(vec![record.clone()]))).unwrap();
        assert_eq!(parsed, Some(vec![record]));
    }

    #[test]
    fn file_name_dates() {
        assert_eq!(date_from_file_name(Path::new("data/boc_20260213_2.pdf")), Some(date()));
        assert_eq!(date_from_file_name(Path::new("boc_20261301.pdf")), None);
        assert_eq!(date_from_file_name(Path::new("bulletin.pdf")), None);
    }

    #[tokio::test]
    async fn stores_parsed_bulletin() {
        let pdf = fixtures::bulletin(&[vec![], vec![vec![security_row()]]]);
        let (base, _requests) = mock_server::serve(vec![(200, pdf)]).await;
        let p = pipeline(&base, sqlite());
        assert_eq!(p.process_date(date()).await.unwrap(), DateOutcome::Stored(1));
        assert_eq!(stored_rows(&p), 1);
    }

    #[tokio::test]
    async fn missing_bulletin_is_a_noop() {
        let (base, _requests) = mock_server::serve(vec![(404, Vec::new())]).await;
        let p = pipeline(&base, sqlite());
        assert_eq!(p.process_date(date()).await.unwrap(), DateOutcome::NoBulletin);
        assert_eq!(stored_rows(&p), 0);
    }

    #[tokio::test]
    async fn tables_outside_window_fail_the_date() {
        let pdf = fixtures::bulletin(&[vec![vec![security_row()]]]);
        let (base, _requests) = mock_server::serve(vec![(200, pdf)]).await;
        let p = pipeline(&base, sqlite());
        assert!(matches!(
            p.process_date(date()).await,
            Err(DateError::EmptyExtraction)
        ));
        assert_eq!(stored_rows(&p), 0);
    }

    #[tokio::test]
    async fn html_error_page_is_unreadable() {
        let (base, _requests) =
            mock_server::serve(vec![(200, b"<html>maintenance</html>".to_vec())]).await;
        let p = pipeline(&base, Mode::DryRun);
        assert!(matches!(
            p.process_date(date()).await,
            Err(DateError::Unreadable(_))
        ));
    }

    #[tokio::test]
    async fn fetch_failure_is_not_no_bulletin() {
        let (base, _requests) = mock_server::serve(vec![(500, Vec::new())]).await;
        let p = pipeline(&base, Mode::DryRun);
        assert!(matches!(p.process_date(date()).await, Err(DateError::Fetch(_))));
    }

    #[tokio::test]
    async fn batch_counts_successes() {
        let pdf = fixtures::bulletin(&[vec![], vec![vec![security_row()]]]);
        let (base, _requests) =
            mock_server::serve(vec![(200, pdf), (404, Vec::new()), (500, Vec::new())]).await;
        let p = pipeline(&base, Mode::DryRun);
        let days = [
            date(),
            NaiveDate::from_ymd_opt(2026, 2, 16).unwrap(),
            NaiveDate::from_ymd_opt(2026, 2, 17).unwrap(),
        ];
        let summary = p.run(&days).await;
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.total, 3);
        assert!(!summary.all_succeeded());
    }
}
