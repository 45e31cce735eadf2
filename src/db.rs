use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::Serialize;

pub const DEFAULT_DB_PATH: &str = "data/boc.sqlite";

// ── Records ──

/// One validated security row of one bulletin. Identity is (date, ticker).
///
/// Serialized names match the remote `brvm_cotation_journaliere` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityRecord {
    pub date: NaiveDate,
    #[serde(rename = "secteur")]
    pub sector: String,
    pub ticker: String,
    #[serde(rename = "compagnie")]
    pub company_name: Option<String>,
    #[serde(rename = "cours_precedent")]
    pub previous_close: Option<f64>,
    #[serde(rename = "cours_ouv")]
    pub open: Option<f64>,
    #[serde(rename = "cours_cloture")]
    pub close: Option<f64>,
    #[serde(rename = "variation_jour")]
    pub day_change_pct: Option<f64>,
    pub volume: i64,
    #[serde(rename = "valeur_transigee")]
    pub traded_value: i64,
    #[serde(rename = "cours_reference")]
    pub reference_price: Option<f64>,
    #[serde(rename = "variation_ytd")]
    pub ytd_change_pct: Option<f64>,
    #[serde(rename = "dernier_div")]
    pub last_dividend: Option<f64>,
    #[serde(rename = "date_div")]
    pub dividend_date: Option<String>,
    #[serde(rename = "rendement_net")]
    pub net_yield_pct: Option<f64>,
    pub per: Option<f64>,
}

impl SecurityRecord {
    /// Record with identity set and every market field absent.
    pub fn new(date: NaiveDate, sector: &str, ticker: &str) -> Self {
        Self {
            date,
            sector: sector.to_string(),
            ticker: ticker.to_string(),
            company_name: None,
            previous_close: None,
            open: None,
            close: None,
            day_change_pct: None,
            volume: 0,
            traded_value: 0,
            reference_price: None,
            ytd_change_pct: None,
            last_dividend: None,
            dividend_date: None,
            net_yield_pct: None,
            per: None,
        }
    }
}

// ── Connection ──

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cotations (
            id               INTEGER PRIMARY KEY,
            date             TEXT NOT NULL,
            ticker           TEXT NOT NULL,
            secteur          TEXT NOT NULL,
            compagnie        TEXT,
            cours_precedent  REAL,
            cours_ouv        REAL,
            cours_cloture    REAL,
            variation_jour   REAL,
            volume           INTEGER NOT NULL DEFAULT 0,
            valeur_transigee INTEGER NOT NULL DEFAULT 0,
            cours_reference  REAL,
            variation_ytd    REAL,
            dernier_div      REAL,
            date_div         TEXT,
            rendement_net    REAL,
            per              REAL,
            updated_at       TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(date, ticker)
        );
        CREATE INDEX IF NOT EXISTS idx_cotations_ticker ON cotations(ticker);
        ",
    )?;
    Ok(())
}

// ── Upsert ──

/// Insert or overwrite one bulletin's records in a single transaction.
pub fn upsert_records(conn: &Connection, records: &[SecurityRecord]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO cotations
             (date, ticker, secteur, compagnie, cours_precedent, cours_ouv, cours_cloture,
              variation_jour, volume, valeur_transigee, cours_reference, variation_ytd,
              dernier_div, date_div, rendement_net, per)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)
             ON CONFLICT(date, ticker) DO UPDATE SET
                secteur = excluded.secteur,
                compagnie = excluded.compagnie,
                cours_precedent = excluded.cours_precedent,
                cours_ouv = excluded.cours_ouv,
                cours_cloture = excluded.cours_cloture,
                variation_jour = excluded.variation_jour,
                volume = excluded.volume,
                valeur_transigee = excluded.valeur_transigee,
                cours_reference = excluded.cours_reference,
                variation_ytd = excluded.variation_ytd,
                dernier_div = excluded.dernier_div,
                date_div = excluded.date_div,
                rendement_net = excluded.rendement_net,
                per = excluded.per,
                updated_at = datetime('now')",
        )?;
        for r in records {
            count += stmt.execute(rusqlite::params![
                r.date.to_string(), r.ticker, r.sector, r.company_name, r.previous_close,
                r.open, r.close, r.day_change_pct, r.volume, r.traded_value,
                r.reference_price, r.ytd_change_pct, r.last_dividend, r.dividend_date,
                r.net_yield_pct, r.per,
            ])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

// ── Stats ──

pub struct Stats {
    pub rows: usize,
    pub dates: usize,
    pub tickers: usize,
    pub first_date: Option<String>,
    pub last_date: Option<String>,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let rows: usize = conn.query_row("SELECT COUNT(*) FROM cotations", [], |r| r.get(0))?;
    let dates: usize =
        conn.query_row("SELECT COUNT(DISTINCT date) FROM cotations", [], |r| r.get(0))?;
    let tickers: usize =
        conn.query_row("SELECT COUNT(DISTINCT ticker) FROM cotations", [], |r| r.get(0))?;
    let (first_date, last_date) = conn.query_row(
        "SELECT MIN(date), MAX(date) FROM cotations",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    Ok(Stats {
        rows,
        dates,
        tickers,
        first_date,
        last_date,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn record(ticker: &str, close: f64) -> SecurityRecord {
        let mut r = SecurityRecord::new(NaiveDate::from_ymd_opt(2026, 2, 13).unwrap(), "FIN", ticker);
        r.close = Some(close);
        r.volume = 10;
        r
    }

    #[test]
    fn upsert_overwrites_on_same_date_and_ticker() {
        let conn = memory_db();
        upsert_records(&conn, &[record("SGBC", 100.0), record("ORAC", 50.0)]).unwrap();
        upsert_records(&conn, &[record("SGBC", 120.0)]).unwrap();

        let close: f64 = conn
            .query_row("SELECT cours_cloture FROM cotations WHERE ticker = 'SGBC'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(close, 120.0);

        let s = get_stats(&conn).unwrap();
        assert_eq!(s.rows, 2);
        assert_eq!(s.dates, 1);
        assert_eq!(s.tickers, 2);
        assert_eq!(s.last_date.as_deref(), Some("2026-02-13"));
    }

    #[test]
    fn empty_batch_is_noop() {
        let conn = memory_db();
        assert_eq!(upsert_records(&conn, &[]).unwrap(), 0);
        assert_eq!(get_stats(&conn).unwrap().rows, 0);
        assert!(get_stats(&conn).unwrap().first_date.is_none());
    }

    #[test]
    fn serializes_with_table_column_names() {
        let mut r = record("SGBC", 100.0);
        r.day_change_pct = Some(1.5);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["date"], "2026-02-13");
        assert_eq!(v["secteur"], "FIN");
        assert_eq!(v["cours_cloture"], 100.0);
        assert_eq!(v["variation_jour"], 1.5);
        assert!(v["compagnie"].is_null());
    }
}
