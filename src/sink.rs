use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::db::{self, SecurityRecord};

const DEFAULT_SUPABASE_TABLE: &str = "brvm_cotation_journaliere";
const ERROR_BODY_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SinkKind {
    Sqlite,
    Supabase,
}

/// Where parsed bulletins are persisted. Each `upsert` call is one batch.
pub enum Sink {
    Sqlite(Connection),
    Supabase(SupabaseClient),
}

impl Sink {
    /// Open the sink, reading its location from the environment.
    pub fn open(kind: SinkKind) -> Result<Self> {
        match kind {
            SinkKind::Sqlite => {
                let path = std::env::var("BOC_DB_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from(db::DEFAULT_DB_PATH));
                let conn = db::connect(&path)?;
                db::init_schema(&conn)?;
                Ok(Sink::Sqlite(conn))
            }
            SinkKind::Supabase => Ok(Sink::Supabase(SupabaseClient::from_env()?)),
        }
    }

    /// Insert or update every record keyed on (date, ticker).
    pub async fn upsert(&self, records: &[SecurityRecord]) -> Result<usize> {
        if records.is_empty() {
            warn!("No records to upsert");
            return Ok(0);
        }
        let n = match self {
            Sink::Sqlite(conn) => db::upsert_records(conn, records)?,
            Sink::Supabase(client) => client.upsert(records).await?,
        };
        info!("Upserted {} records", n);
        Ok(n)
    }
}

pub struct SupabaseClient {
    client: reqwest::Client,
    endpoint: String,
}

impl SupabaseClient {
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("SUPABASE_URL").context("SUPABASE_URL must be set")?;
        let key =
            std::env::var("SUPABASE_SERVICE_KEY").context("SUPABASE_SERVICE_KEY must be set")?;
        let table =
            std::env::var("SUPABASE_TABLE").unwrap_or_else(|_| DEFAULT_SUPABASE_TABLE.to_string());
        Self::new(reqwest::Client::builder(), &url, &key, &table)
    }

    pub fn new(
        builder: reqwest::ClientBuilder,
        base_url: &str,
        key: &str,
        table: &str,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert("apikey", HeaderValue::from_str(key).context("Invalid service key")?);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", key)).context("Invalid service key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("Prefer", HeaderValue::from_static("resolution=merge-duplicates"));

        let client = builder
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/rest/v1/{}?on_conflict=date,ticker",
                base_url.trim_end_matches('/'),
                table
            ),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn upsert(&self, records: &[SecurityRecord]) -> Result<usize> {
        let response = self
            .client
            .post(self.endpoint())
            .json(records)
            .send()
            .await
            .context("Supabase request failed")?;

        let status = response.status();
        if status.as_u16() == 200 || status.as_u16() == 201 {
            return Ok(records.len());
        }
        let body = response.text().await.unwrap_or_default();
        bail!("Supabase error {}: {}", status.as_u16(), truncate(&body, ERROR_BODY_LIMIT))
    }
}

fn truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
