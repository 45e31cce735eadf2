use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use reqwest::StatusCode;
use tracing::{error, info, warn};

use crate::config::MarketConfig;

/// Downloads the bulletin published for a given date.
pub struct BulletinFetcher {
    client: reqwest::Client,
    url_template: String,
    attempts: u32,
    backoff: Duration,
}

impl BulletinFetcher {
    pub fn from_config(config: &MarketConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::new(client, config))
    }

    pub fn new(client: reqwest::Client, config: &MarketConfig) -> Self {
        Self {
            client,
            url_template: config.bulletin_url.clone(),
            attempts: config.fetch_attempts.max(1),
            backoff: Duration::from_secs(config.fetch_backoff_secs),
        }
    }

    pub fn url_for(&self, date: NaiveDate) -> String {
        self.url_template
            .replace("{date}", &date.format("%Y%m%d").to_string())
    }

    /// `Ok(None)` when nothing was published for `date` (HTTP 404).
    ///
    /// Any other non-200 status or transport error is retried; attempt `n`
    /// is followed by a pause of `n` backoff units.
    pub async fn fetch(&self, date: NaiveDate) -> Result<Option<Vec<u8>>> {
        let url = self.url_for(date);
        info!("Downloading: {}", url);

        for attempt in 1..=self.attempts {
            match self.fetch_once(&url).await {
                Ok(Some(bytes)) => {
                    info!("Downloaded {} KB", bytes.len() / 1024);
                    return Ok(Some(bytes));
                }
                Ok(None) => {
                    info!("No bulletin for {} (404, holiday or weekend)", date);
                    return Ok(None);
                }
                Err(e) => {
                    warn!("Attempt {}/{} for {}: {:#}", attempt, self.attempts, date, e);
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.backoff * attempt).await;
            }
        }

        error!("Failed to download bulletin for {} after {} attempts", date, self.attempts);
        bail!("Download failed after {} attempts: {}", self.attempts, url)
    }

    async fn fetch_once(&self, url: &str) -> Result<Option<Vec<u8>>> {
        let response = self.client.get(url).send().await?;
        match response.status() {
            StatusCode::OK => Ok(Some(response.bytes().await?.to_vec())),
            StatusCode::NOT_FOUND => Ok(None),
            status => bail!("HTTP {}", status),
        }
    }
}

/// One-shot HTTP responder for tests that need a real socket.
#[cfg(test)]
pub mod mock_server {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    pub fn client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    /// Serve `responses` in order, one connection each.
    /// Returns the base URL and a channel yielding each raw request.
    pub async fn serve(responses: Vec<(u16, Vec<u8>)>) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let request = read_request(&mut socket).await;
                let _ = tx.send(request);
                let head = format!(
                    "HTTP/1.1 {} Mock\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    body.len()
                );
                socket.write_all(head.as_bytes()).await.unwrap();
                socket.write_all(&body).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{}", addr), rx)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|l| l.split_once(':'))
                    .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if data.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&data).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 13).unwrap()
    }

    fn fetcher(base: &str, attempts: u32) -> BulletinFetcher {
        let config = MarketConfig {
            bulletin_url: format!("{}/boc_{{date}}_2.pdf", base),
            fetch_attempts: attempts,
            fetch_backoff_secs: 0,
            ..MarketConfig::default()
        };
        BulletinFetcher::new(mock_server::client(), &config)
    }

    #[test]
    fn default_url() {
        let f = BulletinFetcher::from_config(&MarketConfig::default()).unwrap();
        assert_eq!(
            f.url_for(date()),
            "https://www.brvm.org/sites/default/files/boc_20260213_2.pdf"
        );
    }

    #[tokio::test]
    async fn ok_returns_body() {
        let (base, mut requests) = mock_server::serve(vec![(200, b"%PDF-1.5".to_vec())]).await;
        let bytes = fetcher(&base, 3).fetch(date()).await.unwrap();
        assert_eq!(bytes.as_deref(), Some(&b"%PDF-1.5"[..]));
        let request = requests.recv().await.unwrap();
        assert!(request.starts_with("GET /boc_20260213_2.pdf "));
    }

    #[tokio::test]
    async fn not_found_is_no_document() {
        let (base, _requests) = mock_server::serve(vec![(404, Vec::new())]).await;
        assert_eq!(fetcher(&base, 3).fetch(date()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let (base, _requests) = mock_server::serve(vec![
            (503, Vec::new()),
            (500, Vec::new()),
            (200, b"ok".to_vec()),
        ])
        .await;
        let bytes = fetcher(&base, 3).fetch(date()).await.unwrap();
        assert_eq!(bytes, Some(b"ok".to_vec()));
    }

    #[tokio::test]
    async fn exhausted_attempts_fail() {
        let (base, _requests) = mock_server::serve(vec![(502, Vec::new()), (502, Vec::new())]).await;
        assert!(fetcher(&base, 2).fetch(date()).await.is_err());
    }
}
