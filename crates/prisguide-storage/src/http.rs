//! Document fetch capability: direct HTTP GET or routed through a proxying service.
//!
//! Nothing here retries. A failed fetch is reported once and the orchestrator decides.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("timed out after {timeout_ms}ms fetching {url}")]
    Timeout { url: String, timeout_ms: u64 },
    #[error("invalid proxy response for {url}: {message}")]
    Proxy { url: String, message: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        match self {
            FetchError::Timeout { .. } => true,
            FetchError::Request { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    fn from_reqwest(url: &str, timeout: Duration, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
        } else {
            FetchError::Request {
                url: url.to_string(),
                source: err,
            }
        }
    }
}

#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    /// Fetches `url` and returns the raw body text.
    async fn fetch(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<String, FetchError>;
}

/// Headers that make a plain GET look like a desktop browser.
pub fn browser_headers() -> Vec<(String, String)> {
    [
        ("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        ("Accept-Language", "nb-NO,nb;q=0.9,no;q=0.8,en;q=0.6"),
        ("Cache-Control", "no-cache"),
        ("Pragma", "no-cache"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            global_concurrency: 8,
        }
    }
}

fn header_map(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            debug!(header = name.as_str(), "skipping invalid header");
            continue;
        };
        map.insert(name, value);
    }
    map
}

#[derive(Debug, Clone)]
pub struct HttpDocumentFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
}

impl HttpDocumentFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

#[async_trait]
impl DocumentFetcher for HttpDocumentFetcher {
    async fn fetch(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<String, FetchError> {
        // The semaphore is never closed, so acquire only fails if that changes.
        let _permit = self.limit.acquire().await.ok();

        let span = info_span!("http_fetch", url);
        async {
            let resp = self
                .client
                .get(url)
                .headers(header_map(headers))
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| FetchError::from_reqwest(url, timeout, e))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }

            let body = resp
                .text()
                .await
                .map_err(|e| FetchError::from_reqwest(url, timeout, e))?;
            debug!(bytes = body.len(), "fetched document");
            Ok(body)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Deserialize)]
struct ProxyEnvelope {
    contents: Option<String>,
    status: Option<ProxyStatus>,
}

#[derive(Debug, Deserialize)]
struct ProxyStatus {
    http_code: Option<u16>,
}

/// Fetches through a proxying service answering `GET {base}?url=<target>` with `{ "contents": "..." }`.
#[derive(Debug, Clone)]
pub struct ProxyDocumentFetcher {
    http: HttpDocumentFetcher,
    base_url: String,
}

impl ProxyDocumentFetcher {
    pub fn new(http: HttpDocumentFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl DocumentFetcher for ProxyDocumentFetcher {
    async fn fetch(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<String, FetchError> {
        let proxied = reqwest::Url::parse_with_params(&self.base_url, &[("url", url)]).map_err(
            |e| FetchError::Proxy {
                url: url.to_string(),
                message: format!("bad proxy base url {}: {e}", self.base_url),
            },
        )?;

        let resp = self
            .http
            .client()
            .get(proxied)
            .headers(header_map(headers))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, timeout, e))?;

        if resp.status() != StatusCode::OK {
            return Err(FetchError::HttpStatus {
                status: resp.status().as_u16(),
                url: url.to_string(),
            });
        }

        let envelope: ProxyEnvelope = resp.json().await.map_err(|e| FetchError::Proxy {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        if let Some(code) = envelope.status.and_then(|s| s.http_code) {
            if !(200..300).contains(&code) {
                return Err(FetchError::HttpStatus {
                    status: code,
                    url: url.to_string(),
                });
            }
        }

        envelope.contents.ok_or_else(|| FetchError::Proxy {
            url: url.to_string(),
            message: "missing contents".to_string(),
        })
    }
}
