//! Fetcher contract + API and scraping fetcher implementations.

use std::sync::Arc;

use async_trait::async_trait;
use prisguide_core::{Endpoint, EndpointKind, SourceRecord};
use prisguide_storage::FetchError;
use thiserror::Error;

pub mod api;
pub mod extract;
pub mod normalize;
pub mod provider_file;
pub mod scraping;
pub mod seed;

pub use api::ApiFetcher;
pub use extract::{ExtractionRules, Extractor, FieldKind};
pub use provider_file::{parse_provider_file, ProviderFile, ProviderLine};
pub use scraping::ScrapingFetcher;

pub const CRATE_NAME: &str = "prisguide-adapters";

/// Failure of a single fetch attempt. Always surfaced to the caller, never retried here.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unusable response from {url}: {message}")]
    Parse { url: String, message: String },
    #[error("endpoint {endpoint} is misconfigured: {message}")]
    Config { endpoint: String, message: String },
    /// The fetch failed; `seed` holds placeholder records the caller may show in degraded mode.
    #[error("{cause}")]
    Degraded {
        cause: Box<AdapterError>,
        seed: Vec<SourceRecord>,
    },
}

impl AdapterError {
    pub fn parse(url: &str, message: impl Into<String>) -> Self {
        AdapterError::Parse {
            url: url.to_string(),
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            AdapterError::Fetch(err) => err.is_timeout(),
            AdapterError::Degraded { cause, .. } => cause.is_timeout(),
            _ => false,
        }
    }

    pub fn seed(&self) -> Option<&[SourceRecord]> {
        match self {
            AdapterError::Degraded { seed, .. } if !seed.is_empty() => Some(seed),
            _ => None,
        }
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    fn kind(&self) -> EndpointKind;

    /// Fetches `url` using `endpoint`'s settings. Used for the primary url and fallback urls alike.
    async fn fetch_url(&self, endpoint: &Endpoint, url: &str) -> Result<Vec<SourceRecord>, AdapterError>;

    async fn fetch(&self, endpoint: &Endpoint) -> Result<Vec<SourceRecord>, AdapterError> {
        self.fetch_url(endpoint, &endpoint.url).await
    }
}

/// One fetcher per endpoint kind.
#[derive(Clone)]
pub struct Fetchers {
    pub api: Arc<dyn Fetcher>,
    pub scraping: Arc<dyn Fetcher>,
}

impl Fetchers {
    pub fn new(api: Arc<dyn Fetcher>, scraping: Arc<dyn Fetcher>) -> Self {
        Self { api, scraping }
    }

    pub fn for_kind(&self, kind: EndpointKind) -> &Arc<dyn Fetcher> {
        match kind {
            EndpointKind::Api => &self.api,
            EndpointKind::Scraping => &self.scraping,
        }
    }
}

impl std::fmt::Debug for Fetchers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetchers")
            .field("api", &self.api.kind())
            .field("scraping", &self.scraping.kind())
            .finish()
    }
}
