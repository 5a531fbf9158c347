//! Provider acquisition pipeline: registry, retry/fallback, reconciliation, execution logging.

use std::sync::Arc;

use anyhow::{Context, Result};
use prisguide_adapters::{ApiFetcher, ExtractionRules, Fetchers, ScrapingFetcher};
use prisguide_storage::{
    HttpClientConfig, HttpDocumentFetcher, PgStore, ProxyDocumentFetcher, Store,
};

pub mod config;
pub mod pipeline;
pub mod reconcile;
pub mod registry;
pub mod retry;
pub mod telemetry;

pub use config::{PipelineConfig, RetryPolicy, SyncConfig};
pub use pipeline::{BatchSummary, Pipeline, PipelineError};
pub use reconcile::{ReconcileAction, ReconcileOutcome, ReconcileReport, Reconciler};
pub use registry::{to_endpoint, EndpointRegistry, NewEndpoint, RegistryError};
pub use retry::{AggregateFetchError, FallbackError, FallbackOutcome, RetryFallbackOrchestrator};
pub use telemetry::ExecutionLogger;

pub const CRATE_NAME: &str = "prisguide-sync";

/// Real HTTP fetchers wired from configuration.
pub fn build_fetchers(config: &SyncConfig) -> Result<Fetchers> {
    let http = HttpDocumentFetcher::new(HttpClientConfig {
        user_agent: Some(config.user_agent.clone()),
        ..HttpClientConfig::default()
    })?;
    let proxy = ProxyDocumentFetcher::new(http.clone(), config.proxy_url.clone());
    let rules = ExtractionRules::norwegian_defaults().context("compiling extraction rules")?;

    let api = ApiFetcher::new(Arc::new(http.clone())).with_timeout(config.api_timeout());
    let scraping = ScrapingFetcher::new(Arc::new(http), Arc::new(rules))
        .with_proxy(Arc::new(proxy))
        .with_default_timeout(config.scrape_timeout());
    Ok(Fetchers::new(Arc::new(api), Arc::new(scraping)))
}

pub fn build_pipeline(config: &SyncConfig, store: Arc<dyn Store>) -> Result<Pipeline> {
    let fetchers = build_fetchers(config)?;
    Ok(Pipeline::new(store, fetchers, config.pipeline_config()))
}

/// Connects to `DATABASE_URL` and builds a pipeline over it.
pub async fn pipeline_from_env() -> Result<(SyncConfig, Pipeline)> {
    let config = SyncConfig::from_env();
    let store = PgStore::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", redact(&config.database_url)))?;
    let pipeline = build_pipeline(&config, Arc::new(store))?;
    Ok((config, pipeline))
}

/// Hides the password in a connection string before it is logged.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let creds = &url[scheme_end + 3..at];
            match creds.split_once(':') {
                Some((user, _)) => format!("{}{user}:***{}", &url[..scheme_end + 3], &url[at..]),
                None => url.to_string(),
            }
        }
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_password_only() {
        assert_eq!(
            redact("postgres://prisguide:hemmelig@db:5432/prisguide"),
            "postgres://prisguide:***@db:5432/prisguide"
        );
        assert_eq!(redact("postgres://db/prisguide"), "postgres://db/prisguide");
    }
}
