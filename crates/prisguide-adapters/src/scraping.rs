//! HTML scraping fetcher.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prisguide_core::{Endpoint, EndpointKind, SourceRecord, NEUTRAL_RATING};
use prisguide_storage::{browser_headers, DocumentFetcher};
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use crate::extract::{ExtractedFields, ExtractionRules, SelectorError};
use crate::normalize::{parse_price_str, parse_rating_str};
use crate::{AdapterError, Fetcher};

pub const DEFAULT_SCRAPE_TIMEOUT: Duration = Duration::from_secs(15);

pub struct ScrapingFetcher {
    direct: Arc<dyn DocumentFetcher>,
    proxy: Option<Arc<dyn DocumentFetcher>>,
    rules: Arc<ExtractionRules>,
    default_timeout: Duration,
}

impl ScrapingFetcher {
    pub fn new(direct: Arc<dyn DocumentFetcher>, rules: Arc<ExtractionRules>) -> Self {
        Self {
            direct,
            proxy: None,
            rules,
            default_timeout: DEFAULT_SCRAPE_TIMEOUT,
        }
    }

    /// Document fetcher used for endpoints with `useProxy` set.
    pub fn with_proxy(mut self, proxy: Arc<dyn DocumentFetcher>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

#[async_trait]
impl Fetcher for ScrapingFetcher {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Scraping
    }

    async fn fetch_url(&self, endpoint: &Endpoint, url: &str) -> Result<Vec<SourceRecord>, AdapterError> {
        let config = endpoint.scraping_config.clone().unwrap_or_default();
        let timeout = config
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let documents = if config.use_proxy {
            self.proxy.as_ref().ok_or_else(|| AdapterError::Config {
                endpoint: endpoint.name.clone(),
                message: "useProxy is set but no proxy fetcher is configured".to_string(),
            })?
        } else {
            &self.direct
        };

        let body = documents.fetch(url, &browser_headers(), timeout).await?;

        if config.wait_time_ms > 0 {
            tokio::time::sleep(Duration::from_millis(config.wait_time_ms)).await;
        }

        let records = extract_records(&endpoint.name, url, &body, &config.selectors, &self.rules)?;
        debug!(endpoint = %endpoint.name, url, count = records.len(), "scrape extracted");
        Ok(records)
    }
}

fn selector_config_error(endpoint: &str, err: SelectorError) -> AdapterError {
    AdapterError::Config {
        endpoint: endpoint.to_string(),
        message: err.to_string(),
    }
}

/// Turns a fetched document into records.
///
/// With an `item` selector every matching element is one listing entry and
/// entries without a name are dropped. Without it the whole page describes a
/// single provider, named by the `name` selector or after the endpoint.
pub fn extract_records(
    endpoint_name: &str,
    page_url: &str,
    html: &str,
    selectors: &BTreeMap<String, String>,
    rules: &ExtractionRules,
) -> Result<Vec<SourceRecord>, AdapterError> {
    let base = Url::parse(page_url).ok();
    let document = Html::parse_document(html);

    if let Some(item_selector) = selectors.get("item") {
        let item = Selector::parse(item_selector).map_err(|e| AdapterError::Config {
            endpoint: endpoint_name.to_string(),
            message: format!("invalid item selector {item_selector:?}: {e}"),
        })?;

        let mut records = Vec::new();
        for element in document.select(&item) {
            let mut fields = ExtractedFields::from_selectors(element, selectors, base.as_ref())
                .map_err(|e| selector_config_error(endpoint_name, e))?;
            fields.fill_from_patterns(rules, &element.html(), base.as_ref());
            if let Some(record) = to_record(fields, None, page_url) {
                records.push(record);
            }
        }
        return Ok(records);
    }

    let mut fields = ExtractedFields::from_selectors(document.root_element(), selectors, base.as_ref())
        .map_err(|e| selector_config_error(endpoint_name, e))?;
    fields.fill_from_patterns(rules, html, base.as_ref());
    Ok(to_record(fields, Some(endpoint_name), page_url)
        .into_iter()
        .collect())
}

fn to_record(fields: ExtractedFields, fallback_name: Option<&str>, page_url: &str) -> Option<SourceRecord> {
    let name = fields
        .name
        .or_else(|| fallback_name.map(str::to_string))
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())?;

    Some(SourceRecord {
        name,
        price: fields.price.as_deref().map(parse_price_str).unwrap_or(0.0),
        rating: fields
            .rating
            .as_deref()
            .map(parse_rating_str)
            .unwrap_or(NEUTRAL_RATING),
        description: fields.description.unwrap_or_default(),
        external_url: fields.link.unwrap_or_else(|| page_url.to_string()),
        organization_number: fields.organization_number,
        logo_url: fields.logo,
        pros: fields.pros,
        cons: fields.cons,
        phone: fields.phone,
        email: fields.email,
        address: fields.address,
        synthetic: false,
    })
}
