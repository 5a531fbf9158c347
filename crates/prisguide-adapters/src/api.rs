//! JSON API fetcher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prisguide_core::{Endpoint, EndpointKind, SourceRecord, NEUTRAL_RATING};
use prisguide_storage::DocumentFetcher;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};

use crate::normalize::{parse_price, parse_rating};
use crate::{seed, AdapterError, Fetcher};

pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(10);

/// Keys probed, in order, when the response body is an object instead of an array.
const WRAPPER_KEYS: &[&str] = &["providers", "companies", "data", "items", "results"];

const NAME_KEYS: &[&str] = &["name", "title", "company_name", "companyName", "provider", "navn"];
const PRICE_KEYS: &[&str] = &["price", "monthly_cost", "monthlyCost", "fee", "monthly_fee", "monthlyFee", "pris"];
const RATING_KEYS: &[&str] = &["rating", "score", "customer_rating", "customerRating"];
const DESCRIPTION_KEYS: &[&str] = &["description", "summary", "desc", "beskrivelse"];
const URL_KEYS: &[&str] = &["external_url", "externalUrl", "url", "website", "link"];
const ORG_KEYS: &[&str] = &["organization_number", "organizationNumber", "org_nr", "orgnr"];
const LOGO_KEYS: &[&str] = &["logo_url", "logoUrl", "logo", "image"];

pub struct ApiFetcher {
    documents: Arc<dyn DocumentFetcher>,
    timeout: Duration,
}

impl ApiFetcher {
    pub fn new(documents: Arc<dyn DocumentFetcher>) -> Self {
        Self {
            documents,
            timeout: DEFAULT_API_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn fetch_records(&self, endpoint: &Endpoint, url: &str) -> Result<Vec<SourceRecord>, AdapterError> {
        let mut headers = vec![("Accept".to_string(), "application/json".to_string())];
        headers.extend(auth_headers(endpoint)?);
        let body = self.documents.fetch(url, &headers, self.timeout).await?;
        parse_records(url, &body)
    }
}

#[async_trait]
impl Fetcher for ApiFetcher {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Api
    }

    async fn fetch_url(&self, endpoint: &Endpoint, url: &str) -> Result<Vec<SourceRecord>, AdapterError> {
        match self.fetch_records(endpoint, url).await {
            Ok(records) => {
                debug!(endpoint = %endpoint.name, count = records.len(), "api fetch parsed");
                Ok(records)
            }
            Err(err) => {
                warn!(endpoint = %endpoint.name, url, error = %err, "api fetch failed; attaching seed data");
                Err(AdapterError::Degraded {
                    cause: Box::new(err),
                    seed: seed::fallback_providers(endpoint.category),
                })
            }
        }
    }
}

/// Request headers derived from `authConfig` (`{"bearer": ..}` or `{"header": .., "value": ..}`).
pub fn auth_headers(endpoint: &Endpoint) -> Result<Vec<(String, String)>, AdapterError> {
    if !endpoint.auth_required {
        return Ok(Vec::new());
    }
    let config = endpoint.auth_config.as_ref().and_then(JsonValue::as_object);
    let bearer = config.and_then(|c| c.get("bearer")).and_then(JsonValue::as_str);
    let custom = config.and_then(|c| {
        let name = c.get("header").and_then(JsonValue::as_str)?;
        let value = c.get("value").and_then(JsonValue::as_str)?;
        Some((name.to_string(), value.to_string()))
    });

    match (bearer, custom) {
        (Some(token), _) => Ok(vec![("Authorization".to_string(), format!("Bearer {token}"))]),
        (None, Some(header)) => Ok(vec![header]),
        (None, None) => Err(AdapterError::Config {
            endpoint: endpoint.name.clone(),
            message: "authRequired is set but authConfig has no bearer or header/value".to_string(),
        }),
    }
}

/// Parses a provider list, accepting a bare array or one of the known wrapper objects.
pub fn parse_records(url: &str, body: &str) -> Result<Vec<SourceRecord>, AdapterError> {
    let value: JsonValue =
        serde_json::from_str(body).map_err(|e| AdapterError::parse(url, format!("invalid json: {e}")))?;

    let items = match &value {
        JsonValue::Array(items) => items,
        JsonValue::Object(map) => WRAPPER_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(JsonValue::as_array))
            .ok_or_else(|| {
                AdapterError::parse(url, format!("object has none of the keys {WRAPPER_KEYS:?}"))
            })?,
        other => {
            return Err(AdapterError::parse(
                url,
                format!("expected array or object, got {}", json_type(other)),
            ))
        }
    };

    let records = items
        .iter()
        .filter_map(|item| {
            let record = item.as_object().and_then(record_from_object);
            if record.is_none() {
                debug!(url, "skipping api item without a name");
            }
            record
        })
        .collect();
    Ok(records)
}

fn json_type(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn first<'a>(obj: &'a Map<String, JsonValue>, keys: &[&str]) -> Option<&'a JsonValue> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

fn first_string(obj: &Map<String, JsonValue>, keys: &[&str]) -> Option<String> {
    let text = match first(obj, keys)? {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn string_list(obj: &Map<String, JsonValue>, key: &str) -> Vec<String> {
    obj.get(key)
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(JsonValue::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn record_from_object(obj: &Map<String, JsonValue>) -> Option<SourceRecord> {
    let name = first_string(obj, NAME_KEYS)?;
    Some(SourceRecord {
        name,
        price: first(obj, PRICE_KEYS).map(parse_price).unwrap_or(0.0),
        rating: first(obj, RATING_KEYS).map(parse_rating).unwrap_or(NEUTRAL_RATING),
        description: first_string(obj, DESCRIPTION_KEYS).unwrap_or_default(),
        external_url: first_string(obj, URL_KEYS).unwrap_or_default(),
        organization_number: first_string(obj, ORG_KEYS),
        logo_url: first_string(obj, LOGO_KEYS),
        pros: string_list(obj, "pros"),
        cons: string_list(obj, "cons"),
        phone: first_string(obj, &["phone", "telefon"]),
        email: first_string(obj, &["email", "epost"]),
        address: first_string(obj, &["address", "adresse"]),
        synthetic: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use prisguide_core::{Category, EndpointStats};
    use serde_json::json;
    use uuid::Uuid;

    fn endpoint(auth_required: bool, auth_config: Option<JsonValue>) -> Endpoint {
        let now = Utc::now();
        Endpoint {
            id: Uuid::new_v4(),
            name: "strompris-api".into(),
            category: Category::Electricity,
            kind: EndpointKind::Api,
            url: "https://api.example.invalid/providers".into(),
            priority: 1,
            is_active: true,
            auth_required,
            auth_config,
            scraping_config: None,
            stats: EndpointStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn bare_array_with_aliased_fields() {
        let body = json!([
            { "title": "Tibber", "monthly_cost": "39,00 kr", "score": 4.6, "website": "https://tibber.com" },
            { "name": "Fortum", "fee": -3, "customer_rating": "great" }
        ])
        .to_string();
        let records = parse_records("u", &body).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "Tibber");
        assert_eq!(records[0].price, 39.0);
        assert_eq!(records[0].rating, 4.6);
        assert_eq!(records[0].external_url, "https://tibber.com");
        assert_eq!(records[1].price, 0.0);
        assert_eq!(records[1].rating, NEUTRAL_RATING);
    }

    #[test]
    fn wrapper_keys_are_probed_in_order() {
        let body = json!({ "meta": {}, "companies": [{ "name": "Ice", "orgnr": 985126212 }] }).to_string();
        let records = parse_records("u", &body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].organization_number.as_deref(), Some("985126212"));
    }

    #[test]
    fn unknown_shapes_are_parse_errors() {
        assert!(matches!(
            parse_records("u", r#"{"status":"ok"}"#),
            Err(AdapterError::Parse { .. })
        ));
        assert!(parse_records("u", "<html>").is_err());
        assert!(parse_records("u", "42").is_err());
    }

    #[test]
    fn nameless_items_are_skipped() {
        let body = json!([{ "price": 10 }, { "name": "  " }, { "name": "Telia", "pros": ["5G", ""] }]).to_string();
        let records = parse_records("u", &body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pros, vec!["5G".to_string()]);
    }

    #[test]
    fn auth_config_shapes() {
        assert!(auth_headers(&endpoint(false, None)).unwrap().is_empty());
        assert_eq!(
            auth_headers(&endpoint(true, Some(json!({ "bearer": "t0k" })))).unwrap(),
            vec![("Authorization".to_string(), "Bearer t0k".to_string())]
        );
        assert_eq!(
            auth_headers(&endpoint(true, Some(json!({ "header": "X-Api-Key", "value": "k" })))).unwrap(),
            vec![("X-Api-Key".to_string(), "k".to_string())]
        );
        assert!(matches!(
            auth_headers(&endpoint(true, Some(json!({})))),
            Err(AdapterError::Config { .. })
        ));
    }
}
