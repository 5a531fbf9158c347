//! Core domain model for the provider ingest pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "prisguide-core";

/// Retry budget used when an endpoint does not configure its own.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Rating assigned when a source gives none or an unparseable one.
pub const NEUTRAL_RATING: f64 = 3.5;

pub const MAX_RATING: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Electricity,
    Mobile,
    Internet,
    Insurance,
    Banking,
    HomeAlarm,
}

impl Category {
    /// Fixed iteration order used by batch runs.
    pub const ALL: [Category; 6] = [
        Category::Electricity,
        Category::Mobile,
        Category::Internet,
        Category::Insurance,
        Category::Banking,
        Category::HomeAlarm,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Electricity => "electricity",
            Category::Mobile => "mobile",
            Category::Internet => "internet",
            Category::Insurance => "insurance",
            Category::Banking => "banking",
            Category::HomeAlarm => "home-alarm",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "electricity" => Ok(Category::Electricity),
            "mobile" => Ok(Category::Mobile),
            "internet" | "broadband" => Ok(Category::Internet),
            "insurance" => Ok(Category::Insurance),
            "banking" => Ok(Category::Banking),
            "home-alarm" | "home_alarm" | "alarm" => Ok(Category::HomeAlarm),
            _ => Err(UnknownCategory(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndpointKind {
    Api,
    Scraping,
}

impl EndpointKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointKind::Api => "API",
            EndpointKind::Scraping => "SCRAPING",
        }
    }
}

impl FromStr for EndpointKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "API" => Ok(EndpointKind::Api),
            "SCRAPING" => Ok(EndpointKind::Scraping),
            other => Err(format!("unknown endpoint kind: {other}")),
        }
    }
}

/// Per-endpoint scraping settings, stored as JSON next to the endpoint row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapingConfig {
    /// Field name -> CSS selector.
    #[serde(default)]
    pub selectors: BTreeMap<String, String>,
    #[serde(default)]
    pub wait_time_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub fallback_urls: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Route the fetch through the proxying document fetcher.
    #[serde(default)]
    pub use_proxy: bool,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        Self {
            selectors: BTreeMap::new(),
            wait_time_ms: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            fallback_urls: Vec::new(),
            timeout_ms: None,
            use_proxy: false,
        }
    }
}

/// Rolling attempt statistics, mutated after every execution attempt.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EndpointStats {
    pub total_requests: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl EndpointStats {
    /// Applies one attempt outcome. Stores perform the same arithmetic atomically.
    pub fn record(&mut self, success: bool, at: DateTime<Utc>) {
        self.total_requests += 1;
        if success {
            self.last_success_at = Some(at);
        } else {
            self.failure_count += 1;
            self.last_failure_at = Some(at);
        }
        let successes = self.total_requests - self.failure_count;
        self.success_rate = successes as f64 / self.total_requests as f64;
    }
}

/// A configured source for one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: Uuid,
    pub name: String,
    pub category: Category,
    pub kind: EndpointKind,
    pub url: String,
    /// Lower is tried first.
    pub priority: i32,
    pub is_active: bool,
    pub auth_required: bool,
    pub auth_config: Option<serde_json::Value>,
    pub scraping_config: Option<ScrapingConfig>,
    pub stats: EndpointStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Endpoint {
    pub fn max_retries(&self) -> u32 {
        self.scraping_config
            .as_ref()
            .map(|c| c.max_retries)
            .unwrap_or(DEFAULT_MAX_RETRIES)
            .max(1)
    }

    pub fn fallback_urls(&self) -> &[String] {
        self.scraping_config
            .as_ref()
            .map(|c| c.fallback_urls.as_slice())
            .unwrap_or_default()
    }
}

/// Normalized provider shape every fetcher produces. Lives for one fetch-reconcile cycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceRecord {
    pub name: String,
    pub price: f64,
    pub rating: f64,
    pub description: String,
    pub external_url: String,
    pub organization_number: Option<String>,
    pub logo_url: Option<String>,
    #[serde(default)]
    pub pros: Vec<String>,
    #[serde(default)]
    pub cons: Vec<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    /// Placeholder data produced in degraded mode, never persisted.
    #[serde(default)]
    pub synthetic: bool,
}

impl SourceRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rating: NEUTRAL_RATING,
            ..Default::default()
        }
    }
}

/// Natural-key normalization of a provider name.
pub fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// SHA-256 digest over the normalized comparable fields of a [`SourceRecord`].
///
/// Only meaningful inside one (name, category) bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentFingerprint(String);

impl ContentFingerprint {
    pub fn of(record: &SourceRecord) -> Self {
        Self::digest(
            &record.name,
            record.price,
            record.rating,
            &record.description,
            &record.external_url,
            record.organization_number.as_deref(),
        )
    }

    /// Fingerprint of the content a stored provider currently holds.
    pub fn of_provider(provider: &StoredProvider) -> Self {
        Self::digest(
            &provider.name,
            provider.price,
            provider.rating,
            &provider.description,
            &provider.external_url,
            provider.organization_number.as_deref(),
        )
    }

    /// Numbers use the shortest round-trip form so any change in value changes the digest.
    fn digest(
        name: &str,
        price: f64,
        rating: f64,
        description: &str,
        external_url: &str,
        organization_number: Option<&str>,
    ) -> Self {
        let canonical = [
            name_key(name),
            canonical_number(price),
            canonical_number(rating),
            description.trim().to_lowercase(),
            external_url.trim().to_string(),
            organization_number.map(str::trim).unwrap_or_default().to_string(),
        ]
        .join("\u{1f}");

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn canonical_number(value: f64) -> String {
    // -0.0 and 0.0 compare equal and must hash equal.
    if value == 0.0 {
        "0".to_string()
    } else {
        value.to_string()
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fingerprint seen for a stored provider, with the endpoint that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub provider_id: Uuid,
    pub hash: ContentFingerprint,
    pub endpoint_id: Option<Uuid>,
    pub recorded_at: DateTime<Utc>,
}

/// Persisted, category-scoped provider keyed by (name, category).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredProvider {
    pub id: Uuid,
    pub name: String,
    pub category: Category,
    pub price: f64,
    pub rating: f64,
    pub description: String,
    pub external_url: String,
    pub organization_number: Option<String>,
    pub logo_url: Option<String>,
    pub pros: Vec<String>,
    pub cons: Vec<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredProvider {
    pub fn from_record(record: &SourceRecord, category: Category, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: record.name.trim().to_string(),
            category,
            price: record.price,
            rating: record.rating,
            description: record.description.clone(),
            external_url: record.external_url.clone(),
            organization_number: record.organization_number.clone(),
            logo_url: record.logo_url.clone(),
            pros: record.pros.clone(),
            cons: record.cons.clone(),
            phone: record.phone.clone(),
            email: record.email.clone(),
            address: record.address.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrites the mutable attributes with the incoming record. Identity fields stay.
    pub fn merge_record(&mut self, record: &SourceRecord, now: DateTime<Utc>) {
        self.price = record.price;
        self.rating = record.rating;
        self.description = record.description.clone();
        self.external_url = record.external_url.clone();
        self.organization_number = record.organization_number.clone();
        self.logo_url = record.logo_url.clone();
        self.pros = record.pros.clone();
        self.cons = record.cons.clone();
        self.phone = record.phone.clone();
        self.email = record.email.clone();
        self.address = record.address.clone();
        self.updated_at = now;
    }

    pub fn name_key(&self) -> String {
        name_key(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionType {
    Manual,
    Scheduled,
    Fallback,
}

impl ExecutionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionType::Manual => "manual",
            ExecutionType::Scheduled => "scheduled",
            ExecutionType::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failure,
    Timeout,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failure => "failure",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Error => "error",
        }
    }
}

/// Append-only telemetry row, one per endpoint attempt and one per category run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: Uuid,
    pub endpoint_id: Option<Uuid>,
    pub category: Category,
    pub execution_type: ExecutionType,
    pub status: ExecutionStatus,
    pub providers_fetched: u32,
    pub providers_saved: u32,
    pub duplicates_found: u32,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one bulk endpoint registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportLogEntry {
    pub id: Uuid,
    pub source: String,
    pub registered: u32,
    pub already_present: u32,
    pub skipped: u32,
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one category run as handed back to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub category: Category,
    pub success: bool,
    pub providers: Vec<SourceRecord>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub providers_fetched: u32,
    pub providers_saved: u32,
    pub duplicates_found: u32,
    pub failed_records: u32,
    pub used_fallback: bool,
    pub retried_count: u32,
    pub attempts: u32,
    /// Set when `providers` holds degraded-mode seed data.
    pub synthetic: bool,
    pub endpoint_id: Option<Uuid>,
}

impl ExecutionResult {
    pub fn failed(category: Category, error: impl Into<String>) -> Self {
        Self {
            category,
            success: false,
            providers: Vec::new(),
            error: Some(error.into()),
            execution_time_ms: 0,
            providers_fetched: 0,
            providers_saved: 0,
            duplicates_found: 0,
            failed_records: 0,
            used_fallback: false,
            retried_count: 0,
            attempts: 0,
            synthetic: false,
            endpoint_id: None,
        }
    }
}
