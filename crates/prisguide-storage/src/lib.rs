//! Persistence interface + HTTP document fetch utilities.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prisguide_core::{
    Category, ContentFingerprint, ExecutionLogEntry, FingerprintRecord, ImportLogEntry,
    StoredProvider,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod http;
pub mod memory;
pub mod postgres;

pub use http::{
    browser_headers, DocumentFetcher, FetchError, HttpClientConfig, HttpDocumentFetcher,
    ProxyDocumentFetcher,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "prisguide-storage";

/// Generic persistence failure. The pipeline never inspects more than the message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("store error: {message}")]
pub struct StoreError {
    pub message: String,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::new(err.to_string())
    }
}

/// Endpoint exactly as the store holds it. Only the registry turns this into an `Endpoint`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRow {
    pub id: Uuid,
    pub name: String,
    pub category: String,
    pub kind: String,
    pub url: String,
    pub priority: i32,
    pub is_active: bool,
    pub auth_required: bool,
    pub auth_config: Option<serde_json::Value>,
    pub scraping_config: Option<serde_json::Value>,
    pub total_requests: i64,
    pub failure_count: i64,
    pub success_rate: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn find_provider_by_name_and_category(
        &self,
        name: &str,
        category: Category,
    ) -> Result<Option<StoredProvider>, StoreError>;

    /// Returns `false` when another writer already owns the (name, category) key.
    async fn insert_provider(&self, provider: &StoredProvider) -> Result<bool, StoreError>;

    async fn update_provider(&self, provider: &StoredProvider) -> Result<(), StoreError>;

    async fn find_fingerprint(
        &self,
        provider_id: Uuid,
        hash: &ContentFingerprint,
    ) -> Result<Option<FingerprintRecord>, StoreError>;

    /// Returns `false` when the fingerprint was already recorded for the provider.
    async fn insert_fingerprint(&self, fingerprint: &FingerprintRecord) -> Result<bool, StoreError>;

    /// Active rows for the category, ascending by priority.
    async fn list_active_endpoints(&self, category: Category) -> Result<Vec<EndpointRow>, StoreError>;

    async fn get_endpoint(&self, id: Uuid) -> Result<Option<EndpointRow>, StoreError>;

    /// Returns `false` when an endpoint with the same (category, url) exists.
    async fn insert_endpoint(&self, endpoint: &EndpointRow) -> Result<bool, StoreError>;

    /// Single atomic update of the rolling counters for one endpoint.
    async fn update_endpoint_stats(
        &self,
        endpoint_id: Uuid,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn insert_execution_log(&self, entry: &ExecutionLogEntry) -> Result<(), StoreError>;

    async fn insert_import_log(&self, entry: &ImportLogEntry) -> Result<(), StoreError>;

    /// Newest first.
    async fn recent_execution_logs(&self, limit: usize) -> Result<Vec<ExecutionLogEntry>, StoreError>;
}
