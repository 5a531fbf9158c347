//! In-process [`Store`] used by tests and dry runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prisguide_core::{
    name_key, Category, ContentFingerprint, EndpointStats, ExecutionLogEntry, FingerprintRecord,
    ImportLogEntry, StoredProvider,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{EndpointRow, Store, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    /// Keyed by (category, name_key), mirroring the unique index in Postgres.
    providers: HashMap<(Category, String), StoredProvider>,
    fingerprints: Vec<FingerprintRecord>,
    endpoints: Vec<EndpointRow>,
    execution_logs: Vec<ExecutionLogEntry>,
    import_logs: Vec<ImportLogEntry>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn providers(&self) -> Vec<StoredProvider> {
        let state = self.state.lock().await;
        let mut out = state.providers.values().cloned().collect::<Vec<_>>();
        out.sort_by(|a, b| (a.category, &a.name).cmp(&(b.category, &b.name)));
        out
    }

    pub async fn fingerprints(&self) -> Vec<FingerprintRecord> {
        self.state.lock().await.fingerprints.clone()
    }

    pub async fn execution_logs(&self) -> Vec<ExecutionLogEntry> {
        self.state.lock().await.execution_logs.clone()
    }

    pub async fn import_logs(&self) -> Vec<ImportLogEntry> {
        self.state.lock().await.import_logs.clone()
    }

    pub async fn endpoints(&self) -> Vec<EndpointRow> {
        self.state.lock().await.endpoints.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_provider_by_name_and_category(
        &self,
        name: &str,
        category: Category,
    ) -> Result<Option<StoredProvider>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.providers.get(&(category, name_key(name))).cloned())
    }

    async fn insert_provider(&self, provider: &StoredProvider) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let key = (provider.category, provider.name_key());
        if state.providers.contains_key(&key) {
            return Ok(false);
        }
        state.providers.insert(key, provider.clone());
        Ok(true)
    }

    async fn update_provider(&self, provider: &StoredProvider) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match state
            .providers
            .get_mut(&(provider.category, provider.name_key()))
        {
            Some(existing) if existing.id == provider.id => {
                *existing = provider.clone();
                Ok(())
            }
            _ => Err(StoreError::new(format!("provider {} not found", provider.id))),
        }
    }

    async fn find_fingerprint(
        &self,
        provider_id: Uuid,
        hash: &ContentFingerprint,
    ) -> Result<Option<FingerprintRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .fingerprints
            .iter()
            .find(|f| f.provider_id == provider_id && &f.hash == hash)
            .cloned())
    }

    async fn insert_fingerprint(&self, fingerprint: &FingerprintRecord) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let exists = state
            .fingerprints
            .iter()
            .any(|f| f.provider_id == fingerprint.provider_id && f.hash == fingerprint.hash);
        if exists {
            return Ok(false);
        }
        state.fingerprints.push(fingerprint.clone());
        Ok(true)
    }

    async fn list_active_endpoints(&self, category: Category) -> Result<Vec<EndpointRow>, StoreError> {
        let state = self.state.lock().await;
        let mut rows = state
            .endpoints
            .iter()
            .filter(|e| e.is_active && e.category == category.as_str())
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by_key(|e| (e.priority, e.created_at));
        Ok(rows)
    }

    async fn get_endpoint(&self, id: Uuid) -> Result<Option<EndpointRow>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.endpoints.iter().find(|e| e.id == id).cloned())
    }

    async fn insert_endpoint(&self, endpoint: &EndpointRow) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let exists = state
            .endpoints
            .iter()
            .any(|e| e.category == endpoint.category && e.url == endpoint.url);
        if exists {
            return Ok(false);
        }
        state.endpoints.push(endpoint.clone());
        Ok(true)
    }

    async fn update_endpoint_stats(
        &self,
        endpoint_id: Uuid,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let row = state
            .endpoints
            .iter_mut()
            .find(|e| e.id == endpoint_id)
            .ok_or_else(|| StoreError::new(format!("endpoint {endpoint_id} not found")))?;
        let mut stats = EndpointStats {
            total_requests: u64::try_from(row.total_requests).unwrap_or(0),
            failure_count: u64::try_from(row.failure_count).unwrap_or(0),
            success_rate: row.success_rate,
            last_success_at: row.last_success_at,
            last_failure_at: row.last_failure_at,
        };
        stats.record(success, at);
        row.total_requests = i64::try_from(stats.total_requests).unwrap_or(i64::MAX);
        row.failure_count = i64::try_from(stats.failure_count).unwrap_or(i64::MAX);
        row.success_rate = stats.success_rate;
        row.last_success_at = stats.last_success_at;
        row.last_failure_at = stats.last_failure_at;
        row.updated_at = at;
        Ok(())
    }

    async fn insert_execution_log(&self, entry: &ExecutionLogEntry) -> Result<(), StoreError> {
        self.state.lock().await.execution_logs.push(entry.clone());
        Ok(())
    }

    async fn insert_import_log(&self, entry: &ImportLogEntry) -> Result<(), StoreError> {
        self.state.lock().await.import_logs.push(entry.clone());
        Ok(())
    }

    async fn recent_execution_logs(&self, limit: usize) -> Result<Vec<ExecutionLogEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .execution_logs
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}
