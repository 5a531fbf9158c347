//! Execution log writer. Failures here are reported and counted, never returned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use prisguide_core::{Category, ExecutionLogEntry, ExecutionStatus, ExecutionType};
use prisguide_storage::{Store, StoreError};
use tracing::{debug, warn};
use uuid::Uuid;

/// Blank entry with zeroed counters; callers fill in what they know.
pub fn log_entry(
    category: Category,
    execution_type: ExecutionType,
    status: ExecutionStatus,
) -> ExecutionLogEntry {
    ExecutionLogEntry {
        id: Uuid::new_v4(),
        endpoint_id: None,
        category,
        execution_type,
        status,
        providers_fetched: 0,
        providers_saved: 0,
        duplicates_found: 0,
        duration_ms: 0,
        error_message: None,
        created_at: Utc::now(),
    }
}

#[derive(Clone)]
pub struct ExecutionLogger {
    store: Arc<dyn Store>,
    write_timeout: Duration,
    dropped: Arc<AtomicU64>,
}

impl ExecutionLogger {
    pub fn new(store: Arc<dyn Store>, write_timeout: Duration) -> Self {
        Self {
            store,
            write_timeout,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Appends one entry. A failed or slow write is logged and dropped.
    pub async fn record(&self, entry: ExecutionLogEntry) {
        let write = self.store.insert_execution_log(&entry);
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => debug!(
                category = %entry.category,
                status = entry.status.as_str(),
                "execution log written"
            ),
            Ok(Err(err)) => self.drop_entry(&entry, &err.to_string()),
            Err(_) => self.drop_entry(
                &entry,
                &format!("write timed out after {}ms", self.write_timeout.as_millis()),
            ),
        }
    }

    fn drop_entry(&self, entry: &ExecutionLogEntry, reason: &str) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            category = %entry.category,
            endpoint_id = ?entry.endpoint_id,
            status = entry.status.as_str(),
            reason,
            dropped,
            "execution log entry dropped"
        );
    }

    /// Entries lost to store failures since this logger was created.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<ExecutionLogEntry>, StoreError> {
        self.store.recent_execution_logs(limit).await
    }
}
