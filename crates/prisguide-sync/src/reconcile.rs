//! Matches fetched records against stored providers by (name, category) and
//! decides insert / update / duplicate from content fingerprints.
//!
//! Concurrent runs are safe through the store's unique keys alone: a lost
//! insert race is re-read and treated as an existing provider.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use prisguide_core::{Category, ContentFingerprint, FingerprintRecord, SourceRecord, StoredProvider};
use prisguide_storage::{Store, StoreError};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileAction {
    Inserted,
    Updated,
    Duplicate,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileOutcome {
    pub name: String,
    pub action: ReconcileAction,
    pub provider_id: Option<Uuid>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub outcomes: Vec<ReconcileOutcome>,
    pub inserted: u32,
    pub updated: u32,
    pub duplicates: u32,
    pub failed: u32,
}

impl ReconcileReport {
    pub fn saved(&self) -> u32 {
        self.inserted + self.updated
    }

    fn push(&mut self, outcome: ReconcileOutcome) {
        match outcome.action {
            ReconcileAction::Inserted => self.inserted += 1,
            ReconcileAction::Updated => self.updated += 1,
            ReconcileAction::Duplicate => self.duplicates += 1,
            ReconcileAction::Failed => self.failed += 1,
        }
        self.outcomes.push(outcome);
    }

    /// First failure reason, prefixed with how many records failed.
    pub fn failure_summary(&self) -> Option<String> {
        let first = self.outcomes.iter().find_map(|o| o.error.as_deref())?;
        Some(format!("{} record(s) failed to persist; first: {first}", self.failed))
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Store>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Processes every record in order. A failing record never stops the rest.
    pub async fn reconcile(
        &self,
        category: Category,
        endpoint_id: Option<Uuid>,
        records: &[SourceRecord],
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for record in records {
            let outcome = match self.reconcile_one(category, endpoint_id, record).await {
                Ok((action, provider_id)) => ReconcileOutcome {
                    name: record.name.clone(),
                    action,
                    provider_id: Some(provider_id),
                    error: None,
                },
                Err(err) => {
                    warn!(%category, provider = %record.name, error = %err, "record not reconciled");
                    ReconcileOutcome {
                        name: record.name.clone(),
                        action: ReconcileAction::Failed,
                        provider_id: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            debug!(%category, provider = %outcome.name, action = ?outcome.action, "reconciled");
            report.push(outcome);
        }
        report
    }

    pub async fn reconcile_one(
        &self,
        category: Category,
        endpoint_id: Option<Uuid>,
        record: &SourceRecord,
    ) -> Result<(ReconcileAction, Uuid), StoreError> {
        if record.name.trim().is_empty() {
            return Err(StoreError::new("record has an empty provider name"));
        }
        if record.synthetic {
            return Err(StoreError::new("synthetic records are never persisted"));
        }

        let fingerprint = ContentFingerprint::of(record);
        let now = Utc::now();

        let existing = self
            .store
            .find_provider_by_name_and_category(&record.name, category)
            .await?;
        let existing = match existing {
            Some(provider) => provider,
            None => {
                let provider = StoredProvider::from_record(record, category, now);
                if self.store.insert_provider(&provider).await? {
                    self.record_fingerprint(provider.id, fingerprint, endpoint_id, now)
                        .await?;
                    return Ok((ReconcileAction::Inserted, provider.id));
                }
                // Another writer took the (name, category) key between our read and insert.
                self.store
                    .find_provider_by_name_and_category(&record.name, category)
                    .await?
                    .ok_or_else(|| {
                        StoreError::new(format!(
                            "provider {:?} conflicted on insert but cannot be read back",
                            record.name
                        ))
                    })?
            }
        };

        if self
            .store
            .find_fingerprint(existing.id, &fingerprint)
            .await?
            .is_some()
        {
            return Ok((ReconcileAction::Duplicate, existing.id));
        }

        // Row already holds this content; a concurrent insert has not recorded its fingerprint yet.
        if ContentFingerprint::of_provider(&existing) == fingerprint {
            self.record_fingerprint(existing.id, fingerprint, endpoint_id, now)
                .await?;
            return Ok((ReconcileAction::Duplicate, existing.id));
        }

        let mut updated = existing;
        updated.merge_record(record, now);
        self.store.update_provider(&updated).await?;
        let action = if self
            .record_fingerprint(updated.id, fingerprint, endpoint_id, now)
            .await?
        {
            ReconcileAction::Updated
        } else {
            ReconcileAction::Duplicate
        };
        Ok((action, updated.id))
    }

    /// Returns `false` when another run recorded the same fingerprint first.
    async fn record_fingerprint(
        &self,
        provider_id: Uuid,
        hash: ContentFingerprint,
        endpoint_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let inserted = self
            .store
            .insert_fingerprint(&FingerprintRecord {
                provider_id,
                hash,
                endpoint_id,
                recorded_at: at,
            })
            .await?;
        if !inserted {
            debug!(%provider_id, "fingerprint already recorded by a concurrent run");
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use prisguide_core::{ExecutionLogEntry, ImportLogEntry};
    use prisguide_storage::{EndpointRow, MemoryStore};

    /// Answers the first `stale_reads` provider lookups with `None`, as if another
    /// writer inserted the row right after we looked.
    struct StaleReadStore {
        inner: Arc<MemoryStore>,
        stale_reads: AtomicUsize,
    }

    impl StaleReadStore {
        fn new(inner: Arc<MemoryStore>) -> Self {
            Self {
                inner,
                stale_reads: AtomicUsize::new(1),
            }
        }
    }

    #[async_trait]
    impl Store for StaleReadStore {
        async fn find_provider_by_name_and_category(&self, name: &str, category: Category) -> Result<Option<StoredProvider>, StoreError> {
            let stale = self
                .stale_reads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if stale {
                return Ok(None);
            }
            self.inner.find_provider_by_name_and_category(name, category).await
        }
        async fn insert_provider(&self, provider: &StoredProvider) -> Result<bool, StoreError> {
            self.inner.insert_provider(provider).await
        }
        async fn update_provider(&self, provider: &StoredProvider) -> Result<(), StoreError> {
            self.inner.update_provider(provider).await
        }
        async fn find_fingerprint(&self, provider_id: Uuid, hash: &ContentFingerprint) -> Result<Option<FingerprintRecord>, StoreError> {
            self.inner.find_fingerprint(provider_id, hash).await
        }
        async fn insert_fingerprint(&self, fingerprint: &FingerprintRecord) -> Result<bool, StoreError> {
            self.inner.insert_fingerprint(fingerprint).await
        }
        async fn list_active_endpoints(&self, category: Category) -> Result<Vec<EndpointRow>, StoreError> {
            self.inner.list_active_endpoints(category).await
        }
        async fn get_endpoint(&self, id: Uuid) -> Result<Option<EndpointRow>, StoreError> {
            self.inner.get_endpoint(id).await
        }
        async fn insert_endpoint(&self, endpoint: &EndpointRow) -> Result<bool, StoreError> {
            self.inner.insert_endpoint(endpoint).await
        }
        async fn update_endpoint_stats(&self, id: Uuid, success: bool, at: DateTime<Utc>) -> Result<(), StoreError> {
            self.inner.update_endpoint_stats(id, success, at).await
        }
        async fn insert_execution_log(&self, entry: &ExecutionLogEntry) -> Result<(), StoreError> {
            self.inner.insert_execution_log(entry).await
        }
        async fn insert_import_log(&self, entry: &ImportLogEntry) -> Result<(), StoreError> {
            self.inner.insert_import_log(entry).await
        }
        async fn recent_execution_logs(&self, limit: usize) -> Result<Vec<ExecutionLogEntry>, StoreError> {
            self.inner.recent_execution_logs(limit).await
        }
    }

    fn record(name: &str, price: f64) -> SourceRecord {
        SourceRecord {
            name: name.into(),
            price,
            rating: 4.0,
            description: "Fiberbredbånd".into(),
            external_url: "https://www.altibox.no".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn insert_then_duplicate_then_update() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone());
        let endpoint = Some(Uuid::new_v4());

        let (first, id) = reconciler
            .reconcile_one(Category::Internet, endpoint, &record("Altibox", 649.0))
            .await
            .unwrap();
        assert_eq!(first, ReconcileAction::Inserted);

        let (again, same_id) = reconciler
            .reconcile_one(Category::Internet, endpoint, &record(" ALTIBOX", 649.0))
            .await
            .unwrap();
        assert_eq!(again, ReconcileAction::Duplicate);
        assert_eq!(same_id, id);
        assert_eq!(store.fingerprints().await.len(), 1);

        let (changed, _) = reconciler
            .reconcile_one(Category::Internet, endpoint, &record("Altibox", 599.0))
            .await
            .unwrap();
        assert_eq!(changed, ReconcileAction::Updated);
        let providers = store.providers().await;
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].price, 599.0);
        assert_eq!(providers[0].name, "Altibox");
        assert_eq!(store.fingerprints().await.len(), 2);
        assert!(store.fingerprints().await.iter().all(|f| f.endpoint_id == endpoint));
    }

    #[tokio::test]
    async fn reverting_to_an_earlier_version_is_a_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone());
        for price in [649.0, 599.0] {
            reconciler
                .reconcile_one(Category::Internet, None, &record("Altibox", price))
                .await
                .unwrap();
        }
        let (action, _) = reconciler
            .reconcile_one(Category::Internet, None, &record("Altibox", 649.0))
            .await
            .unwrap();
        assert_eq!(action, ReconcileAction::Duplicate);
    }

    #[tokio::test]
    async fn same_name_in_other_category_is_a_separate_provider() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone());
        let report = reconciler
            .reconcile(Category::Mobile, None, &[record("Telia", 299.0)])
            .await;
        assert_eq!(report.inserted, 1);
        let report = reconciler
            .reconcile(Category::Internet, None, &[record("Telia", 299.0)])
            .await;
        assert_eq!(report.inserted, 1);
        assert_eq!(store.providers().await.len(), 2);
    }

    #[tokio::test]
    async fn unusable_records_fail_without_stopping_the_batch() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone());
        let mut synthetic = record("Tibber", 39.0);
        synthetic.synthetic = true;
        let records = vec![record("  ", 1.0), synthetic, record("Fortum", 45.0)];

        let report = reconciler.reconcile(Category::Electricity, None, &records).await;
        assert_eq!(report.failed, 2);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.saved(), 1);
        assert!(report.failure_summary().unwrap().starts_with("2 record(s) failed"));
        assert_eq!(report.outcomes[2].action, ReconcileAction::Inserted);
    }

    #[tokio::test]
    async fn sub_cent_price_change_is_an_update() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone());
        reconciler
            .reconcile_one(Category::Electricity, None, &record("Tibber", 0.8734))
            .await
            .unwrap();
        let (action, _) = reconciler
            .reconcile_one(Category::Electricity, None, &record("Tibber", 0.8712))
            .await
            .unwrap();
        assert_eq!(action, ReconcileAction::Updated);
        assert_eq!(store.providers().await[0].price, 0.8712);
        assert_eq!(store.fingerprints().await.len(), 2);
    }

    #[tokio::test]
    async fn lost_insert_race_before_winner_records_fingerprint_is_a_duplicate() {
        let inner = Arc::new(MemoryStore::new());
        let winner = StoredProvider::from_record(&record("Altibox", 649.0), Category::Internet, Utc::now());
        assert!(inner.insert_provider(&winner).await.unwrap());

        let reconciler = Reconciler::new(Arc::new(StaleReadStore::new(inner.clone())));
        let (action, id) = reconciler
            .reconcile_one(Category::Internet, None, &record("Altibox", 649.0))
            .await
            .unwrap();
        assert_eq!(action, ReconcileAction::Duplicate);
        assert_eq!(id, winner.id);
        assert_eq!(inner.providers().await.len(), 1);
        assert_eq!(inner.fingerprints().await.len(), 1);
    }

    #[tokio::test]
    async fn lost_insert_race_after_winner_finished_is_a_duplicate() {
        let inner = Arc::new(MemoryStore::new());
        Reconciler::new(inner.clone())
            .reconcile_one(Category::Internet, None, &record("Altibox", 649.0))
            .await
            .unwrap();

        let report = Reconciler::new(Arc::new(StaleReadStore::new(inner.clone())))
            .reconcile(Category::Internet, None, &[record("Altibox", 649.0)])
            .await;
        assert_eq!(report.failed, 0);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.saved(), 0);
        assert_eq!(inner.providers().await.len(), 1);
        assert_eq!(inner.fingerprints().await.len(), 1);
    }

    #[tokio::test]
    async fn lost_insert_race_with_new_content_updates_the_winner() {
        let inner = Arc::new(MemoryStore::new());
        Reconciler::new(inner.clone())
            .reconcile_one(Category::Internet, None, &record("Altibox", 649.0))
            .await
            .unwrap();

        let (action, _) = Reconciler::new(Arc::new(StaleReadStore::new(inner.clone())))
            .reconcile_one(Category::Internet, None, &record("Altibox", 599.0))
            .await
            .unwrap();
        assert_eq!(action, ReconcileAction::Updated);
        let providers = inner.providers().await;
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].price, 599.0);
        assert_eq!(inner.fingerprints().await.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_reconcilers_insert_once() {
        let store = Arc::new(MemoryStore::new());
        let a = Reconciler::new(store.clone());
        let b = Reconciler::new(store.clone());
        let rec = record("Altibox", 649.0);

        let (first, second) = tokio::join!(
            a.reconcile_one(Category::Internet, None, &rec),
            b.reconcile_one(Category::Internet, None, &rec),
        );
        let actions = [first.unwrap().0, second.unwrap().0];
        assert!(actions.contains(&ReconcileAction::Inserted));
        assert!(actions.contains(&ReconcileAction::Duplicate));
        assert_eq!(store.providers().await.len(), 1);
        assert_eq!(store.fingerprints().await.len(), 1);
    }
}
