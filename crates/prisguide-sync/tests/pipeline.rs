use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prisguide_adapters::{seed, AdapterError, ExtractionRules, Fetcher, Fetchers, ScrapingFetcher};
use prisguide_core::{
    Category, ContentFingerprint, Endpoint, EndpointKind, ExecutionLogEntry, ExecutionStatus,
    ExecutionType, FingerprintRecord, ImportLogEntry, ScrapingConfig, SourceRecord, StoredProvider,
};
use prisguide_storage::{
    DocumentFetcher, EndpointRow, FetchError, MemoryStore, Store, StoreError,
};
use prisguide_sync::{NewEndpoint, Pipeline, PipelineConfig, PipelineError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Clone)]
enum Behavior {
    Records(Vec<SourceRecord>),
    Empty,
    Fail,
    Degraded,
}

/// Answers by url with a fixed behavior and remembers every call.
#[derive(Default)]
struct ScriptedFetcher {
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    fn set(&self, url: &str, behavior: Behavior) {
        self.behaviors.lock().unwrap().insert(url.to_string(), behavior);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Api
    }

    async fn fetch_url(&self, endpoint: &Endpoint, url: &str) -> Result<Vec<SourceRecord>, AdapterError> {
        self.calls.lock().unwrap().push(url.to_string());
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or(Behavior::Fail);
        let transport = || {
            AdapterError::Fetch(FetchError::HttpStatus {
                status: 503,
                url: url.to_string(),
            })
        };
        match behavior {
            Behavior::Records(records) => Ok(records),
            Behavior::Empty => Ok(Vec::new()),
            Behavior::Fail => Err(transport()),
            Behavior::Degraded => Err(AdapterError::Degraded {
                cause: Box::new(transport()),
                seed: seed::fallback_providers(endpoint.category),
            }),
        }
    }
}

/// Delegates to a MemoryStore but refuses to insert one provider name.
struct RejectingStore {
    inner: MemoryStore,
    reject: String,
}

#[async_trait]
impl Store for RejectingStore {
    async fn find_provider_by_name_and_category(&self, name: &str, category: Category) -> Result<Option<StoredProvider>, StoreError> {
        self.inner.find_provider_by_name_and_category(name, category).await
    }
    async fn insert_provider(&self, provider: &StoredProvider) -> Result<bool, StoreError> {
        if provider.name == self.reject {
            return Err(StoreError::new(format!("constraint violation for {}", provider.name)));
        }
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

fn provider(name: &str, price: f64) -> SourceRecord {
    SourceRecord {
        name: name.into(),
        price,
        rating: 4.0,
        description: format!("{name} abonnement"),
        external_url: format!("https://{}.no", name.to_lowercase().replace(' ', "")),
        ..Default::default()
    }
}

fn endpoint(name: &str, category: Category, url: &str, priority: i32) -> NewEndpoint {
    NewEndpoint {
        name: name.into(),
        category,
        kind: EndpointKind::Api,
        url: url.into(),
        priority,
        is_active: true,
        auth_required: false,
        auth_config: None,
        scraping_config: None,
    }
}

fn pipeline_over(store: Arc<dyn Store>, fetcher: Arc<ScriptedFetcher>, config: PipelineConfig) -> Pipeline {
    Pipeline::new(store, Fetchers::new(fetcher.clone(), fetcher), config)
}

async fn setup(endpoints: &[NewEndpoint]) -> (Arc<MemoryStore>, Arc<ScriptedFetcher>, Pipeline) {
    let store = Arc::new(MemoryStore::new());
    let fetcher = Arc::new(ScriptedFetcher::default());
    let pipeline = pipeline_over(store.clone(), fetcher.clone(), PipelineConfig::immediate());
    for e in endpoints {
        assert!(pipeline.registry().register_endpoint(e).await.unwrap());
    }
    (store, fetcher, pipeline)
}

#[tokio::test]
async fn repeated_identical_runs_only_find_duplicates() {
    let (store, fetcher, pipeline) =
        setup(&[endpoint("mobil-api", Category::Mobile, "https://api/mobil", 1)]).await;
    fetcher.set(
        "https://api/mobil",
        Behavior::Records(vec![provider("Telia", 299.0), provider("Ice", 249.0), provider("Talkmore", 199.0)]),
    );

    let first = pipeline.run_category("mobile").await.unwrap();
    assert!(first.success);
    assert_eq!((first.providers_fetched, first.providers_saved, first.duplicates_found), (3, 3, 0));
    let providers_after_first = store.providers().await;

    for _ in 0..2 {
        let again = pipeline.run_category("mobile").await.unwrap();
        assert!(again.success);
        assert_eq!(again.duplicates_found, again.providers_fetched);
        assert_eq!(again.providers_saved, 0);
    }
    assert_eq!(store.providers().await, providers_after_first);
    assert_eq!(store.fingerprints().await.len(), 3);
}

#[tokio::test]
async fn price_change_is_an_update_and_new_fingerprint() {
    let (store, fetcher, pipeline) =
        setup(&[endpoint("strom-api", Category::Electricity, "https://api/strom", 1)]).await;
    fetcher.set(
        "https://api/strom",
        Behavior::Records(vec![provider("Tibber", 39.0), provider("Fortum", 45.0)]),
    );
    pipeline.run_category("electricity").await.unwrap();

    fetcher.set(
        "https://api/strom",
        Behavior::Records(vec![provider("Tibber", 29.0), provider("Fortum", 45.0)]),
    );
    let result = pipeline.run_category("electricity").await.unwrap();
    assert_eq!(result.providers_saved, 1);
    assert_eq!(result.duplicates_found, 1);

    let tibber = store
        .find_provider_by_name_and_category("tibber", Category::Electricity)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tibber.price, 29.0);
    assert_eq!(store.fingerprints().await.len(), 3);
}

#[tokio::test]
async fn failing_first_endpoint_falls_back_to_second() {
    let (store, fetcher, pipeline) = setup(&[
        endpoint("P2", Category::Insurance, "https://p2", 2),
        endpoint("P1", Category::Insurance, "https://p1", 1),
    ])
    .await;
    fetcher.set("https://p1", Behavior::Fail);
    fetcher.set("https://p2", Behavior::Records(vec![provider("Gjensidige", 389.0)]));

    let result = pipeline.run_category("insurance").await.unwrap();
    assert!(result.success);
    assert!(result.used_fallback);
    assert_eq!(result.providers, vec![provider("Gjensidige", 389.0)]);
    assert_eq!(result.retried_count, 3);
    assert_eq!(result.attempts, 4);
    assert_eq!(
        fetcher.calls(),
        vec!["https://p1", "https://p1", "https://p1", "https://p2"]
    );

    let endpoints = store.endpoints().await;
    let p1 = endpoints.iter().find(|e| e.name == "P1").unwrap();
    let p2 = endpoints.iter().find(|e| e.name == "P2").unwrap();
    assert_eq!((p1.total_requests, p1.failure_count), (3, 3));
    assert_eq!((p2.total_requests, p2.failure_count), (1, 0));
    assert_eq!(result.endpoint_id, Some(p2.id));

    let logs = store.execution_logs().await;
    assert_eq!(logs.len(), 5);
    assert!(logs[..3]
        .iter()
        .all(|l| l.status == ExecutionStatus::Error && l.execution_type == ExecutionType::Manual));
    assert_eq!(logs[3].execution_type, ExecutionType::Fallback);
    assert_eq!(logs[3].status, ExecutionStatus::Success);
    let rollup = &logs[4];
    assert_eq!(rollup.execution_type, ExecutionType::Fallback);
    assert_eq!(rollup.providers_saved, 1);
}

#[tokio::test]
async fn fallback_urls_are_tried_once_after_retries() {
    let mut scraped = endpoint("Fjordkraft", Category::Electricity, "https://fjordkraft", 1);
    scraped.kind = EndpointKind::Scraping;
    scraped.scraping_config = Some(ScrapingConfig {
        max_retries: 2,
        fallback_urls: vec!["https://fjordkraft/a".into(), "https://fjordkraft/b".into()],
        ..ScrapingConfig::default()
    });
    let (_, fetcher, pipeline) = setup(&[scraped]).await;
    fetcher.set("https://fjordkraft", Behavior::Empty);
    fetcher.set("https://fjordkraft/a", Behavior::Fail);
    fetcher.set("https://fjordkraft/b", Behavior::Records(vec![provider("Fjordkraft", 49.0)]));

    let result = pipeline.run_category("electricity").await.unwrap();
    assert!(result.success);
    assert!(result.used_fallback);
    assert_eq!(result.attempts, 4);
    assert_eq!(result.retried_count, 3);
    assert_eq!(
        fetcher.calls(),
        vec!["https://fjordkraft", "https://fjordkraft", "https://fjordkraft/a", "https://fjordkraft/b"]
    );
}

#[tokio::test]
async fn rejected_record_does_not_abort_the_run() {
    let store = Arc::new(RejectingStore {
        inner: MemoryStore::new(),
        reject: "If".into(),
    });
    let fetcher = Arc::new(ScriptedFetcher::default());
    let pipeline = pipeline_over(store.clone(), fetcher.clone(), PipelineConfig::immediate());
    pipeline
        .registry()
        .register_endpoint(&endpoint("forsikring", Category::Insurance, "https://api/forsikring", 1))
        .await
        .unwrap();
    fetcher.set(
        "https://api/forsikring",
        Behavior::Records(vec![provider("Gjensidige", 389.0), provider("If", 359.0), provider("Tryg", 375.0)]),
    );

    let result = pipeline.run_category("insurance").await.unwrap();
    assert!(result.success);
    assert_eq!(result.providers_fetched, 3);
    assert_eq!(result.providers_saved, 2);
    assert_eq!(result.failed_records, 1);
    assert!(result.error.unwrap().contains("constraint violation for If"));

    let names = store
        .inner
        .providers()
        .await
        .into_iter()
        .map(|p| p.name)
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["Gjensidige", "Tryg"]);
}

#[tokio::test]
async fn batch_continues_past_a_failed_category() {
    let endpoints = Category::ALL
        .iter()
        .map(|c| endpoint(c.as_str(), *c, &format!("https://api/{c}"), 1))
        .collect::<Vec<_>>();
    let (_, fetcher, pipeline) = setup(&endpoints).await;
    for category in Category::ALL {
        fetcher.set(
            &format!("https://api/{category}"),
            Behavior::Records(vec![provider(&format!("{category} AS"), 100.0)]),
        );
    }
    fetcher.set("https://api/internet", Behavior::Fail);

    let summary = pipeline.run_all_categories().await;
    assert_eq!(summary.results.len(), 6);
    let order = summary.results.iter().map(|r| r.category).collect::<Vec<_>>();
    assert_eq!(order, Category::ALL.to_vec());
    for (i, result) in summary.results.iter().enumerate() {
        assert_eq!(result.success, i != 2, "{}", result.category);
    }
    assert!(summary.results[2].error.as_deref().unwrap().contains("exhausted"));
    assert_eq!(summary.successful_categories, 5);
    assert_eq!(summary.total_fetched, 5);
    assert_eq!(summary.total_saved, 5);
    assert_eq!(summary.fallback_categories, 0);
}

#[tokio::test]
async fn no_endpoints_is_a_failed_result_and_unknown_category_an_error() {
    let (store, fetcher, pipeline) = setup(&[]).await;
    let result = pipeline.run_category("banking").await.unwrap();
    assert!(!result.success);
    assert_eq!(result.attempts, 0);
    assert!(result.error.unwrap().contains("no active endpoints"));
    assert!(fetcher.calls().is_empty());
    assert_eq!(store.execution_logs().await.len(), 1);

    assert!(matches!(
        pipeline.run_category("groceries").await,
        Err(PipelineError::UnknownCategory(_))
    ));
}

#[tokio::test]
async fn degraded_seed_is_only_returned_when_accepted() {
    for accept in [false, true] {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(ScriptedFetcher::default());
        let config = PipelineConfig {
            accept_degraded: accept,
            ..PipelineConfig::immediate()
        };
        let pipeline = pipeline_over(store.clone(), fetcher.clone(), config);
        pipeline
            .registry()
            .register_endpoint(&endpoint("alarm-api", Category::HomeAlarm, "https://api/alarm", 1))
            .await
            .unwrap();
        fetcher.set("https://api/alarm", Behavior::Degraded);

        let result = pipeline.run_category("home-alarm").await.unwrap();
        assert!(!result.success);
        assert_eq!(result.synthetic, accept);
        assert_eq!(result.used_fallback, accept);
        assert_eq!(result.providers.is_empty(), !accept);
        assert!(result.providers.iter().all(|p| p.synthetic));
        assert!(store.providers().await.is_empty());
    }
}

#[tokio::test]
async fn cancelled_run_makes_no_attempts() {
    let (_, fetcher, pipeline) =
        setup(&[endpoint("bank-api", Category::Banking, "https://api/bank", 1)]).await;
    fetcher.set("https://api/bank", Behavior::Records(vec![provider("DNB", 0.0)]));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = pipeline
        .run_category_with(Category::Banking, ExecutionType::Scheduled, &cancel)
        .await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("run cancelled"));
    assert!(fetcher.calls().is_empty());
}

/// Serves one fixed page for every url.
struct StaticPage(&'static str);

#[async_trait]
impl DocumentFetcher for StaticPage {
    async fn fetch(&self, _: &str, _: &[(String, String)], _: Duration) -> Result<String, FetchError> {
        Ok(self.0.to_string())
    }
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_a_scrape_settle_delay() {
    let store = Arc::new(MemoryStore::new());
    let rules = Arc::new(ExtractionRules::norwegian_defaults().unwrap());
    let scraping = Arc::new(ScrapingFetcher::new(
        Arc::new(StaticPage("<html><body><h1>Sector Alarm</h1></body></html>")),
        rules,
    ));
    let pipeline = Pipeline::new(
        store.clone(),
        Fetchers::new(Arc::new(ScriptedFetcher::default()), scraping),
        PipelineConfig::immediate(),
    );
    let mut slow = endpoint("alarm-page", Category::HomeAlarm, "https://alarm.example", 1);
    slow.kind = EndpointKind::Scraping;
    slow.scraping_config = Some(ScrapingConfig {
        wait_time_ms: 3_600_000,
        ..ScrapingConfig::default()
    });
    pipeline.registry().register_endpoint(&slow).await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let result = pipeline
        .run_category_with(Category::HomeAlarm, ExecutionType::Manual, &cancel)
        .await;

    assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("run cancelled"));
    assert!(store.providers().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn backoff_and_cooldown_follow_the_configured_schedule() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = Arc::new(ScriptedFetcher::default());
    let pipeline = pipeline_over(store.clone(), fetcher.clone(), PipelineConfig::default());
    for e in [
        endpoint("P1", Category::Mobile, "https://p1", 1),
        endpoint("P2", Category::Mobile, "https://p2", 2),
    ] {
        pipeline.registry().register_endpoint(&e).await.unwrap();
    }
    fetcher.set("https://p2", Behavior::Records(vec![provider("Ice", 249.0)]));

    let started = tokio::time::Instant::now();
    let result = pipeline.run_category("mobile").await.unwrap();
    let elapsed = started.elapsed();

    assert!(result.success);
    // 1s + 2s backoff on P1, then 1s cooldown before P2.
    assert!(elapsed >= Duration::from_millis(4_000), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(4_500), "{elapsed:?}");
}
