//! Category runs and the all-categories batch.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use prisguide_adapters::Fetchers;
use prisguide_core::{Category, ExecutionResult, ExecutionStatus, ExecutionType};
use prisguide_storage::Store;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::reconcile::Reconciler;
use crate::registry::EndpointRegistry;
use crate::retry::{pause, FallbackError, RetryFallbackOrchestrator};
use crate::telemetry::{log_entry, ExecutionLogger};

const CANCELLED: &str = "run cancelled";

/// Programmer errors only. Expected failures come back as a failed [`ExecutionResult`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown category: {0}")]
    UnknownCategory(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<ExecutionResult>,
    pub total_fetched: u32,
    pub total_saved: u32,
    pub total_duplicates: u32,
    pub successful_categories: u32,
    pub fallback_categories: u32,
}

impl BatchSummary {
    fn from_results(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        results: Vec<ExecutionResult>,
    ) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            total_fetched: results.iter().map(|r| r.providers_fetched).sum(),
            total_saved: results.iter().map(|r| r.providers_saved).sum(),
            total_duplicates: results.iter().map(|r| r.duplicates_found).sum(),
            successful_categories: results.iter().filter(|r| r.success).count() as u32,
            fallback_categories: results.iter().filter(|r| r.used_fallback).count() as u32,
            results,
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    registry: EndpointRegistry,
    orchestrator: RetryFallbackOrchestrator,
    reconciler: Reconciler,
    logger: ExecutionLogger,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(store: Arc<dyn Store>, fetchers: Fetchers, config: PipelineConfig) -> Self {
        let registry = EndpointRegistry::new(store.clone());
        let logger = ExecutionLogger::new(store.clone(), config.log_write_timeout);
        let orchestrator =
            RetryFallbackOrchestrator::new(registry.clone(), fetchers, logger.clone(), config);
        Self {
            registry,
            orchestrator,
            reconciler: Reconciler::new(store),
            logger,
            config,
        }
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn logger(&self) -> &ExecutionLogger {
        &self.logger
    }

    /// Manual run of one category by id. Fails only for an unknown id.
    pub async fn run_category(&self, category: &str) -> Result<ExecutionResult, PipelineError> {
        let category = category
            .parse::<Category>()
            .map_err(|e| PipelineError::UnknownCategory(e.0))?;
        Ok(self
            .run_category_with(category, ExecutionType::Manual, &CancellationToken::new())
            .await)
    }

    pub async fn run_category_with(
        &self,
        category: Category,
        trigger: ExecutionType,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let span = info_span!("run_category", %category, trigger = trigger.as_str());
        async {
            let started = Instant::now();
            let mut result = self.fetch_and_reconcile(category, trigger, cancel).await;
            result.execution_time_ms = started.elapsed().as_millis() as u64;

            let status = if result.success {
                ExecutionStatus::Success
            } else if result.error.as_deref() == Some(CANCELLED) {
                ExecutionStatus::Error
            } else {
                ExecutionStatus::Failure
            };
            let execution_type = if result.used_fallback {
                ExecutionType::Fallback
            } else {
                trigger
            };
            let mut entry = log_entry(category, execution_type, status);
            entry.endpoint_id = result.endpoint_id;
            entry.providers_fetched = result.providers_fetched;
            entry.providers_saved = result.providers_saved;
            entry.duplicates_found = result.duplicates_found;
            entry.duration_ms = result.execution_time_ms;
            entry.error_message = result.error.clone();
            self.logger.record(entry).await;

            info!(
                success = result.success,
                fetched = result.providers_fetched,
                saved = result.providers_saved,
                duplicates = result.duplicates_found,
                failed = result.failed_records,
                used_fallback = result.used_fallback,
                retried = result.retried_count,
                elapsed_ms = result.execution_time_ms,
                "category run finished"
            );
            result
        }
        .instrument(span)
        .await
    }

    async fn fetch_and_reconcile(
        &self,
        category: Category,
        trigger: ExecutionType,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let endpoints = match self.registry.active_endpoints(category).await {
            Ok(endpoints) => endpoints,
            Err(err) => {
                warn!(%category, error = %err, "endpoint lookup failed");
                return ExecutionResult::failed(category, err.to_string());
            }
        };

        match self
            .orchestrator
            .run(category, &endpoints, trigger, cancel)
            .await
        {
            Ok(outcome) => {
                let report = self
                    .reconciler
                    .reconcile(category, Some(outcome.endpoint.id), &outcome.records)
                    .await;
                ExecutionResult {
                    category,
                    success: true,
                    providers_fetched: outcome.records.len() as u32,
                    providers_saved: report.saved(),
                    duplicates_found: report.duplicates,
                    failed_records: report.failed,
                    error: report.failure_summary(),
                    providers: outcome.records,
                    execution_time_ms: 0,
                    used_fallback: outcome.used_fallback,
                    retried_count: outcome.retried_count,
                    attempts: outcome.attempts,
                    synthetic: false,
                    endpoint_id: Some(outcome.endpoint.id),
                }
            }
            Err(FallbackError::Exhausted(err)) => {
                warn!(%category, error = %err, "all endpoints exhausted");
                let mut result = ExecutionResult::failed(category, err.to_string());
                result.attempts = err.attempts;
                result.retried_count = err.retried_count;
                if let Some(seed) = err.degraded.filter(|_| self.config.accept_degraded) {
                    result.providers = seed;
                    result.used_fallback = true;
                    result.synthetic = true;
                }
                result
            }
            Err(FallbackError::Cancelled {
                attempts,
                retried_count,
            }) => {
                let mut result = ExecutionResult::failed(category, CANCELLED);
                result.attempts = attempts;
                result.retried_count = retried_count;
                result
            }
        }
    }

    pub async fn run_all_categories(&self) -> BatchSummary {
        self.run_all_with(ExecutionType::Manual, &CancellationToken::new())
            .await
    }

    /// Categories run one after another in a fixed order; a failed category never stops the batch.
    pub async fn run_all_with(&self, trigger: ExecutionType, cancel: &CancellationToken) -> BatchSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("run_all_categories", %run_id);
        async {
            let mut results = Vec::with_capacity(Category::ALL.len());
            for (i, category) in Category::ALL.into_iter().enumerate() {
                if i > 0 {
                    // A cancelled pause falls through; the run itself reports the cancellation.
                    pause(self.config.category_cooldown, cancel).await;
                }
                results.push(self.run_category_with(category, trigger, cancel).await);
            }
            let summary = BatchSummary::from_results(run_id, started_at, results);
            info!(
                fetched = summary.total_fetched,
                saved = summary.total_saved,
                duplicates = summary.total_duplicates,
                successful = summary.successful_categories,
                fallback = summary.fallback_categories,
                "batch finished"
            );
            summary
        }
        .instrument(span)
        .await
    }
}
