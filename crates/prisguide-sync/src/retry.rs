//! Retry/fallback orchestration over a category's endpoints.
//!
//! Endpoints are tried strictly in priority order. Each gets its retry budget
//! with exponential backoff, then its fallback urls once each, before the run
//! moves on. This is the only retry loop in the workspace.

use std::time::{Duration, Instant};

use chrono::Utc;
use prisguide_adapters::{AdapterError, Fetchers};
use prisguide_core::{Category, Endpoint, ExecutionStatus, ExecutionType, SourceRecord};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::registry::EndpointRegistry;
use crate::telemetry::{log_entry, ExecutionLogger};

/// Every endpoint of a category, fallback urls included, failed to produce records.
#[derive(Debug, Error)]
#[error("all {endpoints} endpoint(s) for {category} exhausted after {attempts} attempt(s): {last_error}")]
pub struct AggregateFetchError {
    pub category: Category,
    pub endpoints: usize,
    pub last_error: String,
    pub attempts: u32,
    pub retried_count: u32,
    /// The last failure was a timeout.
    pub timed_out: bool,
    /// Placeholder records from the most recent degraded API failure.
    pub degraded: Option<Vec<SourceRecord>>,
}

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error(transparent)]
    Exhausted(#[from] AggregateFetchError),
    #[error("run cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32, retried_count: u32 },
}

/// Records from the first endpoint that produced any.
#[derive(Debug, Clone)]
pub struct FallbackOutcome {
    pub endpoint: Endpoint,
    pub url: String,
    pub records: Vec<SourceRecord>,
    pub used_fallback: bool,
    pub attempts: u32,
    pub retried_count: u32,
}

enum State {
    TryEndpoint(usize),
    Success(FallbackOutcome),
    AllExhausted,
}

#[derive(Debug, Default)]
struct Tally {
    attempts: u32,
    retried_count: u32,
    last_error: Option<String>,
    timed_out: bool,
    degraded: Option<Vec<SourceRecord>>,
}

impl Tally {
    fn cancelled(&self) -> FallbackError {
        FallbackError::Cancelled {
            attempts: self.attempts,
            retried_count: self.retried_count,
        }
    }
}

/// Sleeps for `delay` unless `cancel` fires first. Returns `false` when cancelled.
pub async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[derive(Clone)]
pub struct RetryFallbackOrchestrator {
    registry: EndpointRegistry,
    fetchers: Fetchers,
    logger: ExecutionLogger,
    config: PipelineConfig,
}

impl RetryFallbackOrchestrator {
    pub fn new(
        registry: EndpointRegistry,
        fetchers: Fetchers,
        logger: ExecutionLogger,
        config: PipelineConfig,
    ) -> Self {
        Self {
            registry,
            fetchers,
            logger,
            config,
        }
    }

    /// Drives `endpoints` (already in priority order) until one yields records.
    pub async fn run(
        &self,
        category: Category,
        endpoints: &[Endpoint],
        trigger: ExecutionType,
        cancel: &CancellationToken,
    ) -> Result<FallbackOutcome, FallbackError> {
        let mut tally = Tally::default();
        let mut state = State::TryEndpoint(0);

        loop {
            state = match state {
                State::TryEndpoint(i) if i >= endpoints.len() => State::AllExhausted,
                State::TryEndpoint(i) => {
                    if i > 0 && !pause(self.config.endpoint_cooldown, cancel).await {
                        return Err(tally.cancelled());
                    }
                    match self
                        .try_endpoint(&endpoints[i], i, trigger, &mut tally, cancel)
                        .await?
                    {
                        Some(outcome) => State::Success(outcome),
                        None => {
                            info!(
                                %category,
                                endpoint = %endpoints[i].name,
                                remaining = endpoints.len() - i - 1,
                                "endpoint exhausted"
                            );
                            State::TryEndpoint(i + 1)
                        }
                    }
                }
                State::Success(outcome) => return Ok(outcome),
                State::AllExhausted => {
                    let last_error = tally
                        .last_error
                        .take()
                        .unwrap_or_else(|| "no active endpoints configured".to_string());
                    return Err(AggregateFetchError {
                        category,
                        endpoints: endpoints.len(),
                        last_error,
                        attempts: tally.attempts,
                        retried_count: tally.retried_count,
                        timed_out: tally.timed_out,
                        degraded: tally.degraded.take(),
                    }
                    .into());
                }
            };
        }
    }

    async fn try_endpoint(
        &self,
        endpoint: &Endpoint,
        index: usize,
        trigger: ExecutionType,
        tally: &mut Tally,
        cancel: &CancellationToken,
    ) -> Result<Option<FallbackOutcome>, FallbackError> {
        let execution_type = if index > 0 {
            ExecutionType::Fallback
        } else {
            trigger
        };

        for attempt in 0..endpoint.max_retries() {
            if attempt > 0 {
                let delay = self.config.retry.delay_for_attempt(attempt - 1);
                debug!(endpoint = %endpoint.name, attempt, delay_ms = delay.as_millis() as u64, "backing off");
                if !pause(delay, cancel).await {
                    return Err(tally.cancelled());
                }
            } else if cancel.is_cancelled() {
                return Err(tally.cancelled());
            }

            let Some(records) = self
                .attempt(endpoint, &endpoint.url, execution_type, tally, cancel)
                .await
            else {
                return Err(tally.cancelled());
            };
            if !records.is_empty() {
                return Ok(Some(self.outcome(endpoint, &endpoint.url, records, index > 0, tally)));
            }
        }

        for url in endpoint.fallback_urls() {
            if cancel.is_cancelled() {
                return Err(tally.cancelled());
            }
            let Some(records) = self
                .attempt(endpoint, url, ExecutionType::Fallback, tally, cancel)
                .await
            else {
                return Err(tally.cancelled());
            };
            if !records.is_empty() {
                return Ok(Some(self.outcome(endpoint, url, records, true, tally)));
            }
        }

        Ok(None)
    }

    fn outcome(
        &self,
        endpoint: &Endpoint,
        url: &str,
        records: Vec<SourceRecord>,
        used_fallback: bool,
        tally: &Tally,
    ) -> FallbackOutcome {
        FallbackOutcome {
            endpoint: endpoint.clone(),
            url: url.to_string(),
            records,
            used_fallback,
            attempts: tally.attempts,
            retried_count: tally.retried_count,
        }
    }

    /// One fetch call: updates stats and writes one log entry. Empty on any failure.
    /// `None` when `cancel` fired while the fetch was in flight; nothing is recorded then.
    async fn attempt(
        &self,
        endpoint: &Endpoint,
        url: &str,
        execution_type: ExecutionType,
        tally: &mut Tally,
        cancel: &CancellationToken,
    ) -> Option<Vec<SourceRecord>> {
        tally.attempts += 1;
        let started = Instant::now();
        let fetcher = self.fetchers.for_kind(endpoint.kind);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(endpoint = %endpoint.name, url, "fetch abandoned on cancellation");
                return None;
            }
            result = fetcher.fetch_url(endpoint, url) => result,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let (status, records, error) = match result {
            Ok(records) if !records.is_empty() => (ExecutionStatus::Success, records, None),
            Ok(_) => (
                ExecutionStatus::Failure,
                Vec::new(),
                Some(format!("{url} returned no records")),
            ),
            Err(err) => {
                if let Some(seed) = err.seed() {
                    tally.degraded = Some(seed.to_vec());
                }
                let status = if err.is_timeout() {
                    ExecutionStatus::Timeout
                } else {
                    ExecutionStatus::Error
                };
                (status, Vec::new(), Some(describe(&err)))
            }
        };

        let success = status == ExecutionStatus::Success;
        if let Some(message) = &error {
            tally.retried_count += 1;
            tally.timed_out = status == ExecutionStatus::Timeout;
            tally.last_error = Some(message.clone());
            warn!(
                category = %endpoint.category,
                endpoint = %endpoint.name,
                url,
                attempt = tally.attempts,
                status = status.as_str(),
                error = %message,
                "fetch attempt failed"
            );
        }

        if let Err(err) = self.registry.record_attempt(endpoint.id, success, Utc::now()).await {
            warn!(endpoint_id = %endpoint.id, error = %err, "could not update endpoint stats");
        }

        let mut entry = log_entry(endpoint.category, execution_type, status);
        entry.endpoint_id = Some(endpoint.id);
        entry.providers_fetched = records.len() as u32;
        entry.duration_ms = duration_ms;
        entry.error_message = error;
        self.logger.record(entry).await;

        Some(records)
    }
}

fn describe(err: &AdapterError) -> String {
    match err {
        AdapterError::Degraded { cause, .. } => cause.to_string(),
        other => other.to_string(),
    }
}
