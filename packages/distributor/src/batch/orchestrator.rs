//! Parallel batch query execution.
//!
//! # Architecture
//!
//! ```text
//! submit() ──► validate ──► job store ──► spawned job task
//!                                             │
//!                                 sort by priority desc
//!                                             │
//!                                 Semaphore(min(max_parallel, ceiling))
//!                                             │
//!                                 resolver.resolve() per query
//!                                 (per-query timeout)
//!                                             │
//!                                 record outcome under query_id
//!                                             │
//!                                 finalize: publish batch_complete,
//!                                 fire-and-forget callback
//! ```
//!
//! An individual query error is recorded as that query's outcome and never
//! fails the batch. When the overall timeout elapses, in-flight waits are
//! cancelled, remaining queries are marked with a timeout error, and the
//! job finalizes as complete with partial results intact.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batch::export::{export_snapshot, ExportFormat};
use crate::batch::job::{BatchSnapshot, BatchStatus, QueryOutcome, QueryResult};
use crate::batch::query::Query;
use crate::bus::EventBus;
use crate::error::DistributionError;
use crate::event::{AnalysisEvent, EventType};
use crate::resolver::{QueryError, QueryResolver};

/// Orchestrator-wide limits.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Hard cap on per-batch parallelism regardless of what was requested.
    pub parallel_ceiling: usize,
    /// Timeout for a single resolver call.
    pub per_query_timeout: Duration,
    /// Maximum concurrently running batch jobs; submissions above this are
    /// rejected with a retryable error.
    pub max_in_flight: usize,
    /// Overall timeout applied when a submission does not specify one.
    pub default_overall_timeout: Duration,
    /// Timeout for the single best-effort callback notification.
    pub callback_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            parallel_ceiling: 8,
            per_query_timeout: Duration::from_secs(30),
            max_in_flight: 32,
            default_overall_timeout: Duration::from_secs(300),
            callback_timeout: Duration::from_secs(10),
        }
    }
}

/// Per-submission options.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub max_parallel: usize,
    pub overall_timeout: Option<Duration>,
    pub callback_url: Option<String>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            overall_timeout: None,
            callback_url: None,
        }
    }
}

struct JobMut {
    status: BatchStatus,
    finished_at: Option<DateTime<Utc>>,
    results: Vec<QueryResult>,
}

struct BatchJobState {
    batch_id: Uuid,
    submitted_at: DateTime<Utc>,
    max_parallel: usize,
    callback_url: Option<String>,
    queries: Vec<Query>,
    state: RwLock<JobMut>,
}

impl BatchJobState {
    async fn snapshot(&self) -> BatchSnapshot {
        let state = self.state.read().await;
        let completed = state.results.iter().filter(|r| r.outcome.is_some()).count();
        let succeeded = state
            .results
            .iter()
            .filter(|r| r.outcome.as_ref().map(QueryOutcome::is_success).unwrap_or(false))
            .count();
        BatchSnapshot {
            batch_id: self.batch_id,
            status: state.status,
            submitted_at: self.submitted_at,
            finished_at: state.finished_at,
            max_parallel: self.max_parallel,
            callback_url: self.callback_url.clone(),
            total_queries: self.queries.len(),
            completed_queries: completed,
            succeeded_queries: succeeded,
            results: state.results.clone(),
        }
    }

    /// Record a terminal outcome for one query and advance the status to
    /// `partial` when others remain pending.
    async fn record(&self, query_id: Uuid, outcome: QueryOutcome) {
        let mut state = self.state.write().await;
        let total = state.results.len();
        if let Some(result) = state.results.iter_mut().find(|r| r.query_id == query_id) {
            if result.outcome.is_none() {
                result.outcome = Some(outcome);
            }
        }
        let completed = state.results.iter().filter(|r| r.outcome.is_some()).count();
        if completed < total && !state.status.is_terminal() {
            state.status = BatchStatus::Partial;
        }
    }
}

struct OrchestratorInner {
    jobs: DashMap<Uuid, Arc<BatchJobState>>,
    in_flight: AtomicUsize,
    config: BatchConfig,
    bus: EventBus,
    resolver: Arc<dyn QueryResolver>,
    http: reqwest::Client,
}

/// Owns batch jobs and their worker pools.
#[derive(Clone)]
pub struct BatchOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl BatchOrchestrator {
    pub fn new(bus: EventBus, resolver: Arc<dyn QueryResolver>, config: BatchConfig) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                jobs: DashMap::new(),
                in_flight: AtomicUsize::new(0),
                config,
                bus,
                resolver,
                http: reqwest::Client::new(),
            }),
        }
    }

    /// Validate and accept a batch, spawning its job task.
    ///
    /// Malformed batches are rejected synchronously and never enter the
    /// queue. Submissions above the in-flight ceiling fail fast with a
    /// retryable error.
    pub fn submit(
        &self,
        queries: Vec<Query>,
        options: BatchOptions,
    ) -> Result<Uuid, DistributionError> {
        if queries.is_empty() {
            return Err(DistributionError::InvalidBatch(
                "batch contains no queries".to_string(),
            ));
        }
        for query in &queries {
            query
                .validate()
                .map_err(|reason| {
                    DistributionError::InvalidBatch(format!(
                        "query {}: {reason}",
                        query.query_id
                    ))
                })?;
        }

        let ceiling = self.inner.config.max_in_flight;
        let reserved = self
            .inner
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < ceiling).then_some(current + 1)
            });
        if reserved.is_err() {
            return Err(DistributionError::BatchBacklogFull {
                in_flight: ceiling,
                ceiling,
            });
        }

        let max_parallel = options
            .max_parallel
            .max(1)
            .min(self.inner.config.parallel_ceiling);
        let overall_timeout = options
            .overall_timeout
            .unwrap_or(self.inner.config.default_overall_timeout);

        let results = queries.iter().map(QueryResult::pending).collect();
        let job = Arc::new(BatchJobState {
            batch_id: Uuid::new_v4(),
            submitted_at: Utc::now(),
            max_parallel,
            callback_url: options.callback_url,
            queries,
            state: RwLock::new(JobMut {
                status: BatchStatus::Queued,
                finished_at: None,
                results,
            }),
        });

        let batch_id = job.batch_id;
        self.inner.jobs.insert(batch_id, job.clone());
        info!(
            batch_id = %batch_id,
            queries = job.queries.len(),
            max_parallel,
            "batch submitted"
        );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_job(inner, job, overall_timeout).await;
        });

        Ok(batch_id)
    }

    /// Point-in-time snapshot, including partial results mid-run.
    pub async fn status(&self, batch_id: Uuid) -> Result<BatchSnapshot, DistributionError> {
        let job = self
            .inner
            .jobs
            .get(&batch_id)
            .map(|entry| entry.clone())
            .ok_or(DistributionError::BatchNotFound(batch_id))?;
        Ok(job.snapshot().await)
    }

    /// Export the current snapshot in the requested format.
    pub async fn export(
        &self,
        batch_id: Uuid,
        format: ExportFormat,
    ) -> Result<Vec<u8>, DistributionError> {
        let snapshot = self.status(batch_id).await?;
        export_snapshot(&snapshot, format)
    }

    /// Number of batch jobs currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }
}

async fn run_job(inner: Arc<OrchestratorInner>, job: Arc<BatchJobState>, overall: Duration) {
    {
        let mut state = job.state.write().await;
        state.status = BatchStatus::Running;
    }

    // Higher priority dispatches first when parallelism is constrained.
    let mut ordered = job.queries.clone();
    ordered.sort_by_key(|q| std::cmp::Reverse(q.priority));

    let semaphore = Arc::new(Semaphore::new(job.max_parallel));
    let timed_out = {
        let job = job.clone();
        let inner = inner.clone();
        let execute = async move {
            let mut tasks: JoinSet<(Uuid, QueryOutcome)> = JoinSet::new();
            for query in ordered {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let resolver = inner.resolver.clone();
                let per_query = inner.config.per_query_timeout;
                tasks.spawn(async move {
                    let outcome =
                        match tokio::time::timeout(per_query, resolver.resolve(&query)).await {
                            Ok(Ok(value)) => QueryOutcome::Success { result: value },
                            Ok(Err(err)) => QueryOutcome::Error { error: err },
                            Err(_) => QueryOutcome::Error {
                                error: QueryError::Timeout {
                                    timeout_ms: per_query.as_millis() as u64,
                                },
                            },
                        };
                    drop(permit);
                    (query.query_id, outcome)
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((query_id, outcome)) => job.record(query_id, outcome).await,
                    Err(join_err) => {
                        // The query_id is unknown here; the finalize pass
                        // below records the missing outcome.
                        error!(error = %join_err, "batch query task failed");
                    }
                }
            }
        };
        tokio::time::timeout(overall, execute).await.is_err()
    };

    // Nothing is silently lost: every query ends with a recorded outcome.
    let unresolved: Vec<Uuid> = {
        let state = job.state.read().await;
        state
            .results
            .iter()
            .filter(|r| r.outcome.is_none())
            .map(|r| r.query_id)
            .collect()
    };
    for query_id in unresolved {
        let error = if timed_out {
            QueryError::Timeout {
                timeout_ms: overall.as_millis() as u64,
            }
        } else {
            QueryError::Upstream {
                message: "query task aborted".to_string(),
            }
        };
        job.record(query_id, QueryOutcome::Error { error }).await;
    }
    if timed_out {
        warn!(batch_id = %job.batch_id, "batch overall timeout elapsed");
    }

    {
        let mut state = job.state.write().await;
        state.status = BatchStatus::Complete;
        state.finished_at = Some(Utc::now());
    }
    inner.in_flight.fetch_sub(1, Ordering::SeqCst);

    let snapshot = job.snapshot().await;
    info!(
        batch_id = %job.batch_id,
        total = snapshot.total_queries,
        succeeded = snapshot.succeeded_queries,
        "batch complete"
    );

    inner.bus.publish(AnalysisEvent::new(
        EventType::BatchComplete,
        None,
        json!({
            "batch_id": job.batch_id,
            "status": snapshot.status,
            "total_queries": snapshot.total_queries,
            "succeeded_queries": snapshot.succeeded_queries,
            "failed_queries": snapshot.total_queries - snapshot.succeeded_queries,
        }),
    ));

    // Single best-effort notification; the webhook retry machinery does not
    // apply here.
    if let Some(url) = &job.callback_url {
        let result = inner
            .http
            .post(url)
            .json(&snapshot)
            .timeout(inner.config.callback_timeout)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!(batch_id = %job.batch_id, "batch callback delivered");
            }
            Ok(response) => {
                warn!(
                    batch_id = %job.batch_id,
                    status = %response.status(),
                    "batch callback rejected"
                );
            }
            Err(err) => {
                warn!(batch_id = %job.batch_id, error = %err, "batch callback failed");
            }
        }
    }
}
