// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moray_config::DelegationConfig;
use moray_store::{now_ms, rusqlite::params, Store};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{validate_dag, DagError, DelegationBrief, DelegationRequest};

/// Orchestration job state machine.
///
/// `queued → running → {completed | failed | cancelled}`; a failed job may
/// re-queue while its attempt count allows.  `completed` and `cancelled`
/// are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Everything a job executor gets to work with.
pub struct JobContext {
    pub brief: DelegationBrief,
    pub session_id: String,
    /// 1-based invocation counter.
    pub attempt: u32,
    /// Signalled on upstream failure, per-job timeout, or shutdown.
    /// Executors check it on entry and before returning output.
    pub cancel: CancellationToken,
}

/// Runs one delegated job to completion, returning its report text.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<String>;
}

/// Final state of one job in the outcome report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: String,
    pub brief_id: String,
    pub title: String,
    pub state: JobState,
    pub attempt: u32,
    pub output: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationOutcome {
    pub jobs: Vec<JobReport>,
    pub summary: String,
    pub has_failures: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DelegationError {
    #[error("invalid delegation DAG: {0}")]
    InvalidDag(#[from] DagError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

struct JobRecord {
    job_id: String,
    brief: DelegationBrief,
    state: JobState,
    attempt: u32,
    output: Option<String>,
    error: Option<String>,
    remaining_deps: usize,
}

enum TaskOutcome {
    Done(String),
    Errored(String),
    TimedOut,
    Cancelled,
}

/// DAG scheduler for sub-agent jobs.
pub struct DelegationOrchestrator {
    store: Store,
    cfg: DelegationConfig,
    /// Consecutive failed runs; at the threshold the breaker opens and runs
    /// return immediately until a successful run closes it.
    consecutive_failures: AtomicU32,
    /// Parent of every job token; `shutdown` cancels the whole tree.
    root_cancel: CancellationToken,
}

impl DelegationOrchestrator {
    pub fn new(store: Store, cfg: DelegationConfig) -> Self {
        Self {
            store,
            cfg,
            consecutive_failures: AtomicU32::new(0),
            root_cancel: CancellationToken::new(),
        }
    }

    /// Cancel all in-flight jobs.  Intended for process shutdown.
    pub fn shutdown(&self) {
        self.root_cancel.cancel();
    }

    /// Run one delegation request to completion.
    ///
    /// Contract-violating requests (missing dependency, cycle) fail before
    /// any job row is written.  An open circuit breaker short-circuits with
    /// an empty job list and a `circuit-breaker` summary.
    pub async fn run_delegation(
        &self,
        request: DelegationRequest,
        executor: Arc<dyn JobExecutor>,
    ) -> Result<DelegationOutcome, DelegationError> {
        validate_dag(&request.briefs)?;

        let failures = self.consecutive_failures.load(Ordering::SeqCst);
        if failures >= self.cfg.failure_circuit_breaker_threshold {
            warn!(failures, "delegation circuit-breaker open; refusing run");
            return Ok(DelegationOutcome {
                jobs: Vec::new(),
                summary: format!(
                    "delegation suspended: circuit-breaker open after {failures} consecutive failed runs"
                ),
                has_failures: true,
            });
        }

        let outcome = self.schedule(&request, executor).await?;
        if outcome.has_failures {
            self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        } else {
            self.consecutive_failures.store(0, Ordering::SeqCst);
        }
        Ok(outcome)
    }

    async fn schedule(
        &self,
        request: &DelegationRequest,
        executor: Arc<dyn JobExecutor>,
    ) -> Result<DelegationOutcome, DelegationError> {
        let mut records: HashMap<String, JobRecord> = request
            .briefs
            .iter()
            .map(|b| {
                (
                    b.id.clone(),
                    JobRecord {
                        job_id: Uuid::new_v4().to_string(),
                        brief: b.clone(),
                        state: JobState::Queued,
                        attempt: 0,
                        output: None,
                        error: None,
                        remaining_deps: b.depends_on.len(),
                    },
                )
            })
            .collect();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for brief in &request.briefs {
            for dep in &brief.depends_on {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(brief.id.clone());
            }
        }

        let mut tasks: JoinSet<(String, TaskOutcome)> = JoinSet::new();
        let mut running = 0usize;

        loop {
            // Launch every ready job the concurrency cap allows.
            let ready: Vec<String> = records
                .values()
                .filter(|r| r.state == JobState::Queued && r.remaining_deps == 0)
                .map(|r| r.brief.id.clone())
                .collect();
            for brief_id in ready {
                if running >= self.cfg.max_concurrent_jobs.max(1) {
                    break;
                }
                let record = records.get_mut(&brief_id).unwrap();
                record.attempt += 1;
                record.state = JobState::Running;
                self.persist_job(record, &request.session_id).await?;
                self.record_event(&record.job_id, "running", None).await?;

                let token = self.root_cancel.child_token();
                let timeout = Duration::from_millis(
                    record
                        .brief
                        .constraints
                        .timeout_ms
                        .unwrap_or(self.cfg.default_job_timeout_ms),
                );
                let ctx = JobContext {
                    brief: record.brief.clone(),
                    session_id: request.session_id.clone(),
                    attempt: record.attempt,
                    cancel: token.clone(),
                };
                let exec = Arc::clone(&executor);
                let id = brief_id.clone();
                running += 1;
                tasks.spawn(async move {
                    // Before-execution check: a token signalled while the job
                    // sat in the queue means the executor never runs.
                    if ctx.cancel.is_cancelled() {
                        return (id, TaskOutcome::Cancelled);
                    }
                    let cancel = ctx.cancel.clone();
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => (id, TaskOutcome::Cancelled),
                        result = tokio::time::timeout(timeout, exec.run(ctx)) => {
                            let outcome = match result {
                                Err(_) => {
                                    token.cancel();
                                    TaskOutcome::TimedOut
                                }
                                Ok(Ok(output)) if token.is_cancelled() => {
                                    // Output arriving after cancellation is discarded.
                                    let _ = output;
                                    TaskOutcome::Cancelled
                                }
                                Ok(Ok(output)) => TaskOutcome::Done(output),
                                Ok(Err(e)) => TaskOutcome::Errored(sanitize(&e.to_string())),
                            };
                            (id, outcome)
                        }
                    }
                });
            }

            if running == 0 {
                break;
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            running -= 1;
            let (brief_id, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "delegated job task panicked");
                    continue;
                }
            };

            match outcome {
                TaskOutcome::Done(output) => {
                    let record = records.get_mut(&brief_id).unwrap();
                    record.state = JobState::Completed;
                    record.output = Some(output);
                    self.persist_job(record, &request.session_id).await?;
                    self.record_event(&record.job_id, "completed", None).await?;
                    debug!(brief = %brief_id, "job completed");
                    for dependent in dependents.get(&brief_id).cloned().unwrap_or_default() {
                        if let Some(dep_record) = records.get_mut(&dependent) {
                            dep_record.remaining_deps = dep_record.remaining_deps.saturating_sub(1);
                        }
                    }
                }
                TaskOutcome::Cancelled => {
                    let record = records.get_mut(&brief_id).unwrap();
                    record.state = JobState::Cancelled;
                    record.error = Some("cancelled".into());
                    self.persist_job(record, &request.session_id).await?;
                    self.record_event(&record.job_id, "cancelled", None).await?;
                    self.cascade_cancel(&brief_id, &dependents, &mut records, &request.session_id)
                        .await?;
                }
                failure @ (TaskOutcome::TimedOut | TaskOutcome::Errored(_)) => {
                    let error = match failure {
                        TaskOutcome::Errored(e) => e,
                        _ => "timed out".to_string(),
                    };
                    let record = records.get_mut(&brief_id).unwrap();
                    record.error = Some(error.clone());
                    if record.attempt <= self.cfg.max_retry_attempts {
                        info!(brief = %brief_id, attempt = record.attempt, "re-queueing failed job");
                        record.state = JobState::Queued;
                        self.persist_job(record, &request.session_id).await?;
                        self.record_event(&record.job_id, "retry", Some(error)).await?;
                    } else {
                        record.state = JobState::Failed;
                        self.persist_job(record, &request.session_id).await?;
                        self.record_event(&record.job_id, "failed", Some(error)).await?;
                        self.cascade_cancel(
                            &brief_id,
                            &dependents,
                            &mut records,
                            &request.session_id,
                        )
                        .await?;
                    }
                }
            }
        }

        // Whatever is still queued at loop exit was starved by a failed or
        // cancelled ancestor and never becomes ready.
        let stranded: Vec<String> = records
            .values()
            .filter(|r| !r.state.is_terminal())
            .map(|r| r.brief.id.clone())
            .collect();
        for brief_id in stranded {
            let record = records.get_mut(&brief_id).unwrap();
            record.state = JobState::Cancelled;
            record.error.get_or_insert_with(|| "upstream failed".into());
            self.persist_job(record, &request.session_id).await?;
            self.record_event(&record.job_id, "cancelled", None).await?;
        }

        // Report in submission order.
        let mut jobs = Vec::with_capacity(request.briefs.len());
        for brief in &request.briefs {
            let record = &records[&brief.id];
            jobs.push(JobReport {
                job_id: record.job_id.clone(),
                brief_id: brief.id.clone(),
                title: brief.title.clone(),
                state: record.state,
                attempt: record.attempt,
                output: record.output.clone(),
                error: record.error.clone(),
            });
        }
        let has_failures = jobs
            .iter()
            .any(|j| matches!(j.state, JobState::Failed | JobState::Cancelled));
        let summary = summarize(&jobs);
        Ok(DelegationOutcome {
            jobs,
            summary,
            has_failures,
        })
    }

    /// Mark every transitive descendant of `failed_id` cancelled.
    /// Descendants cannot be running (their dependencies never completed),
    /// so this is pure bookkeeping — their executors never start.
    async fn cascade_cancel(
        &self,
        failed_id: &str,
        dependents: &HashMap<String, Vec<String>>,
        records: &mut HashMap<String, JobRecord>,
        session_id: &str,
    ) -> anyhow::Result<()> {
        let mut stack: Vec<String> = dependents.get(failed_id).cloned().unwrap_or_default();
        while let Some(id) = stack.pop() {
            let record = records.get_mut(&id).unwrap();
            if record.state.is_terminal() {
                continue;
            }
            record.state = JobState::Cancelled;
            record.error = Some(format!("cancelled: upstream '{failed_id}' failed"));
            self.persist_job(record, session_id).await?;
            self.record_event(&record.job_id, "cancelled", Some(format!("upstream {failed_id}")))
                .await?;
            stack.extend(dependents.get(&id).cloned().unwrap_or_default());
        }
        Ok(())
    }

    async fn persist_job(&self, record: &JobRecord, session_id: &str) -> anyhow::Result<()> {
        let job_id = record.job_id.clone();
        let session = session_id.to_string();
        let brief_id = record.brief.id.clone();
        let title = record.brief.title.clone();
        let state = record.state.as_str();
        let attempt = record.attempt as i64;
        let output = record.output.clone();
        let error = record.error.clone();
        let started = matches!(record.state, JobState::Running).then(now_ms);
        let finished = record.state.is_terminal().then(now_ms);
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO orchestration_jobs
                     (id, session_id, brief_id, title, state, attempt, output, error,
                      created_at, started_at, finished_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT(id) DO UPDATE SET
                       state = ?5, attempt = ?6, output = ?7, error = ?8,
                       started_at = COALESCE(started_at, ?10),
                       finished_at = ?11",
                    params![
                        job_id,
                        session,
                        brief_id,
                        title,
                        state,
                        attempt,
                        output,
                        error,
                        now_ms(),
                        started,
                        finished,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn record_event(
        &self,
        job_id: &str,
        kind: &str,
        detail: Option<String>,
    ) -> anyhow::Result<()> {
        let job_id = job_id.to_string();
        let kind = kind.to_string();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO orchestration_events (job_id, kind, detail, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![job_id, kind, detail, now_ms()],
                )?;
                Ok(())
            })
            .await
    }
}

/// Human-readable per-job report: state, attempt, first line of output/error.
fn summarize(jobs: &[JobReport]) -> String {
    let mut lines = Vec::with_capacity(jobs.len() + 1);
    let completed = jobs
        .iter()
        .filter(|j| j.state == JobState::Completed)
        .count();
    lines.push(format!("{completed}/{} briefs completed", jobs.len()));
    for job in jobs {
        let detail = job
            .output
            .as_deref()
            .or(job.error.as_deref())
            .unwrap_or("")
            .lines()
            .next()
            .unwrap_or("");
        lines.push(format!(
            "- [{}] {} (attempt {}): {}",
            job.state.as_str(),
            job.title,
            job.attempt,
            detail
        ));
    }
    lines.join("\n")
}

fn sanitize(message: &str) -> String {
    message
        .split_whitespace()
        .map(|tok| {
            if tok.starts_with("sk-") || tok.starts_with("Bearer") {
                "[redacted]"
            } else {
                tok
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
