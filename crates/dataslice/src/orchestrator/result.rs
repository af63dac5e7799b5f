//! Run results and progress reporting.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::schema::EntityType;
use crate::error::Result;

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Outcome of one completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub entity: EntityType,

    /// Rows written.
    pub rows: u64,

    /// File path or qualified table name.
    pub location: String,

    pub elapsed_seconds: f64,

    /// Deferred references patched after the job's group was written.
    #[serde(default)]
    pub deferred_updates: u64,
}

/// Result of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status.
    pub status: RunStatus,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run stopped.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Completed jobs, in execution order.
    pub jobs: Vec<JobResult>,

    /// Jobs planned for the run.
    pub jobs_total: usize,

    /// Rows written across completed jobs.
    pub rows_total: u64,

    /// Relations ignored for ordering, as `Entity.field -> Target`.
    pub dropped_edges: Vec<String>,

    /// Non-fatal validation findings.
    #[serde(default)]
    pub warnings: Vec<String>,

    pub success: bool,
}

impl RunResult {
    /// A successful run that moved nothing.
    pub fn empty() -> Self {
        RunRecorder::new(0).finish(RunStatus::Completed)
    }

    pub fn jobs_completed(&self) -> usize {
        self.jobs.len()
    }

    /// Result of the job for `entity`, if it completed.
    pub fn job(&self, entity: &EntityType) -> Option<&JobResult> {
        self.jobs.iter().find(|j| &j.entity == entity)
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Snapshot handed to the progress callback after each job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub entity: EntityType,
    pub job_rows: u64,
    pub jobs_completed: usize,
    pub jobs_total: usize,
    pub rows_total: u64,
}

/// Mutable run bookkeeping, finalized into a [`RunResult`] on every exit path.
#[derive(Debug)]
pub(crate) struct RunRecorder {
    run_id: String,
    started_at: DateTime<Utc>,
    clock: Instant,
    jobs: Vec<JobResult>,
    jobs_total: usize,
    rows_total: u64,
    dropped_edges: Vec<String>,
    warnings: Vec<String>,
}

impl RunRecorder {
    pub(crate) fn new(jobs_total: usize) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            clock: Instant::now(),
            jobs: Vec::new(),
            jobs_total,
            rows_total: 0,
            dropped_edges: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub(crate) fn run_id(&self) -> &str {
        &self.run_id
    }

    pub(crate) fn set_dropped_edges(&mut self, edges: Vec<String>) {
        self.dropped_edges = edges;
    }

    pub(crate) fn add_warnings(&mut self, warnings: Vec<String>) {
        self.warnings.extend(warnings);
    }

    /// Record a finished job and return the progress snapshot.
    pub(crate) fn record(&mut self, job: JobResult) -> Progress {
        self.rows_total += job.rows;
        let progress = Progress {
            entity: job.entity.clone(),
            job_rows: job.rows,
            jobs_completed: self.jobs.len() + 1,
            jobs_total: self.jobs_total,
            rows_total: self.rows_total,
        };
        self.jobs.push(job);
        progress
    }

    /// Add deferred-update counts to jobs already recorded.
    pub(crate) fn add_deferred(&mut self, entity: &EntityType, applied: u64) {
        if let Some(job) = self.jobs.iter_mut().find(|j| &j.entity == entity) {
            job.deferred_updates += applied;
        }
    }

    pub(crate) fn finish(&self, status: RunStatus) -> RunResult {
        RunResult {
            run_id: self.run_id.clone(),
            status,
            started_at: self.started_at,
            completed_at: Utc::now(),
            duration_seconds: self.clock.elapsed().as_secs_f64(),
            jobs: self.jobs.clone(),
            jobs_total: self.jobs_total,
            rows_total: self.rows_total,
            dropped_edges: self.dropped_edges.clone(),
            warnings: self.warnings.clone(),
            success: status == RunStatus::Completed,
        }
    }
}
