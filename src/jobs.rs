//! In-flight job tracking
//!
//! One `Job` per pending human-approved action. Chat callbacks arrive with
//! either the proposal message reference or the job id embedded in the
//! button value, so the store keeps two indices and keeps them consistent.
//!
//! State machines:
//! - code: `pending -> applying -> {applied | failed}`, plus `pending -> rejected`
//! - exec: `pending -> running -> {done | failed}`, plus `pending -> rejected`
//! - approval: `pending -> {approved | rejected}`
//!
//! The pending -> in-flight step is a single-lock read-then-write
//! (`begin_work`), which is what makes a rapid double-accept run the
//! underlying apply exactly once.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Approval,
    Code,
    Exec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Applying,
    Running,
    Applied,
    Done,
    Failed,
    Approved,
    Rejected,
}

impl JobStatus {
    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Applying => "applying",
            JobStatus::Running => "running",
            JobStatus::Applied => "applied",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Approved => "approved",
            JobStatus::Rejected => "rejected",
        }
    }
}

/// Kind-specific job data.
#[derive(Debug, Clone)]
pub enum JobPayload {
    /// Plain approval request; the task text may embed an `exec:` command.
    Approval { task: String },
    /// Code-change proposal backed by a job directory on disk.
    Code { job_dir: PathBuf, summary: String },
    /// Shell command awaiting approval.
    Exec { command: String, repo: Option<String> },
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub channel: String,
    pub requester: String,
    pub payload: JobPayload,
    /// Reference to the posted proposal message, once known.
    pub message_ts: Option<String>,
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        kind: JobKind,
        channel: impl Into<String>,
        requester: impl Into<String>,
        payload: JobPayload,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            channel: channel.into(),
            requester: requester.into(),
            payload,
            message_ts: None,
        }
    }

    /// The in-flight status this job's kind passes through on accept.
    pub fn in_flight_status(&self) -> JobStatus {
        match self.kind {
            JobKind::Exec => JobStatus::Running,
            _ => JobStatus::Applying,
        }
    }
}

/// Outcome of an atomic accept claim.
#[derive(Debug)]
pub enum Claim {
    /// Job was pending; it is now marked in-flight and belongs to the caller.
    Claimed(Job),
    /// Job exists but is already in-flight or terminal.
    AlreadyActive(JobStatus),
    /// Unknown id: resolved earlier, expired, or never existed.
    Missing,
}

#[derive(Default)]
struct Indices {
    by_id: HashMap<String, Job>,
    /// proposal message ts -> job id
    by_message: HashMap<String, String>,
}

/// Mutex-guarded registry of pending jobs, injected wherever callbacks are
/// handled so tests get isolated instances.
#[derive(Default)]
pub struct JobStore {
    inner: Mutex<Indices>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job under both indices.
    pub fn insert(&self, job: Job) {
        let mut inner = self.inner.lock().expect("job store poisoned");
        if let Some(ts) = &job.message_ts {
            inner.by_message.insert(ts.clone(), job.id.clone());
        }
        inner.by_id.insert(job.id.clone(), job);
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        let inner = self.inner.lock().expect("job store poisoned");
        inner.by_id.get(job_id).cloned()
    }

    /// Resolve a callback that only carries the message reference.
    pub fn id_for_message(&self, message_ts: &str) -> Option<String> {
        let inner = self.inner.lock().expect("job store poisoned");
        inner.by_message.get(message_ts).cloned()
    }

    /// Atomically claim a pending job for execution, marking it in-flight.
    ///
    /// Everything happens under one lock: a concurrent duplicate accept
    /// observes `AlreadyActive` and never starts a second run.
    pub fn begin_work(&self, job_id: &str) -> Claim {
        let mut inner = self.inner.lock().expect("job store poisoned");
        match inner.by_id.get_mut(job_id) {
            None => Claim::Missing,
            Some(job) if job.status != JobStatus::Pending => Claim::AlreadyActive(job.status),
            Some(job) => {
                job.status = job.in_flight_status();
                Claim::Claimed(job.clone())
            }
        }
    }

    /// Remove a job from both indices, recording its terminal status.
    ///
    /// Returns the removed job, or `None` if nothing matched (defensive
    /// no-op: late or duplicate callbacks are expected).
    pub fn resolve(&self, job_id: &str, status: JobStatus) -> Option<Job> {
        let mut inner = self.inner.lock().expect("job store poisoned");
        let mut job = inner.by_id.remove(job_id)?;
        if let Some(ts) = &job.message_ts {
            inner.by_message.remove(ts);
        }
        job.status = status;
        Some(job)
    }

    /// Unconditional reject: clears both indices whether or not the job is
    /// still pending.
    pub fn reject(&self, job_id: &str) -> Option<Job> {
        self.resolve(job_id, JobStatus::Rejected)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("job store poisoned").by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
