//! Approval orchestration
//!
//! The hub between chat events and the workers: posts proposal cards,
//! claims jobs on accept callbacks, runs the apply/exec work on its own
//! task, and reflects every transition back into the proposal message.
//! The orchestrator is provider-agnostic; it only sees the `ChatClient`
//! trait and the parsed event types.

use crate::chat::{self, ChatClient, ChatError};
use crate::config::Config;
use crate::events::ActionEvent;
use crate::exec::{self, ExecStatus};
use crate::jobs::{Claim, Job, JobKind, JobPayload, JobStatus, JobStore};
use crate::patch::{self, ApplyOutcome, REQUEST_FILE, SUMMARY_FILE};
use crate::queue::{self, QueueStatus};
use crate::route;
use crate::util::truncate;
use anyhow::{Context, Result};
use chrono::Utc;
use futures::FutureExt;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Cap on any result message posted back to chat.
const RESULT_BUDGET: usize = 2800;

/// Requester recorded on proposals the queue poller posts.
const QUEUE_USER: &str = "queue";

pub struct Orchestrator {
    store: Arc<JobStore>,
    chat: Arc<dyn ChatClient>,
    config: Config,
    /// One async mutex per repo root; concurrent code applies against the
    /// same working tree are serialized.
    repo_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(store: Arc<JobStore>, chat: Arc<dyn ChatClient>, config: Config) -> Self {
        Self {
            store,
            chat,
            config,
            repo_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    fn repo_lock(&self, root: &PathBuf) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.repo_locks.lock().expect("repo lock map poisoned");
        locks.entry(root.clone()).or_default().clone()
    }

    /// Post a proposal, joining the channel and retrying once if the bot
    /// is not yet a member.
    async fn post_with_join(
        &self,
        channel: &str,
        text: &str,
        blocks: serde_json::Value,
    ) -> Result<String, ChatError> {
        match self
            .chat
            .post_message(channel, text, Some(blocks.clone()))
            .await
        {
            Err(ChatError::NotInChannel) => {
                tracing::info!(channel, "not in channel; joining and reposting");
                self.chat.join_channel(channel).await?;
                self.chat.post_message(channel, text, Some(blocks)).await
            }
            other => other,
        }
    }

    async fn post_proposal(&self, mut job: Job, text: &str, blocks: serde_json::Value) -> Result<String> {
        let ts = self
            .post_with_join(&job.channel, text, blocks)
            .await
            .map_err(|e| anyhow::anyhow!("failed to post proposal: {}", e))?;
        job.message_ts = Some(ts);
        let id = job.id.clone();
        tracing::info!(job = %id, kind = ?job.kind, channel = %job.channel, "proposal posted");
        self.store.insert(job);
        Ok(id)
    }

    /// Post an approval card for a plain task.
    pub async fn propose_approval(
        &self,
        channel: &str,
        requester: &str,
        task: &str,
    ) -> Result<String> {
        let id = format!("appr-{}", Uuid::new_v4());
        let job = Job::new(
            &id,
            JobKind::Approval,
            channel,
            requester,
            JobPayload::Approval {
                task: task.to_string(),
            },
        );
        let blocks = chat::approval_card(task, requester, &id);
        self.post_proposal(job, &format!("Approval requested: {}", task), blocks)
            .await
    }

    /// Post a run-command card.
    pub async fn propose_exec(
        &self,
        channel: &str,
        requester: &str,
        command: &str,
        repo: Option<String>,
    ) -> Result<String> {
        let id = format!("exec-{}", Uuid::new_v4());
        let job = Job::new(
            &id,
            JobKind::Exec,
            channel,
            requester,
            JobPayload::Exec {
                command: command.to_string(),
                repo: repo.clone(),
            },
        );
        let blocks = chat::exec_card(command, repo.as_deref(), requester, &id);
        self.post_proposal(job, &format!("Exec approval: {}", command), blocks)
            .await
    }

    /// Create a code job directory for a request and post its card. The
    /// diff itself arrives later from the out-of-process generator.
    pub async fn propose_code(
        &self,
        channel: &str,
        requester: &str,
        request: &str,
    ) -> Result<String> {
        let dir_name = format!(
            "job-{}-{}",
            Utc::now().format("%Y%m%d-%H%M%S"),
            &Uuid::new_v4().to_string()[..8]
        );
        let job_dir = self.config.jobs_dir.join(&dir_name);
        fs::create_dir_all(&job_dir)
            .with_context(|| format!("failed to create job dir {}", job_dir.display()))?;
        fs::write(job_dir.join(REQUEST_FILE), format!("{}\n", request))?;
        fs::write(job_dir.join(SUMMARY_FILE), format!("{}\n", request))?;

        let id = format!("code-{}", dir_name);
        let job = Job::new(
            &id,
            JobKind::Code,
            channel,
            requester,
            JobPayload::Code {
                job_dir,
                summary: request.to_string(),
            },
        );
        let blocks = chat::code_card(request, requester, &id);
        self.post_proposal(job, &format!("Code change proposal: {}", request), blocks)
            .await
    }

    /// Dispatch an inbound chat message.
    pub async fn handle_message(&self, channel: &str, user: &str, text: &str) -> Result<()> {
        match route::classify(text) {
            route::Request::Approval { task } => {
                self.propose_approval(channel, user, &task).await?;
            }
            route::Request::Exec { command, repo } => {
                if !self.config.exec_mode_enabled {
                    self.reply(channel, "Exec mode is disabled.").await;
                } else {
                    self.propose_exec(channel, user, &command, repo).await?;
                }
            }
            route::Request::Code { request } => {
                if !self.config.code_mode_enabled {
                    self.reply(channel, "Code mode is disabled.").await;
                } else {
                    self.propose_code(channel, user, &request).await?;
                }
            }
            route::Request::QueueSummary => {
                let items = queue::load(&self.config.queue_path)?;
                self.reply(channel, &queue::summarize(&items)).await;
            }
            route::Request::Other { .. } => {
                self.reply(
                    channel,
                    "I handle `approve: <task>`, `exec <command>`, \
                     `code <request>`, and `queue`.",
                )
                .await;
            }
        }
        Ok(())
    }

    async fn reply(&self, channel: &str, text: &str) {
        if let Err(e) = self.chat.post_message(channel, text, None).await {
            tracing::warn!(channel, "failed to post reply: {}", e);
        }
    }

    async fn notice(&self, channel: &str, user: &str, text: &str) {
        if let Err(e) = self.chat.post_ephemeral(channel, user, text).await {
            tracing::warn!(channel, "failed to post notice: {}", e);
        }
    }

    async fn edit_card(&self, channel: &str, ts: &str, headline: &str, detail: &str) {
        let blocks = chat::status_card(headline, detail);
        let text = format!("{}: {}", headline, detail);
        if let Err(e) = self
            .chat
            .update_message(channel, ts, &text, Some(blocks))
            .await
        {
            tracing::warn!(channel, ts, "failed to edit proposal card: {}", e);
        }
    }

    fn is_accept(action_id: &str) -> bool {
        matches!(
            action_id,
            chat::ACTION_APPROVE | chat::ACTION_CODE_APPLY | chat::ACTION_EXEC_RUN
        )
    }

    fn is_reject(action_id: &str) -> bool {
        matches!(
            action_id,
            chat::ACTION_APPROVE_REJECT | chat::ACTION_CODE_REJECT | chat::ACTION_EXEC_REJECT
        )
    }

    /// Handle a button callback. Never blocks on the job's work: the
    /// claimed job runs on its own task.
    pub async fn handle_action(self: &Arc<Self>, action: ActionEvent) {
        // Message index first, button value second (restart semantics).
        let job_id = self
            .store
            .id_for_message(&action.message_ts)
            .unwrap_or_else(|| action.value.clone());

        if Self::is_reject(&action.action_id) {
            self.handle_reject(&job_id, &action).await;
            return;
        }
        if !Self::is_accept(&action.action_id) {
            tracing::debug!(action_id = %action.action_id, "ignoring unknown action");
            return;
        }

        match self.store.begin_work(&job_id) {
            Claim::Claimed(job) => {
                tracing::info!(job = %job.id, status = job.in_flight_status().label(), "claimed");
                let (headline, detail) = in_progress_text(&job);
                self.edit_card(&action.channel, &action.message_ts, &headline, &detail)
                    .await;
                let this = Arc::clone(self);
                let actor = action.user.clone();
                tokio::spawn(async move {
                    this.run_claimed(job, actor).await;
                });
            }
            Claim::AlreadyActive(status) => {
                self.notice(
                    &action.channel,
                    &action.user,
                    &format!("This job is already {}.", status.label()),
                )
                .await;
            }
            Claim::Missing => {
                if action.action_id == chat::ACTION_APPROVE {
                    if let Some(blocks) = &action.message_blocks {
                        self.handle_orphan_approval(&action, blocks.clone()).await;
                        return;
                    }
                }
                self.notice(
                    &action.channel,
                    &action.user,
                    "This proposal is no longer active.",
                )
                .await;
            }
        }
    }

    async fn handle_reject(&self, job_id: &str, action: &ActionEvent) {
        match self.store.reject(job_id) {
            Some(job) => {
                tracing::info!(job = %job.id, by = %action.user, "rejected");
                if job.kind == JobKind::Approval {
                    if let JobPayload::Approval { task } = &job.payload {
                        if let Err(e) = queue::mark_by_task(
                            &self.config.queue_path,
                            task,
                            QueueStatus::Rejected,
                        ) {
                            tracing::warn!("failed to mark queue item rejected: {}", e);
                        }
                    }
                }
                self.edit_card(
                    &action.channel,
                    &action.message_ts,
                    "Rejected",
                    &format!("{}\nRejected by <@{}>", describe(&job), action.user),
                )
                .await;
            }
            None => {
                // The store no longer knows this card (restart, or a late
                // duplicate click). An approval card still names its task,
                // so the durable queue gets the rejection recorded.
                if action.action_id == chat::ACTION_APPROVE_REJECT {
                    if let Some(blocks) = &action.message_blocks {
                        let task = chat::extract_task_from_blocks(blocks);
                        tracing::info!(task = %task, "rejecting orphaned card");
                        if let Err(e) = queue::mark_by_task(
                            &self.config.queue_path,
                            &task,
                            QueueStatus::Rejected,
                        ) {
                            tracing::warn!("failed to mark queue item rejected: {}", e);
                        }
                        self.edit_card(
                            &action.channel,
                            &action.message_ts,
                            "Rejected",
                            &format!("Task: {}\nRejected by <@{}>", task, action.user),
                        )
                        .await;
                        return;
                    }
                }
                self.edit_card(
                    &action.channel,
                    &action.message_ts,
                    "Rejected",
                    &format!("Rejected by <@{}>", action.user),
                )
                .await;
            }
        }
    }

    /// Approve callback for a card whose job the store lost (restart).
    /// The job id comes from the button value and the task from the card
    /// body, so the durable queue still gets updated.
    async fn handle_orphan_approval(&self, action: &ActionEvent, blocks: serde_json::Value) {
        let task = chat::extract_task_from_blocks(&blocks);
        tracing::info!(task = %task, "approving orphaned card");
        if let Err(e) = queue::mark_by_task(&self.config.queue_path, &task, QueueStatus::Approved) {
            tracing::warn!("failed to mark queue item approved: {}", e);
        }
        self.edit_card(
            &action.channel,
            &action.message_ts,
            "Approved",
            &format!("Task: {}\nApproved by <@{}>", task, action.user),
        )
        .await;
        if let Some(result) = self.run_embedded_exec(&task).await {
            self.reply(&action.channel, &truncate(&result, RESULT_BUDGET))
                .await;
        }
    }

    /// Run a claimed job to its terminal state, including the panic fence.
    async fn run_claimed(self: Arc<Self>, job: Job, actor: String) {
        let this = Arc::clone(&self);
        let fenced = std::panic::AssertUnwindSafe(this.execute(job.clone())).catch_unwind();
        let (status, headline, result) = match fenced.await {
            Ok(outcome) => outcome,
            Err(_) => (
                JobStatus::Failed,
                "Failed".to_string(),
                "job task panicked".to_string(),
            ),
        };

        self.store.resolve(&job.id, status);
        tracing::info!(job = %job.id, status = status.label(), "job finished");

        if let Some(ts) = &job.message_ts {
            self.edit_card(
                &job.channel,
                ts,
                &headline,
                &format!("{}\nDecided by <@{}>", describe(&job), actor),
            )
            .await;
        }
        self.reply(&job.channel, &truncate(&result, RESULT_BUDGET))
            .await;
    }

    /// The blocking work for one claimed job. Returns the terminal status,
    /// the card headline, and the result message body.
    async fn execute(self: Arc<Self>, job: Job) -> (JobStatus, String, String) {
        match &job.payload {
            JobPayload::Code { job_dir, summary } => {
                self.execute_code(job_dir.clone(), summary.clone()).await
            }
            JobPayload::Exec { command, repo } => {
                self.execute_exec(command.clone(), repo.clone()).await
            }
            JobPayload::Approval { task } => self.execute_approval(task.clone()).await,
        }
    }

    async fn execute_code(&self, job_dir: PathBuf, summary: String) -> (JobStatus, String, String) {
        let repo_root = self.config.repo_root.clone();
        let lock = self.repo_lock(&repo_root);
        let _guard = lock.lock().await;

        let result =
            tokio::task::spawn_blocking(move || patch::apply_job(&job_dir, &repo_root, true))
                .await;
        match result {
            Ok(Ok(report)) => {
                let headline = match report.outcome {
                    ApplyOutcome::Applied => "Patch applied",
                    ApplyOutcome::AlreadyApplied => "Already applied",
                };
                let mut body = format!("{}\n{}", report.detail, summary);
                if let Some(warning) = report.push_warning {
                    body.push_str(&format!("\n:warning: {}", warning));
                }
                (JobStatus::Applied, headline.to_string(), body)
            }
            Ok(Err(e)) => (
                JobStatus::Failed,
                "Apply failed".to_string(),
                format!("Patch apply failed: {:#}", e),
            ),
            Err(join_err) => (
                JobStatus::Failed,
                "Apply failed".to_string(),
                format!("apply task panicked: {}", join_err),
            ),
        }
    }

    async fn execute_exec(
        &self,
        command: String,
        repo: Option<String>,
    ) -> (JobStatus, String, String) {
        let cwd = match exec::resolve_workdir(
            repo.as_deref(),
            &self.config.repo_map,
            &self.config.repo_root,
        ) {
            Ok(cwd) => cwd,
            Err(e) => return (JobStatus::Failed, "Failed".to_string(), e.to_string()),
        };

        let timeout = Duration::from_secs(self.config.exec_timeout_secs);
        let allow_destructive = self.config.exec_allow_destructive;
        let cmd = command.clone();
        let result = tokio::task::spawn_blocking(move || {
            exec::run_gated(&cmd, &cwd, timeout, allow_destructive)
        })
        .await;

        match result {
            Ok(Ok(outcome)) => {
                let ok = outcome.status == ExecStatus::Ok;
                let headline = if ok { "Command finished" } else { "Command failed" };
                let status = if ok { JobStatus::Done } else { JobStatus::Failed };
                (
                    status,
                    headline.to_string(),
                    format!("`{}`\n```\n{}\n```", command, outcome.output),
                )
            }
            Ok(Err(e)) => (JobStatus::Failed, "Failed".to_string(), e.to_string()),
            Err(join_err) => (
                JobStatus::Failed,
                "Failed".to_string(),
                format!("exec task panicked: {}", join_err),
            ),
        }
    }

    async fn execute_approval(&self, task: String) -> (JobStatus, String, String) {
        if let Err(e) = queue::mark_by_task(&self.config.queue_path, &task, QueueStatus::Approved) {
            tracing::warn!("failed to mark queue item approved: {}", e);
        }
        let result = match self.run_embedded_exec(&task).await {
            Some(output) => output,
            None => format!("Approved: {}", task),
        };
        (JobStatus::Approved, "Approved".to_string(), result)
    }

    /// A task of the form `exec:<command>` carries its own follow-up
    /// action; run it through the gate once approved. The command may name
    /// a working directory with the usual `repo=<name>;` prefix.
    async fn run_embedded_exec(&self, task: &str) -> Option<String> {
        let stripped = route::strip_queue_prefix(task);
        let lower = stripped.to_lowercase();
        if !(lower.starts_with("exec:") || lower.starts_with("exec ")) {
            return None;
        }
        if !self.config.exec_mode_enabled {
            return Some(
                "Approved, but exec mode is disabled; the command was not run.".to_string(),
            );
        }
        let (repo, command) = route::extract_exec_target(&stripped);

        let cwd = match exec::resolve_workdir(
            repo.as_deref(),
            &self.config.repo_map,
            &self.config.repo_root,
        ) {
            Ok(cwd) => cwd,
            Err(e) => {
                return Some(format!(
                    "Approved, but the follow-up command was not run: {}",
                    e
                ))
            }
        };
        let timeout = Duration::from_secs(self.config.exec_timeout_secs);
        let allow_destructive = self.config.exec_allow_destructive;
        let cmd = command.clone();
        let result = tokio::task::spawn_blocking(move || {
            exec::run_gated(&cmd, &cwd, timeout, allow_destructive)
        })
        .await;

        Some(match result {
            Ok(Ok(outcome)) => format!("`{}`\n```\n{}\n```", command, outcome.output),
            Ok(Err(e)) => format!("Approved, but the follow-up command was not run: {}", e),
            Err(join_err) => format!("exec task panicked: {}", join_err),
        })
    }

    /// One poll pass: propose every pending queue item that has never been
    /// posted. Returns how many proposals went out. A single item's
    /// failure is logged and retried on the next tick.
    pub async fn poll_queue_once(&self) -> Result<usize> {
        let items = queue::load(&self.config.queue_path)?;
        let mut posted = 0;
        for item in items.iter().filter(|i| i.needs_posting()) {
            let Some(channel) = item
                .channel
                .clone()
                .or_else(|| self.config.queue_channel.clone())
            else {
                tracing::debug!(item = %item.id, "no channel for queue item; skipping");
                continue;
            };
            let task = format!("[{}] {}", item.id, item.task);
            match self.propose_approval(&channel, QUEUE_USER, &task).await {
                Ok(_) => {
                    queue::mark_posted(&self.config.queue_path, &item.id)?;
                    posted += 1;
                }
                Err(e) => {
                    tracing::warn!(item = %item.id, "failed to post queue item: {}", e);
                }
            }
        }
        Ok(posted)
    }

    /// Background poller loop. Interval 0 disables it. Never exits on a
    /// tick error.
    pub async fn run_queue_poller(self: Arc<Self>) {
        let secs = self.config.queue_interval_secs;
        if secs == 0 {
            tracing::info!("queue poller disabled");
            return;
        }
        let mut interval = tokio::time::interval(Duration::from_secs(secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match self.poll_queue_once().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(posted = n, "queue poll posted proposals"),
                Err(e) => tracing::warn!("queue poll failed: {}", e),
            }
        }
    }
}

fn describe(job: &Job) -> String {
    match &job.payload {
        JobPayload::Approval { task } => format!("Task: {}", task),
        JobPayload::Code { summary, .. } => format!("Task: {}", summary),
        JobPayload::Exec { command, .. } => format!("`{}`", command),
    }
}

fn in_progress_text(job: &Job) -> (String, String) {
    let headline = match job.kind {
        JobKind::Exec => "Running",
        JobKind::Code => "Applying patch",
        JobKind::Approval => "Approving",
    };
    (headline.to_string(), describe(job))
}
