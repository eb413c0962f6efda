//! Durable approval queue
//!
//! A JSON array file tracking tasks that need a human decision. An absent
//! file is an empty queue; every mutation rewrites the whole file. Items
//! are never deleted, so the file doubles as an audit trail.

use crate::route;
use crate::util::truncate;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    /// Waiting to be proposed in chat.
    Pending,
    /// Proposal posted; waiting on a decision.
    Queued,
    Approved,
    Rejected,
    Done,
}

impl QueueStatus {
    pub fn label(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Queued => "queued",
            QueueStatus::Approved => "approved",
            QueueStatus::Rejected => "rejected",
            QueueStatus::Done => "done",
        }
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(QueueStatus::Pending),
            "queued" => Ok(QueueStatus::Queued),
            "approved" => Ok(QueueStatus::Approved),
            "rejected" => Ok(QueueStatus::Rejected),
            "done" => Ok(QueueStatus::Done),
            other => anyhow::bail!("unknown queue status '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub task: String,
    pub status: QueueStatus,
    /// Channel to propose in; falls back to the configured queue channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl QueueItem {
    /// A pending item that has never been proposed in chat.
    pub fn needs_posting(&self) -> bool {
        self.status == QueueStatus::Pending && self.posted_at.is_none()
    }
}

/// Load the queue. A missing file is an empty queue, not an error.
pub fn load(path: &Path) -> Result<Vec<QueueItem>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read queue file {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&content)
        .with_context(|| format!("queue file {} is not valid JSON", path.display()))
}

/// Rewrite the queue file in full.
pub fn save(path: &Path, items: &[QueueItem]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let content = serde_json::to_string_pretty(items)?;
    fs::write(path, content)
        .with_context(|| format!("failed to write queue file {}", path.display()))?;
    Ok(())
}

fn new_id(now: DateTime<Utc>) -> String {
    now.format("Q-%Y%m%d-%H%M%S").to_string()
}

/// Append a new pending item and persist.
pub fn add(path: &Path, task: &str, channel: Option<String>) -> Result<QueueItem> {
    let mut items = load(path)?;
    let mut id = new_id(Utc::now());
    // Same-second adds would collide on the timestamp id.
    let mut suffix = 1;
    while items.iter().any(|i| i.id == id) {
        id = format!("{}-{}", new_id(Utc::now()), suffix);
        suffix += 1;
    }
    let item = QueueItem {
        id,
        task: task.trim().to_string(),
        status: QueueStatus::Pending,
        channel,
        posted_at: None,
        approved_at: None,
        notes: None,
    };
    items.push(item.clone());
    save(path, &items)?;
    Ok(item)
}

/// Set an item's status by id. Returns false when no item matches.
/// Marking approved stamps `approved_at`.
pub fn mark(path: &Path, id: &str, status: QueueStatus) -> Result<bool> {
    let mut items = load(path)?;
    let Some(item) = items.iter_mut().find(|i| i.id == id) else {
        return Ok(false);
    };
    item.status = status;
    if status == QueueStatus::Approved {
        item.approved_at = Some(Utc::now());
    }
    save(path, &items)?;
    Ok(true)
}

/// Mark the item whose id is embedded in a task label, if any.
pub fn mark_by_task(path: &Path, task: &str, status: QueueStatus) -> Result<bool> {
    match route::extract_queue_id(task) {
        Some(id) => mark(path, &id, status),
        None => Ok(false),
    }
}

/// Record that an item's proposal was posted: pending -> queued.
pub fn mark_posted(path: &Path, id: &str) -> Result<bool> {
    let mut items = load(path)?;
    let Some(item) = items.iter_mut().find(|i| i.id == id) else {
        return Ok(false);
    };
    item.status = QueueStatus::Queued;
    item.posted_at = Some(Utc::now());
    save(path, &items)?;
    Ok(true)
}

/// One-line-per-item overview for the `queue` chat command.
pub fn summarize(items: &[QueueItem]) -> String {
    if items.is_empty() {
        return "The approval queue is empty.".to_string();
    }
    let open = items
        .iter()
        .filter(|i| matches!(i.status, QueueStatus::Pending | QueueStatus::Queued))
        .count();
    let mut out = format!("Approval queue: {} item(s), {} open", items.len(), open);
    for item in items {
        out.push_str(&format!(
            "\n• {} [{}] {}",
            item.id,
            item.status.label(),
            truncate(&item.task, 120)
        ));
    }
    out
}
