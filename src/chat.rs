//! Chat surface adapter
//!
//! The orchestrator talks to an object-safe [`ChatClient`] trait; the
//! provider wiring lives behind it. [`HttpChat`] speaks a Slack-compatible
//! Web API (`chat.postMessage` et al.) over reqwest. Card builders produce
//! the interactive proposal messages; every button carries the job id as
//! its value so a callback can be resolved even if the in-memory
//! message index was lost.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::fmt;

/// Action ids on proposal cards.
pub const ACTION_APPROVE: &str = "bridge_approve";
pub const ACTION_APPROVE_REJECT: &str = "bridge_reject";
pub const ACTION_CODE_APPLY: &str = "code_apply";
pub const ACTION_CODE_REJECT: &str = "code_reject";
pub const ACTION_EXEC_RUN: &str = "exec_run";
pub const ACTION_EXEC_REJECT: &str = "exec_reject";

#[derive(Debug)]
pub enum ChatError {
    /// The bot is not a member of the destination; the caller may join
    /// and retry once.
    NotInChannel,
    /// The provider answered with an error code.
    Api(String),
    /// The request never completed.
    Transport(String),
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::NotInChannel => write!(f, "not a member of the destination channel"),
            ChatError::Api(e) => write!(f, "chat api error: {}", e),
            ChatError::Transport(e) => write!(f, "chat transport error: {}", e),
        }
    }
}

impl std::error::Error for ChatError {}

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Post a message, returning the provider's message reference (ts).
    async fn post_message(
        &self,
        channel: &str,
        text: &str,
        blocks: Option<Value>,
    ) -> Result<String, ChatError>;

    /// Edit a previously posted message in place.
    async fn update_message(
        &self,
        channel: &str,
        ts: &str,
        text: &str,
        blocks: Option<Value>,
    ) -> Result<(), ChatError>;

    /// Message visible only to one user (stale-callback notices).
    async fn post_ephemeral(&self, channel: &str, user: &str, text: &str)
        -> Result<(), ChatError>;

    async fn join_channel(&self, channel: &str) -> Result<(), ChatError>;
}

/// Reqwest-backed client for a Slack-compatible Web API.
pub struct HttpChat {
    client: reqwest::Client,
    base: String,
    token: String,
}

impl HttpChat {
    pub fn new(base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: base.into(),
            token: token.into(),
        }
    }

    async fn call(&self, method: &str, payload: Value) -> Result<Value, ChatError> {
        let url = format!("{}/{}", self.base.trim_end_matches('/'), method);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| ChatError::Transport(format!("bad response body: {}", e)))?;

        if body.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(body);
        }
        let code = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        if code == "not_in_channel" {
            return Err(ChatError::NotInChannel);
        }
        Err(ChatError::Api(code.to_string()))
    }
}

#[async_trait]
impl ChatClient for HttpChat {
    async fn post_message(
        &self,
        channel: &str,
        text: &str,
        blocks: Option<Value>,
    ) -> Result<String, ChatError> {
        let mut payload = json!({ "channel": channel, "text": text });
        if let Some(blocks) = blocks {
            payload["blocks"] = blocks;
        }
        let body = self.call("chat.postMessage", payload).await?;
        body.get("ts")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .ok_or_else(|| ChatError::Api("missing ts in response".to_string()))
    }

    async fn update_message(
        &self,
        channel: &str,
        ts: &str,
        text: &str,
        blocks: Option<Value>,
    ) -> Result<(), ChatError> {
        let mut payload = json!({ "channel": channel, "ts": ts, "text": text });
        if let Some(blocks) = blocks {
            payload["blocks"] = blocks;
        }
        self.call("chat.update", payload).await.map(|_| ())
    }

    async fn post_ephemeral(
        &self,
        channel: &str,
        user: &str,
        text: &str,
    ) -> Result<(), ChatError> {
        let payload = json!({ "channel": channel, "user": user, "text": text });
        self.call("chat.postEphemeral", payload).await.map(|_| ())
    }

    async fn join_channel(&self, channel: &str) -> Result<(), ChatError> {
        let payload = json!({ "channel": channel });
        self.call("conversations.join", payload).await.map(|_| ())
    }
}

fn buttons(accept_label: &str, accept_action: &str, reject_action: &str, job_id: &str) -> Value {
    json!({
        "type": "actions",
        "elements": [
            {
                "type": "button",
                "text": { "type": "plain_text", "text": accept_label },
                "style": "primary",
                "action_id": accept_action,
                "value": job_id,
            },
            {
                "type": "button",
                "text": { "type": "plain_text", "text": "Reject" },
                "style": "danger",
                "action_id": reject_action,
                "value": job_id,
            },
        ],
    })
}

fn context_line(requester: &str, job_id: &str) -> Value {
    json!({
        "type": "context",
        "elements": [{
            "type": "mrkdwn",
            "text": format!("Requested by <@{}> | Job {}", requester, job_id),
        }],
    })
}

/// Card for a plain approval request.
pub fn approval_card(task: &str, requester: &str, job_id: &str) -> Value {
    json!([
        {
            "type": "section",
            "text": { "type": "mrkdwn", "text": format!("*Approval requested*\nTask: {}", task) },
        },
        context_line(requester, job_id),
        buttons("Approve", ACTION_APPROVE, ACTION_APPROVE_REJECT, job_id),
    ])
}

/// Card for a code-change proposal.
pub fn code_card(summary: &str, requester: &str, job_id: &str) -> Value {
    json!([
        {
            "type": "section",
            "text": { "type": "mrkdwn", "text": format!("*Code change proposal*\nTask: {}", summary) },
        },
        context_line(requester, job_id),
        buttons("Apply Patch", ACTION_CODE_APPLY, ACTION_CODE_REJECT, job_id),
    ])
}

/// Card for a shell command proposal.
pub fn exec_card(command: &str, repo: Option<&str>, requester: &str, job_id: &str) -> Value {
    let repo_label = match repo {
        Some(r) => format!("repo={}", r),
        None => "repo=default".to_string(),
    };
    json!([
        {
            "type": "section",
            "text": { "type": "mrkdwn", "text": format!("*Exec approval*\n`{}`\n{}", command, repo_label) },
        },
        context_line(requester, job_id),
        buttons("Run Command", ACTION_EXEC_RUN, ACTION_EXEC_REJECT, job_id),
    ])
}

/// Single-section card used for in-progress and terminal states.
pub fn status_card(headline: &str, detail: &str) -> Value {
    json!([
        {
            "type": "section",
            "text": { "type": "mrkdwn", "text": format!("*{}*\n{}", headline, detail) },
        },
    ])
}

/// Recover the task text from a rendered card (orphan callbacks after a
/// restart, when the in-memory store no longer knows the message).
pub fn extract_task_from_blocks(blocks: &Value) -> String {
    if let Some(list) = blocks.as_array() {
        for block in list {
            if block.get("type").and_then(Value::as_str) != Some("section") {
                continue;
            }
            let Some(raw) = block
                .get("text")
                .and_then(|t| t.get("text"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            for line in raw.lines() {
                let line = line.trim();
                if line.to_lowercase().starts_with("task:") {
                    return line["task:".len()..].trim().to_string();
                }
            }
            let cleaned = raw.replace('*', "");
            let cleaned = cleaned.trim();
            if !cleaned.is_empty() {
                return cleaned.to_string();
            }
        }
    }
    "Unknown task".to_string()
}
