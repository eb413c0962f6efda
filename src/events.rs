//! Inbound chat events
//!
//! `serve` reads one JSON event per line from stdin. The transport that
//! produces those lines (socket-mode bridge, webhook relay, test harness)
//! is somebody else's problem; this adapter only parses and dispatches.
//! A malformed line is logged and skipped, never fatal.

use crate::approval::Orchestrator;
use anyhow::Result;
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, Deserialize)]
pub struct MessageEvent {
    pub channel: String,
    pub user: String,
    pub text: String,
}

/// A button press on a proposal card. `value` carries the job id;
/// `message_blocks` is the card body, used to recover orphaned approvals.
#[derive(Debug, Deserialize)]
pub struct ActionEvent {
    pub action_id: String,
    pub value: String,
    pub user: String,
    pub channel: String,
    pub message_ts: String,
    #[serde(default)]
    pub message_blocks: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Message(MessageEvent),
    Action(ActionEvent),
}

/// Read events from stdin until EOF, dispatching each to the orchestrator.
pub async fn run_stdin_loop(orchestrator: Arc<Orchestrator>) -> Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ChatEvent>(line) {
            Ok(ChatEvent::Message(m)) => {
                tracing::debug!(channel = %m.channel, user = %m.user, "message event");
                if let Err(e) = orchestrator.handle_message(&m.channel, &m.user, &m.text).await {
                    tracing::warn!("message handling failed: {:#}", e);
                }
            }
            Ok(ChatEvent::Action(a)) => {
                tracing::debug!(action_id = %a.action_id, "action event");
                orchestrator.handle_action(a).await;
            }
            Err(e) => {
                tracing::warn!("skipping malformed event line: {}", e);
            }
        }
    }
    tracing::info!("event stream closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message_event() {
        let raw = r#"{"type":"message","channel":"C1","user":"U1","text":"exec ls"}"#;
        let event: ChatEvent = serde_json::from_str(raw).unwrap();
        let ChatEvent::Message(m) = event else {
            panic!("wrong variant");
        };
        assert_eq!(m.channel, "C1");
        assert_eq!(m.text, "exec ls");
    }

    #[test]
    fn test_parse_action_event_without_blocks() {
        let raw = r#"{"type":"action","action_id":"exec_run","value":"exec-1",
                      "user":"U1","channel":"C1","message_ts":"12.34"}"#;
        let event: ChatEvent = serde_json::from_str(raw).unwrap();
        let ChatEvent::Action(a) = event else {
            panic!("wrong variant");
        };
        assert_eq!(a.value, "exec-1");
        assert!(a.message_blocks.is_none());
    }

    #[test]
    fn test_parse_action_event_with_blocks() {
        let raw = r#"{"type":"action","action_id":"bridge_approve","value":"appr-1",
                      "user":"U1","channel":"C1","message_ts":"12.34",
                      "message_blocks":[{"type":"section"}]}"#;
        let event: ChatEvent = serde_json::from_str(raw).unwrap();
        let ChatEvent::Action(a) = event else {
            panic!("wrong variant");
        };
        assert!(a.message_blocks.is_some());
    }

    #[test]
    fn test_malformed_event_is_an_error() {
        assert!(serde_json::from_str::<ChatEvent>("{\"type\":\"mystery\"}").is_err());
        assert!(serde_json::from_str::<ChatEvent>("not json").is_err());
    }
}
