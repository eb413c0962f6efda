//! Chat request classification
//!
//! Decides what an incoming message is asking for: a code change, a shell
//! command, an approval request, or a queue query. Text comes from a chat
//! surface, so mentions and odd whitespace are scrubbed first.

use regex::Regex;
use std::sync::OnceLock;

fn mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<@[^>]+>").expect("mention regex"))
}

fn queue_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(Q-[^\]]+)\]").expect("queue id regex"))
}

fn bare_queue_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bQ-\d{8}-\d{6}\b").expect("bare queue id regex"))
}

/// Strip bot mentions and collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    let no_mentions = mention_re().replace_all(text, "");
    no_mentions.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// What the bridge should do with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `approve: <task>` / `request: <task>`: post an approval card.
    Approval { task: String },
    /// `exec <cmd>`, `shell: <cmd>`, `cmd <cmd>`: propose a command run.
    Exec { command: String, repo: Option<String> },
    /// `code <request>` / `implement <request>`: propose a code change.
    Code { request: String },
    /// `queue`: summarize the durable approval queue.
    QueueSummary,
    /// Anything else; the assistant backend is not our concern.
    Other { text: String },
}

/// Classify a normalized message.
pub fn classify(text: &str) -> Request {
    let cleaned = normalize_text(text);
    let lower = cleaned.to_lowercase();

    if let Some(rest) = strip_any_prefix(&cleaned, &["approve:", "request:"]) {
        let task = rest.trim();
        let task = if task.is_empty() { "Unspecified task" } else { task };
        return Request::Approval {
            task: task.to_string(),
        };
    }

    if is_exec_request(&lower) {
        let (repo, command) = extract_exec_target(&cleaned);
        return Request::Exec { command, repo };
    }

    if is_code_request(&lower) {
        return Request::Code {
            request: cleaned.clone(),
        };
    }

    if lower.starts_with("queue") {
        return Request::QueueSummary;
    }

    Request::Other { text: cleaned }
}

pub fn is_code_request(lower: &str) -> bool {
    lower.starts_with("code ")
        || lower.starts_with("code:")
        || lower.starts_with("implement ")
        || lower.starts_with("implement:")
}

pub fn is_exec_request(lower: &str) -> bool {
    ["exec ", "exec:", "shell ", "shell:", "cmd ", "cmd:"]
        .iter()
        .any(|p| lower.starts_with(p))
}

fn strip_any_prefix<'a>(text: &'a str, prefixes: &[&str]) -> Option<&'a str> {
    let lower = text.to_lowercase();
    for p in prefixes {
        if lower.starts_with(p) {
            return Some(&text[p.len()..]);
        }
    }
    None
}

/// Drop the `exec`/`shell`/`cmd` keyword and its separator.
pub fn extract_exec_command(text: &str) -> String {
    let cleaned = text.trim();
    let lower = cleaned.to_lowercase();
    for keyword in ["exec", "shell", "cmd"] {
        if let Some(rest) = lower.strip_prefix(keyword) {
            if rest.starts_with(':') || rest.starts_with(' ') {
                return cleaned[keyword.len() + 1..].trim().to_string();
            }
        }
    }
    cleaned.to_string()
}

/// Split out an optional `repo=<name>;` prefix naming the working
/// directory, then the command itself.
pub fn extract_exec_target(text: &str) -> (Option<String>, String) {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)^repo\s*=\s*([^;]+);?\s*(.*)$").expect("repo prefix regex")
    });

    let cmd = extract_exec_command(text);
    if let Some(caps) = re.captures(&cmd) {
        let repo = caps[1].trim().to_lowercase();
        let rest = caps[2].trim().to_string();
        return (Some(repo), rest);
    }
    (None, cmd)
}

/// Pull a queue id like `Q-20260101-120000` out of a task label.
pub fn extract_queue_id(task: &str) -> Option<String> {
    if let Some(caps) = queue_id_re().captures(task) {
        return Some(caps[1].to_string());
    }
    bare_queue_id_re()
        .find(task)
        .map(|m| m.as_str().to_string())
}

/// Remove a leading `[Q-...]` label from a task.
pub fn strip_queue_prefix(task: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^\s*\[Q-[^\]]+\]\s*").expect("queue prefix regex"));
    re.replace(task, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_mentions() {
        assert_eq!(normalize_text("<@U123>  hello   world "), "hello world");
    }

    #[test]
    fn test_classify_exec_with_repo() {
        let req = classify("exec repo=widgets; ls -la");
        assert_eq!(
            req,
            Request::Exec {
                command: "ls -la".to_string(),
                repo: Some("widgets".to_string()),
            }
        );
    }

    #[test]
    fn test_classify_exec_variants() {
        for text in ["exec: uptime", "shell uptime", "cmd: uptime", "CMD uptime"] {
            match classify(text) {
                Request::Exec { command, repo } => {
                    assert_eq!(command, "uptime");
                    assert!(repo.is_none());
                }
                other => panic!("{:?} for {:?}", other, text),
            }
        }
    }

    #[test]
    fn test_classify_code() {
        assert!(matches!(
            classify("implement: retry logic in the poller"),
            Request::Code { .. }
        ));
        assert!(matches!(classify("code add a health endpoint"), Request::Code { .. }));
        // "codex" is not a code request.
        assert!(matches!(classify("codex hello"), Request::Other { .. }));
    }

    #[test]
    fn test_classify_approval() {
        assert_eq!(
            classify("approve: ship the release"),
            Request::Approval {
                task: "ship the release".to_string()
            }
        );
        assert_eq!(
            classify("request:"),
            Request::Approval {
                task: "Unspecified task".to_string()
            }
        );
    }

    #[test]
    fn test_classify_queue() {
        assert_eq!(classify("queue"), Request::QueueSummary);
        assert_eq!(classify("queue status please"), Request::QueueSummary);
    }

    #[test]
    fn test_queue_id_roundtrip() {
        let task = "[Q-20260101-120000] rotate the signing keys";
        assert_eq!(
            extract_queue_id(task).as_deref(),
            Some("Q-20260101-120000")
        );
        assert_eq!(strip_queue_prefix(task), "rotate the signing keys");
        assert_eq!(
            extract_queue_id("see Q-20260101-120000 for details").as_deref(),
            Some("Q-20260101-120000")
        );
        assert!(extract_queue_id("no id here").is_none());
    }
}
