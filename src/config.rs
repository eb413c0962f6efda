//! Configuration for the bridge
//!
//! Settings live in a JSON file under the user config directory and can be
//! overridden per-process with `OPSBRIDGE_*` environment variables. The
//! chat token is env-only and never written to disk.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the chat provider's Web API.
    pub chat_api_base: String,
    /// Root of the managed repository patches are applied to.
    pub repo_root: PathBuf,
    /// Named repository -> working directory, for `repo=<name>` commands.
    pub repo_map: HashMap<String, PathBuf>,
    /// Durable approval queue (JSON array file).
    pub queue_path: PathBuf,
    /// Channel queue items are proposed in when the item names none.
    pub queue_channel: Option<String>,
    /// Queue poll interval in seconds; 0 disables the poller.
    pub queue_interval_secs: u64,
    /// Directory holding per-proposal code job directories.
    pub jobs_dir: PathBuf,
    pub exec_timeout_secs: u64,
    pub exec_allow_destructive: bool,
    pub code_mode_enabled: bool,
    pub exec_mode_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("opsbridge");
        Self {
            chat_api_base: "https://slack.com/api".to_string(),
            repo_root: PathBuf::from("."),
            repo_map: HashMap::new(),
            queue_path: PathBuf::from("tasks/approval_queue.json"),
            queue_channel: None,
            queue_interval_secs: 3600,
            jobs_dir: data.join("jobs"),
            exec_timeout_secs: 45,
            exec_allow_destructive: false,
            code_mode_enabled: true,
            exec_mode_enabled: true,
        }
    }
}

impl Config {
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("opsbridge"))
    }

    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk (missing file means defaults), then apply
    /// environment overrides.
    pub fn load() -> Self {
        let mut config = Self::load_file();
        config.apply_env();
        config
    }

    fn load_file() -> Self {
        if let Some(path) = Self::config_path() {
            if let Ok(content) = fs::read_to_string(&path) {
                match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(err) => {
                        preserve_corrupt_config(&path, &content);
                        tracing::warn!(
                            "config file was corrupted ({}); backup saved, defaults loaded",
                            err
                        );
                    }
                }
            }
        }
        Self::default()
    }

    /// Save config to disk.
    pub fn save(&self) -> anyhow::Result<()> {
        let dir = Self::config_dir()
            .ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?;
        fs::create_dir_all(&dir)?;
        let path = dir.join("config.json");
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content)?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("OPSBRIDGE_CHAT_API") {
            if !v.trim().is_empty() {
                self.chat_api_base = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("OPSBRIDGE_REPO_ROOT") {
            if !v.trim().is_empty() {
                self.repo_root = PathBuf::from(v.trim());
            }
        }
        if let Ok(v) = std::env::var("OPSBRIDGE_REPO_MAP") {
            if !v.trim().is_empty() {
                self.repo_map = parse_repo_map(&v);
            }
        }
        if let Ok(v) = std::env::var("OPSBRIDGE_QUEUE_PATH") {
            if !v.trim().is_empty() {
                self.queue_path = PathBuf::from(v.trim());
            }
        }
        if let Ok(v) = std::env::var("OPSBRIDGE_QUEUE_CHANNEL") {
            if !v.trim().is_empty() {
                self.queue_channel = Some(v.trim().to_string());
            }
        }
        if let Ok(v) = std::env::var("OPSBRIDGE_QUEUE_INTERVAL") {
            if let Ok(secs) = v.trim().parse() {
                self.queue_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("OPSBRIDGE_JOBS_DIR") {
            if !v.trim().is_empty() {
                self.jobs_dir = PathBuf::from(v.trim());
            }
        }
        if let Ok(v) = std::env::var("OPSBRIDGE_EXEC_TIMEOUT") {
            if let Ok(secs) = v.trim().parse() {
                self.exec_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("OPSBRIDGE_EXEC_ALLOW_DESTRUCTIVE") {
            self.exec_allow_destructive = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("OPSBRIDGE_CODE_MODE") {
            self.code_mode_enabled = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("OPSBRIDGE_EXEC_MODE") {
            self.exec_mode_enabled = parse_bool(&v);
        }
    }

    /// Chat API token. Env-only; required for `serve`.
    pub fn chat_token() -> Option<String> {
        std::env::var("OPSBRIDGE_CHAT_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}

/// Parse a `name=path;name=path` repo map. Names are lowercased; entries
/// without both halves are skipped.
pub fn parse_repo_map(raw: &str) -> HashMap<String, PathBuf> {
    let mut out = HashMap::new();
    for entry in raw.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((name, path)) = entry.split_once('=') else {
            continue;
        };
        let name = name.trim().to_lowercase();
        let path = path.trim();
        if !name.is_empty() && !path.is_empty() {
            out.insert(name, PathBuf::from(path));
        }
    }
    out
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repo_map() {
        let map = parse_repo_map("widgets=/srv/widgets; Gears = /srv/gears ;broken;=x;y=");
        assert_eq!(map.len(), 2);
        assert_eq!(map["widgets"], PathBuf::from("/srv/widgets"));
        assert_eq!(map["gears"], PathBuf::from("/srv/gears"));
    }

    #[test]
    fn test_parse_repo_map_empty() {
        assert!(parse_repo_map("").is_empty());
        assert!(parse_repo_map("   ;  ; ").is_empty());
    }

    #[test]
    fn test_parse_bool() {
        for v in ["1", "true", "YES", " True "] {
            assert!(parse_bool(v), "{}", v);
        }
        for v in ["0", "false", "no", "", "maybe"] {
            assert!(!parse_bool(v), "{}", v);
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.exec_timeout_secs, 45);
        assert_eq!(config.queue_interval_secs, 3600);
        assert!(config.code_mode_enabled);
        assert!(!config.exec_allow_destructive);
    }
}
