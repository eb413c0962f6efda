//! Gated shell command execution
//!
//! Every command passes a destructive-intent check and a working-directory
//! resolution step before anything is spawned. The deny-list is substring
//! based and deliberately over-blocks; the override flag exists for the
//! rare legitimate case.

use crate::util::{run_command_with_timeout, truncate};
use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// Substrings that mark a command as destructive. Case-insensitive match.
const DESTRUCTIVE_TOKENS: &[&str] = &[
    "rm -rf",
    "rm -r",
    "shutdown",
    "reboot",
    "mkfs",
    "dd if=",
    "format ",
    "del /f",
];

/// Cap on captured output kept in a result message.
const OUTPUT_BUDGET: usize = 2800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Ok,
    Error,
}

#[derive(Debug)]
pub struct ExecOutcome {
    pub status: ExecStatus,
    /// Combined stdout+stderr, truncated to the display budget.
    pub output: String,
    pub timed_out: bool,
}

pub fn is_destructive(cmd: &str) -> bool {
    let lowered = cmd.to_lowercase();
    DESTRUCTIVE_TOKENS.iter().any(|t| lowered.contains(t))
}

/// Resolve the working directory for a command.
///
/// A named repo must exist in the configured map; an unknown name is an
/// error before anything runs. No name falls back to the default root.
pub fn resolve_workdir(
    repo: Option<&str>,
    repo_map: &HashMap<String, PathBuf>,
    default_root: &Path,
) -> Result<PathBuf> {
    match repo {
        Some(name) => {
            let key = name.trim().to_lowercase();
            repo_map
                .get(&key)
                .cloned()
                .ok_or_else(|| anyhow!("unknown repo '{}'; update the repo map", key))
        }
        None => Ok(default_root.to_path_buf()),
    }
}

/// Run a shell command under the gate.
///
/// Blocked commands and empty input fail before any subprocess is spawned.
/// A timeout is reported distinctly from a non-zero exit.
pub fn run_gated(
    command: &str,
    cwd: &Path,
    timeout: Duration,
    allow_destructive: bool,
) -> Result<ExecOutcome> {
    if command.trim().is_empty() {
        bail!("missing command to execute");
    }
    if is_destructive(command) && !allow_destructive {
        bail!("command blocked: destructive commands require the destructive override");
    }

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).current_dir(cwd);

    let result = run_command_with_timeout(&mut cmd, timeout)
        .map_err(|e| anyhow!("exec failed: {}", e))?;

    if result.timed_out {
        return Ok(ExecOutcome {
            status: ExecStatus::Error,
            output: format!("command timed out after {}s", timeout.as_secs()),
            timed_out: true,
        });
    }

    let combined = result.combined_output();
    let output = if combined.trim().is_empty() {
        "(no output)".to_string()
    } else {
        truncate(combined.trim(), OUTPUT_BUDGET)
    };

    let ok = result.status.map(|s| s.success()).unwrap_or(false);
    Ok(ExecOutcome {
        status: if ok { ExecStatus::Ok } else { ExecStatus::Error },
        output,
        timed_out: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo_map(entries: &[(&str, &str)]) -> HashMap<String, PathBuf> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), PathBuf::from(v)))
            .collect()
    }

    #[test]
    fn test_destructive_detection() {
        assert!(is_destructive("rm -rf /"));
        assert!(is_destructive("sudo RM -RF /tmp"));
        assert!(is_destructive("dd if=/dev/zero of=/dev/sda"));
        assert!(is_destructive("shutdown -h now"));
        assert!(!is_destructive("ls -la"));
        assert!(!is_destructive("cargo test"));
    }

    #[test]
    fn test_destructive_blocked_without_override() {
        let tmp = tempfile::tempdir().unwrap();
        // A marker file would be created if the shell ever ran.
        let cmd = format!("rm -rf / ; touch {}/ran", tmp.path().display());
        let err = run_gated(&cmd, tmp.path(), Duration::from_secs(5), false).unwrap_err();
        assert!(err.to_string().contains("blocked"));
        assert!(!tmp.path().join("ran").exists());
    }

    #[test]
    fn test_resolve_workdir_named_repo() {
        let map = repo_map(&[("widgets", "/srv/widgets")]);
        let cwd = resolve_workdir(Some("widgets"), &map, Path::new("/default")).unwrap();
        assert_eq!(cwd, PathBuf::from("/srv/widgets"));
        // Lookup is case-insensitive on the name.
        let cwd = resolve_workdir(Some("Widgets"), &map, Path::new("/default")).unwrap();
        assert_eq!(cwd, PathBuf::from("/srv/widgets"));
    }

    #[test]
    fn test_resolve_workdir_unknown_repo() {
        let map = repo_map(&[("widgets", "/srv/widgets")]);
        let err = resolve_workdir(Some("gears"), &map, Path::new("/default")).unwrap_err();
        assert!(err.to_string().contains("unknown repo 'gears'"));
    }

    #[test]
    fn test_resolve_workdir_default() {
        let map = repo_map(&[]);
        let cwd = resolve_workdir(None, &map, Path::new("/default")).unwrap();
        assert_eq!(cwd, PathBuf::from("/default"));
    }

    #[test]
    fn test_run_combines_output() {
        let tmp = tempfile::tempdir().unwrap();
        let outcome = run_gated(
            "echo out; echo err >&2",
            tmp.path(),
            Duration::from_secs(5),
            false,
        )
        .unwrap();
        assert_eq!(outcome.status, ExecStatus::Ok);
        assert_eq!(outcome.output, "out\nerr");
    }

    #[test]
    fn test_nonzero_exit_is_error_not_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let outcome = run_gated("exit 3", tmp.path(), Duration::from_secs(5), false).unwrap();
        assert_eq!(outcome.status, ExecStatus::Error);
        assert!(!outcome.timed_out);
    }

    #[test]
    fn test_timeout_reported_distinctly() {
        let tmp = tempfile::tempdir().unwrap();
        let outcome = run_gated("sleep 10", tmp.path(), Duration::from_millis(100), false).unwrap();
        assert_eq!(outcome.status, ExecStatus::Error);
        assert!(outcome.timed_out);
        assert!(outcome.output.contains("timed out"));
    }

    #[test]
    fn test_empty_output_placeholder() {
        let tmp = tempfile::tempdir().unwrap();
        let outcome = run_gated("true", tmp.path(), Duration::from_secs(5), false).unwrap();
        assert_eq!(outcome.output, "(no output)");
    }
}
