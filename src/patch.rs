//! Patch application for approved code jobs
//!
//! A job directory (written by the out-of-process proposal generator)
//! carries the raw request, the raw diff, and a summary. Application is a
//! ladder: strict `git apply`, retry with `--recount`, a reverse dry-run to
//! detect an already-applied diff, then the add-only manual fallback for
//! code jobs. Whatever lands on disk is staged and committed; a push
//! failure demotes to a warning because the local commit already holds the
//! change.

use crate::diff::{normalize_diff, parse_normalized_diff};
use crate::git_ops;
use crate::manual_apply::manual_apply;
use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::path::Path;
use std::process::Command;

/// File names inside a job directory. External contract with the
/// proposal generator; do not rename.
pub const REQUEST_FILE: &str = "request.txt";
pub const DIFF_FILE: &str = "change.diff";
pub const NORMALIZED_DIFF_FILE: &str = "change.normalized.diff";
pub const SUMMARY_FILE: &str = "summary.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    AlreadyApplied,
}

#[derive(Debug)]
pub struct ApplyReport {
    pub outcome: ApplyOutcome,
    pub detail: String,
    /// Set when the post-commit push failed; the job itself still succeeded.
    pub push_warning: Option<String>,
}

/// Apply the diff in `job_dir` against `repo_root`.
///
/// `code_mode` enables the manual add-only fallback; exec-style callers
/// keep the strict-only behavior.
pub fn apply_job(job_dir: &Path, repo_root: &Path, code_mode: bool) -> Result<ApplyReport> {
    let diff_path = job_dir.join(DIFF_FILE);
    let raw = fs::read_to_string(&diff_path)
        .with_context(|| format!("missing {} in {}", DIFF_FILE, job_dir.display()))?;
    if raw.trim().is_empty() {
        bail!("diff is empty or invalid; aborting");
    }

    let normalized = normalize_diff(&raw, repo_root);
    let normalized_path = job_dir.join(NORMALIZED_DIFF_FILE);
    fs::write(&normalized_path, &normalized)
        .with_context(|| format!("failed to write {}", normalized_path.display()))?;

    match strict_apply(&normalized_path, repo_root)? {
        StrictResult::Applied => {}
        StrictResult::AlreadyApplied => {
            return Ok(ApplyReport {
                outcome: ApplyOutcome::AlreadyApplied,
                detail: "patch already applied".to_string(),
                push_warning: None,
            });
        }
        StrictResult::Failed(primary_err) => {
            if !code_mode {
                return Err(anyhow!("git apply failed: {}", primary_err));
            }
            // Last resort for code jobs: add-only manual placement. A
            // manual failure is swallowed in favor of the more informative
            // strict-apply error.
            let parsed = parse_normalized_diff(&normalized);
            match manual_apply(&parsed, repo_root) {
                Ok(true) => {}
                Ok(false) => return Err(anyhow!("git apply failed: {}", primary_err)),
                Err(_) => return Err(anyhow!("git apply failed: {}", primary_err)),
            }
        }
    }

    // Bookkeeping: commit failure is fatal (the patch is on disk but
    // unrecorded), push failure is a warning only.
    git_ops::stage_all(repo_root)?;
    let job_name = job_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    let commit_msg = format!("opsbridge apply: {}", job_name);
    let sha = git_ops::commit(repo_root, &commit_msg)
        .context("patch applied but git commit failed")?;

    let push_warning = match git_ops::push(repo_root) {
        Ok(_) => None,
        Err(e) => Some(format!("patch committed, but push failed: {}", e)),
    };

    Ok(ApplyReport {
        outcome: ApplyOutcome::Applied,
        detail: format!("patch applied, commit {}", &sha[..8.min(sha.len())]),
        push_warning,
    })
}

enum StrictResult {
    Applied,
    AlreadyApplied,
    Failed(String),
}

/// The strict external patcher: `git apply`, then `--recount` for bad hunk
/// line counts, then `--reverse --check` to spot an already-present diff.
fn strict_apply(diff_path: &Path, repo_root: &Path) -> Result<StrictResult> {
    let first = run_git_apply(repo_root, &["apply"], diff_path)?;
    if first.ok {
        return Ok(StrictResult::Applied);
    }

    let recount = run_git_apply(repo_root, &["apply", "--recount"], diff_path)?;
    if recount.ok {
        return Ok(StrictResult::Applied);
    }

    let reverse = run_git_apply(repo_root, &["apply", "--reverse", "--check"], diff_path)?;
    if reverse.ok {
        // Best-effort: a cleanly reversible diff means the changes are
        // already present. Not an error.
        return Ok(StrictResult::AlreadyApplied);
    }

    // Report the original failure, not the retries.
    Ok(StrictResult::Failed(first.output))
}

struct GitApplyRun {
    ok: bool,
    output: String,
}

fn run_git_apply(repo_root: &Path, args: &[&str], diff_path: &Path) -> Result<GitApplyRun> {
    let out = Command::new("git")
        .current_dir(repo_root)
        .args(args)
        .arg(diff_path)
        .output()
        .context("failed to execute git apply")?;

    let mut combined = String::new();
    combined.push_str(&String::from_utf8_lossy(&out.stdout));
    if !out.stderr.is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&String::from_utf8_lossy(&out.stderr));
    }

    Ok(GitApplyRun {
        ok: out.status.success(),
        output: combined.trim().to_string(),
    })
}
