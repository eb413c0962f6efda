//! Add-only manual patch fallback
//!
//! When the strict patcher rejects a diff, hunks that only add lines can
//! still be placed by anchoring on context text. Partial, non-destructive
//! recovery is the contract: this path never deletes, never reorders, and
//! never creates files.

use crate::diff::ParsedDiff;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

/// Apply add-only hunks from `parsed` against files under `repo_root`.
///
/// Returns `Ok(true)` if any line was inserted. Fails the whole file when
/// the target does not exist or any of its hunks carries removed lines.
pub fn manual_apply(parsed: &ParsedDiff, repo_root: &Path) -> Result<bool> {
    let mut applied_any = false;

    for (rel_path, hunks) in parsed {
        let path = repo_root.join(rel_path);
        if !path.exists() {
            bail!("manual apply failed: file not found {}", rel_path);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", rel_path))?;
        let mut lines: Vec<String> = content.lines().map(|s| s.to_string()).collect();
        let mut file_changed = false;

        for hunk in hunks {
            if !hunk.dels.is_empty() {
                bail!("manual apply failed: deletes present in diff for {}", rel_path);
            }
            if hunk.adds.is_empty() {
                continue;
            }

            // Anchor: the last context line (scanning the hunk's context in
            // reverse) with an exact match in the file, searched from the
            // end backwards. No match means append at end-of-file.
            let mut insert_at: Option<usize> = None;
            for ctx in hunk.context.iter().rev() {
                if let Some(idx) = lines.iter().rposition(|l| l == ctx) {
                    insert_at = Some(idx + 1);
                    break;
                }
            }
            let mut cursor = insert_at.unwrap_or(lines.len());

            for add in &hunk.adds {
                // Skip lines already present anywhere: double-apply guard.
                if lines.iter().any(|l| l == add) {
                    continue;
                }
                lines.insert(cursor, add.clone());
                cursor += 1;
                file_changed = true;
            }
        }

        if file_changed {
            fs::write(&path, format!("{}\n", lines.join("\n")))
                .with_context(|| format!("failed to write {}", rel_path))?;
            applied_any = true;
        }
    }

    Ok(applied_any)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{normalize_diff, parse_normalized_diff};
    use std::fs;

    fn apply_raw(dir: &Path, raw: &str) -> Result<bool> {
        let normalized = normalize_diff(raw, dir);
        let parsed = parse_normalized_diff(&normalized);
        manual_apply(&parsed, dir)
    }

    #[test]
    fn test_insert_after_context_anchor() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x.txt"), "foo\n").unwrap();
        let raw = "--- a/x.txt\n+++ b/x.txt\n@@ -1,1 +1,2 @@\n foo\n+bar\n";
        assert!(apply_raw(dir.path(), raw).unwrap());
        let result = fs::read_to_string(dir.path().join("x.txt")).unwrap();
        assert_eq!(result, "foo\nbar\n");
    }

    #[test]
    fn test_add_only_diff_reproduces_after_content() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("list.txt"), "alpha\nbeta\ngamma\n").unwrap();
        let raw = "\
--- a/list.txt
+++ b/list.txt
@@ -1,3 +1,5 @@
 alpha
 beta
 gamma
+delta
+epsilon
";
        assert!(apply_raw(dir.path(), raw).unwrap());
        let result = fs::read_to_string(dir.path().join("list.txt")).unwrap();
        assert_eq!(result, "alpha\nbeta\ngamma\ndelta\nepsilon\n");
    }

    #[test]
    fn test_interleaved_adds_anchor_on_last_context() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("list.txt"), "alpha\nbeta\ngamma\n").unwrap();
        let raw = "\
--- a/list.txt
+++ b/list.txt
@@ -1,3 +1,5 @@
 alpha
 beta
+beta-prime
 gamma
+delta
";
        assert!(apply_raw(dir.path(), raw).unwrap());
        let result = fs::read_to_string(dir.path().join("list.txt")).unwrap();
        // Anchoring is last-context based: both adds land after the final
        // matching context line, in diff order. Best-effort, not positional.
        assert_eq!(result, "alpha\nbeta\ngamma\nbeta-prime\ndelta\n");
    }

    #[test]
    fn test_never_removes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let before = "a\nb\nc\n";
        fs::write(dir.path().join("f.txt"), before).unwrap();
        let raw = "--- a/f.txt\n+++ b/f.txt\n@@ @@\n b\n+b2\n";
        apply_raw(dir.path(), raw).unwrap();
        let after = fs::read_to_string(dir.path().join("f.txt")).unwrap();
        for line in before.lines() {
            assert!(after.lines().any(|l| l == line));
        }
        assert!(after.lines().count() >= before.lines().count());
    }

    #[test]
    fn test_deletes_fail_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f.txt"), "a\n").unwrap();
        let raw = "--- a/f.txt\n+++ b/f.txt\n@@ @@\n-a\n+b\n";
        let err = apply_raw(dir.path(), raw).unwrap_err();
        assert!(err.to_string().contains("deletes present"));
        // Nothing was written.
        assert_eq!(fs::read_to_string(dir.path().join("f.txt")).unwrap(), "a\n");
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let raw = "--- a/ghost.txt\n+++ b/ghost.txt\n@@ @@\n+x\n";
        let err = apply_raw(dir.path(), raw).unwrap_err();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_double_apply_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x.txt"), "foo\n").unwrap();
        let raw = "--- a/x.txt\n+++ b/x.txt\n@@ -1,1 +1,2 @@\n foo\n+bar\n";
        assert!(apply_raw(dir.path(), raw).unwrap());
        // Second pass finds every added line already present.
        assert!(!apply_raw(dir.path(), raw).unwrap());
        let result = fs::read_to_string(dir.path().join("x.txt")).unwrap();
        assert_eq!(result, "foo\nbar\n");
    }

    #[test]
    fn test_no_context_match_appends_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x.txt"), "one\ntwo\n").unwrap();
        let raw = "--- a/x.txt\n+++ b/x.txt\n@@ @@\n nothing-matches\n+tail\n";
        assert!(apply_raw(dir.path(), raw).unwrap());
        let result = fs::read_to_string(dir.path().join("x.txt")).unwrap();
        assert_eq!(result, "one\ntwo\ntail\n");
    }
}
