//! Diff normalization and parsing
//!
//! Upstream patch generators hand us loosely-structured unified diffs:
//! markdown fences, absolute paths, missing `diff --git` headers. The
//! normalizer rewrites those into a form the strict patcher accepts; the
//! parser produces the per-file hunk view used by the manual fallback.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One hunk of a unified diff, split by line role.
///
/// Hunk-header line counts are ignored entirely: the fallback applier
/// anchors on context text, never on line numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hunk {
    pub context: Vec<String>,
    pub adds: Vec<String>,
    pub dels: Vec<String>,
}

impl Hunk {
    pub fn is_empty(&self) -> bool {
        self.context.is_empty() && self.adds.is_empty() && self.dels.is_empty()
    }
}

/// Repository-relative path -> hunks, in order of appearance.
/// If a path repeats, the last file header wins.
pub type ParsedDiff = BTreeMap<String, Vec<Hunk>>;

/// Rewrite a raw diff blob into git-apply friendly form.
///
/// - Markdown code-fence lines are dropped.
/// - Text already carrying `diff --git` headers passes through.
/// - Bare `--- old` / `+++ new` pairs get a synthesized `diff --git` header
///   with repository-relative `a/`/`b/` paths.
///
/// The output always ends with exactly one trailing newline, and the
/// function is idempotent over its own output.
pub fn normalize_diff(raw: &str, repo_root: &Path) -> String {
    let mut kept: Vec<&str> = Vec::new();
    for line in raw.lines() {
        if line.trim_start().starts_with("```") {
            continue;
        }
        kept.push(line);
    }
    let text = kept.join("\n");

    if text.trim_start().starts_with("diff --git") {
        return ensure_trailing_newline(&text);
    }

    let lines: Vec<&str> = text.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if line.starts_with("--- ") && i + 1 < lines.len() && lines[i + 1].starts_with("+++ ") {
            let mut old_path = relativize(&lines[i][4..], repo_root);
            let mut new_path = relativize(&lines[i + 1][4..], repo_root);
            if old_path.is_empty() {
                old_path = new_path.clone();
            }
            if new_path.is_empty() {
                new_path = old_path.clone();
            }
            if old_path.is_empty() && new_path.is_empty() {
                // Both sides were the null device: invalid input, pass the
                // pair through unresolved and let the strict patcher reject it.
                out.push(lines[i].to_string());
                out.push(lines[i + 1].to_string());
            } else {
                out.push(format!("diff --git a/{} b/{}", old_path, new_path));
                out.push(format!("--- a/{}", old_path));
                out.push(format!("+++ b/{}", new_path));
            }
            i += 2;
            continue;
        }
        out.push(line.to_string());
        i += 1;
    }

    ensure_trailing_newline(&out.join("\n"))
}

/// Resolve a diff header path to repository-relative form.
///
/// The null device maps to an empty string so the caller can substitute
/// the other side's path. Absolute paths outside the repository fall back
/// to the file's base name.
fn relativize(raw: &str, repo_root: &Path) -> String {
    let mut p = raw.trim();
    // Drop a trailing timestamp column if present.
    if let Some(tab) = p.find('\t') {
        p = &p[..tab];
    }
    let p = p.trim_matches('"');
    if p == "/dev/null" || p == "dev/null" {
        return String::new();
    }
    let p = p.strip_prefix("a/").or_else(|| p.strip_prefix("b/")).unwrap_or(p);

    let path = PathBuf::from(p);
    if path.is_absolute() {
        let root = repo_root.canonicalize().unwrap_or_else(|_| repo_root.to_path_buf());
        let resolved = path.canonicalize().unwrap_or(path);
        match resolved.strip_prefix(&root) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => resolved
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    } else {
        path.to_string_lossy().replace('\\', "/")
    }
}

fn ensure_trailing_newline(s: &str) -> String {
    let trimmed = s.trim_end_matches('\n');
    format!("{}\n", trimmed)
}

/// Parse a normalized diff into per-file hunks.
///
/// Lenient by design: `@@` headers only delimit hunks, `+`/`-` lines are
/// adds/dels, and every other line (blank lines included) is context.
pub fn parse_normalized_diff(text: &str) -> ParsedDiff {
    let mut files = ParsedDiff::new();
    let mut current: Option<String> = None;
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut open = Hunk::default();

    fn flush_hunk(open: &mut Hunk, hunks: &mut Vec<Hunk>) {
        if !open.is_empty() {
            hunks.push(std::mem::take(open));
        }
    }

    for line in text.lines() {
        if line.starts_with("diff --git") {
            flush_hunk(&mut open, &mut hunks);
            if let Some(path) = current.take() {
                if !hunks.is_empty() {
                    files.insert(path, std::mem::take(&mut hunks));
                }
            }
            hunks.clear();
            continue;
        }
        if let Some(rest) = line.strip_prefix("+++ ") {
            let path = rest.trim();
            let path = path.strip_prefix("b/").unwrap_or(path);
            current = Some(path.to_string());
            continue;
        }
        if line.starts_with("--- ") {
            continue;
        }
        if line.starts_with("@@") {
            flush_hunk(&mut open, &mut hunks);
            continue;
        }
        if let Some(added) = line.strip_prefix('+') {
            open.adds.push(added.to_string());
            continue;
        }
        if let Some(removed) = line.strip_prefix('-') {
            open.dels.push(removed.to_string());
            continue;
        }
        // Context: strip the leading marker space when present; anything
        // else (blank lines, stray metadata) is kept verbatim as an anchor.
        let content = line.strip_prefix(' ').unwrap_or(line);
        open.context.push(content.to_string());
    }

    flush_hunk(&mut open, &mut hunks);
    if let Some(path) = current {
        if !hunks.is_empty() {
            files.insert(path, hunks);
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_adds_git_header() {
        let raw = "--- a/x.txt\n+++ b/x.txt\n@@ -1,1 +1,2 @@\n foo\n+bar\n";
        let normalized = normalize_diff(raw, Path::new("/tmp"));
        assert!(normalized.starts_with("diff --git a/x.txt b/x.txt\n"));
        assert!(normalized.contains("--- a/x.txt\n+++ b/x.txt\n"));
        assert!(normalized.ends_with("+bar\n"));
        assert!(!normalized.ends_with("\n\n"));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let raw = "```diff\n--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1 +1,2 @@\n one\n+two\n```\n";
        let once = normalize_diff(raw, Path::new("/tmp"));
        let twice = normalize_diff(&once, Path::new("/tmp"));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_normalize_strips_fences() {
        let raw = "```\ndiff --git a/f b/f\n--- a/f\n+++ b/f\n+x\n```";
        let normalized = normalize_diff(raw, Path::new("/tmp"));
        assert!(!normalized.contains("```"));
        assert!(normalized.starts_with("diff --git"));
    }

    #[test]
    fn test_normalize_dev_null_borrows_other_side() {
        let raw = "--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1 @@\n+hello\n";
        let normalized = normalize_diff(raw, Path::new("/tmp"));
        assert!(normalized.starts_with("diff --git a/new.txt b/new.txt\n"));
    }

    #[test]
    fn test_normalize_double_dev_null_passes_through() {
        let raw = "--- /dev/null\n+++ /dev/null\n@@ @@\n+x\n";
        let normalized = normalize_diff(raw, Path::new("/tmp"));
        assert!(normalized.contains("--- /dev/null\n+++ /dev/null\n"));
        assert!(!normalized.contains("diff --git"));
    }

    #[test]
    fn test_normalize_absolute_path_outside_root_uses_basename() {
        let dir = tempfile::tempdir().unwrap();
        let raw = "--- /somewhere/else/deep/file.rs\n+++ /somewhere/else/deep/file.rs\n+x\n";
        let normalized = normalize_diff(raw, dir.path());
        assert!(normalized.starts_with("diff --git a/file.rs b/file.rs\n"));
    }

    #[test]
    fn test_normalize_absolute_path_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join("src");
        std::fs::create_dir_all(&inner).unwrap();
        std::fs::write(inner.join("m.rs"), "x\n").unwrap();
        let raw = format!(
            "--- {0}/src/m.rs\n+++ {0}/src/m.rs\n+x\n",
            dir.path().display()
        );
        let normalized = normalize_diff(&raw, dir.path());
        assert!(normalized.starts_with("diff --git a/src/m.rs b/src/m.rs\n"));
    }

    #[test]
    fn test_parse_groups_hunks_by_file() {
        let diff = "diff --git a/x.txt b/x.txt\n--- a/x.txt\n+++ b/x.txt\n@@ -1,1 +1,2 @@\n foo\n+bar\n";
        let parsed = parse_normalized_diff(diff);
        assert_eq!(parsed.len(), 1);
        let hunks = &parsed["x.txt"];
        assert_eq!(hunks.len(), 1);
        assert_eq!(hunks[0].context, vec!["foo"]);
        assert_eq!(hunks[0].adds, vec!["bar"]);
        assert!(hunks[0].dels.is_empty());
    }

    #[test]
    fn test_parse_multiple_files_and_hunks() {
        let diff = "\
diff --git a/a.txt b/a.txt
--- a/a.txt
+++ b/a.txt
@@ -1 +1,2 @@
 one
+two
@@ -5 +6,7 @@
 five
+six
diff --git a/b.txt b/b.txt
--- a/b.txt
+++ b/b.txt
@@ -1 +1 @@
-old
+new
";
        let parsed = parse_normalized_diff(diff);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["a.txt"].len(), 2);
        assert_eq!(parsed["b.txt"][0].dels, vec!["old"]);
        assert_eq!(parsed["b.txt"][0].adds, vec!["new"]);
    }

    #[test]
    fn test_parse_last_header_wins_on_repeat() {
        let diff = "\
diff --git a/x.txt b/x.txt
+++ b/x.txt
+first
diff --git a/x.txt b/x.txt
+++ b/x.txt
+second
";
        let parsed = parse_normalized_diff(diff);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed["x.txt"][0].adds, vec!["second"]);
    }

    #[test]
    fn test_parse_blank_line_is_context() {
        let diff = "diff --git a/x b/x\n+++ b/x\n@@ @@\n a\n\n+b\n";
        let parsed = parse_normalized_diff(diff);
        assert_eq!(parsed["x"][0].context, vec!["a", ""]);
    }
}
