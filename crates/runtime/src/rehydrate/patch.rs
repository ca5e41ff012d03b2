//! Patch application: unified diffs and search/replace blocks.
//!
//! Unified-diff hunks are validated against the file length before any line
//! is touched. Search/replace blocks replace the first occurrence only.
//! A per-path lock serializes concurrent patches to the same file.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::vfs::VirtualFileSystem;
use crate::types::PatchError;

/// Patch formats the applier understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    Unified,
    SearchReplace,
}

pub fn detect(patch: &str) -> Result<PatchKind, PatchError> {
    if patch.contains("<<<<<<< SEARCH") {
        return Ok(PatchKind::SearchReplace);
    }
    if patch.lines().any(|line| line.starts_with("@@ -")) {
        return Ok(PatchKind::Unified);
    }
    Err(PatchError::UnsupportedFormat)
}

/// Apply `patch` to `file_path` inside the VFS.
pub fn apply_patch(
    vfs: &mut VirtualFileSystem,
    file_path: &str,
    patch: &str,
    mtime: i64,
) -> Result<(), PatchError> {
    let kind = detect(patch)?;
    let existing = vfs.read_file(file_path).map(str::to_owned);
    let updated = match kind {
        PatchKind::Unified => apply_unified(existing.as_deref(), patch)?,
        PatchKind::SearchReplace => {
            let content = existing.ok_or_else(|| PatchError::FileNotFound(file_path.into()))?;
            apply_search_replace(&content, patch, file_path)?
        }
    };
    vfs.write_file(file_path, &updated, mtime)
        .map_err(|e| PatchError::InvalidHunk(e.to_string()))
}

#[derive(Debug)]
struct Hunk {
    old_start: usize,
    old_count: usize,
    lines: Vec<HunkLine>,
}

#[derive(Debug)]
enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

fn parse_hunk_header(line: &str) -> Result<(usize, usize), PatchError> {
    // "@@ -old_start,old_count +new_start,new_count @@"
    let inner = line
        .trim_start_matches("@@")
        .trim_end_matches("@@")
        .trim();
    let old_part = inner
        .split_whitespace()
        .find(|part| part.starts_with('-'))
        .ok_or_else(|| PatchError::InvalidHunk(format!("malformed header: {line}")))?;
    let spec = &old_part[1..];
    let (start, count) = match spec.split_once(',') {
        Some((start, count)) => (start, count),
        None => (spec, "1"),
    };
    let start: usize = start
        .parse()
        .map_err(|_| PatchError::InvalidHunk(format!("malformed header: {line}")))?;
    let count: usize = count
        .parse()
        .map_err(|_| PatchError::InvalidHunk(format!("malformed header: {line}")))?;
    Ok((start, count))
}

fn parse_unified(patch: &str) -> Result<Vec<Hunk>, PatchError> {
    let mut hunks: Vec<Hunk> = Vec::new();
    for line in patch.lines() {
        if line.starts_with("---") || line.starts_with("+++") || line.starts_with("diff ") {
            continue;
        }
        if line.starts_with("@@") {
            let (old_start, old_count) = parse_hunk_header(line)?;
            hunks.push(Hunk {
                old_start,
                old_count,
                lines: Vec::new(),
            });
            continue;
        }
        let Some(hunk) = hunks.last_mut() else {
            continue;
        };
        if let Some(rest) = line.strip_prefix('+') {
            hunk.lines.push(HunkLine::Add(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix('-') {
            hunk.lines.push(HunkLine::Remove(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix(' ') {
            hunk.lines.push(HunkLine::Context(rest.to_string()));
        } else if line == "\\ No newline at end of file" {
            continue;
        } else if !line.is_empty() {
            hunk.lines.push(HunkLine::Context(line.to_string()));
        }
    }
    if hunks.is_empty() {
        return Err(PatchError::InvalidHunk("patch contains no hunks".into()));
    }
    Ok(hunks)
}

fn apply_unified(existing: Option<&str>, patch: &str) -> Result<String, PatchError> {
    let hunks = parse_unified(patch)?;

    let mut lines: Vec<String> = match existing {
        Some(content) => content.lines().map(String::from).collect(),
        None => {
            // A missing file is only creatable by pure-insert hunks.
            if hunks.iter().any(|h| h.old_count > 0) {
                return Err(PatchError::InvalidHunk(
                    "hunk references lines of a missing file".into(),
                ));
            }
            Vec::new()
        }
    };

    // Validate every hunk against the pre-patch length before touching
    // anything.
    for hunk in &hunks {
        if hunk.old_count > 0 && hunk.old_start + hunk.old_count - 1 > lines.len() {
            return Err(PatchError::InvalidHunk(format!(
                "hunk -{},{} exceeds file length {}",
                hunk.old_start,
                hunk.old_count,
                lines.len()
            )));
        }
    }

    let mut offset: isize = 0;
    for hunk in &hunks {
        // old_start is 1-based; 0 means insert at the very beginning.
        let base = hunk.old_start.saturating_sub(1);
        let mut cursor = (base as isize + offset) as usize;
        for hunk_line in &hunk.lines {
            match hunk_line {
                HunkLine::Context(expected) => {
                    if lines.get(cursor).map(String::as_str) != Some(expected.as_str()) {
                        return Err(PatchError::InvalidHunk(format!(
                            "context mismatch at line {}",
                            cursor + 1
                        )));
                    }
                    cursor += 1;
                }
                HunkLine::Remove(expected) => {
                    if lines.get(cursor).map(String::as_str) != Some(expected.as_str()) {
                        return Err(PatchError::InvalidHunk(format!(
                            "removed line mismatch at line {}",
                            cursor + 1
                        )));
                    }
                    lines.remove(cursor);
                    offset -= 1;
                }
                HunkLine::Add(added) => {
                    let at = cursor.min(lines.len());
                    lines.insert(at, added.clone());
                    cursor += 1;
                    offset += 1;
                }
            }
        }
    }
    Ok(lines.join("\n"))
}

fn apply_search_replace(
    content: &str,
    patch: &str,
    file_path: &str,
) -> Result<String, PatchError> {
    let mut updated = content.to_string();
    for (search, replace) in parse_search_replace_blocks(patch)? {
        if !updated.contains(&search) {
            return Err(PatchError::SearchNotFound {
                path: file_path.to_string(),
            });
        }
        updated = updated.replacen(&search, &replace, 1);
    }
    Ok(updated)
}

fn parse_search_replace_blocks(patch: &str) -> Result<Vec<(String, String)>, PatchError> {
    let mut blocks = Vec::new();
    let mut rest = patch;
    while let Some(start) = rest.find("<<<<<<< SEARCH") {
        let after_start = &rest[start + "<<<<<<< SEARCH".len()..];
        let after_start = after_start.strip_prefix('\n').unwrap_or(after_start);
        let divider = after_start
            .find("\n=======")
            .ok_or(PatchError::UnsupportedFormat)?;
        let search = &after_start[..divider];
        let after_divider = &after_start[divider + "\n=======".len()..];
        let after_divider = after_divider.strip_prefix('\n').unwrap_or(after_divider);
        let end = after_divider
            .find("\n>>>>>>> REPLACE")
            .ok_or(PatchError::UnsupportedFormat)?;
        let replace = &after_divider[..end];
        blocks.push((search.to_string(), replace.to_string()));
        rest = &after_divider[end + "\n>>>>>>> REPLACE".len()..];
    }
    if blocks.is_empty() {
        return Err(PatchError::UnsupportedFormat);
    }
    Ok(blocks)
}

/// Per-path async locks serializing in-flight patches.
#[derive(Default)]
pub struct FileLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, path: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vfs_with(path: &str, content: &str) -> VirtualFileSystem {
        let mut vfs = VirtualFileSystem::new();
        vfs.write_file(path, content, 0).unwrap();
        vfs
    }

    #[test]
    fn unified_diff_replaces_a_line() {
        let mut vfs = vfs_with("main.rs", "fn main() {\n    old();\n}");
        let patch = "@@ -1,3 +1,3 @@\n fn main() {\n-    old();\n+    new();\n }";
        apply_patch(&mut vfs, "main.rs", patch, 10).unwrap();
        assert_eq!(vfs.read_file("main.rs"), Some("fn main() {\n    new();\n}"));
    }

    #[test]
    fn hunk_exceeding_file_length_is_invalid() {
        let mut vfs = vfs_with("short.txt", "one\ntwo");
        let patch = "@@ -1,5 +1,5 @@\n one\n two\n three\n four\n five";
        let err = apply_patch(&mut vfs, "short.txt", patch, 10).unwrap_err();
        match err {
            PatchError::InvalidHunk(_) => {
                assert!(err.to_string().starts_with("Invalid hunk"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // The file is untouched on rejection.
        assert_eq!(vfs.read_file("short.txt"), Some("one\ntwo"));
    }

    #[test]
    fn context_mismatch_is_invalid() {
        let mut vfs = vfs_with("a.txt", "alpha\nbeta");
        let patch = "@@ -1,2 +1,2 @@\n alpha\n-gamma\n+delta";
        assert!(matches!(
            apply_patch(&mut vfs, "a.txt", patch, 10),
            Err(PatchError::InvalidHunk(_))
        ));
    }

    #[test]
    fn creation_patch_builds_a_new_file() {
        let mut vfs = VirtualFileSystem::new();
        let patch = "@@ -0,0 +1,2 @@\n+hello\n+world";
        apply_patch(&mut vfs, "new.txt", patch, 10).unwrap();
        assert_eq!(vfs.read_file("new.txt"), Some("hello\nworld"));
    }

    #[test]
    fn search_replace_hits_first_occurrence_only() {
        let mut vfs = vfs_with("b.txt", "x = 1; x = 1;");
        let patch = "<<<<<<< SEARCH\nx = 1;\n=======\nx = 2;\n>>>>>>> REPLACE\n";
        apply_patch(&mut vfs, "b.txt", patch, 10).unwrap();
        assert_eq!(vfs.read_file("b.txt"), Some("x = 2; x = 1;"));
    }

    #[test]
    fn search_block_must_match() {
        let mut vfs = vfs_with("b.txt", "nothing to see");
        let patch = "<<<<<<< SEARCH\nmissing text\n=======\nreplacement\n>>>>>>> REPLACE\n";
        assert!(matches!(
            apply_patch(&mut vfs, "b.txt", patch, 10),
            Err(PatchError::SearchNotFound { .. })
        ));
    }

    #[test]
    fn multiple_search_replace_blocks_apply_in_order() {
        let mut vfs = vfs_with("c.txt", "foo bar baz");
        let patch = "<<<<<<< SEARCH\nfoo\n=======\nFOO\n>>>>>>> REPLACE\n\
                     <<<<<<< SEARCH\nbaz\n=======\nBAZ\n>>>>>>> REPLACE\n";
        apply_patch(&mut vfs, "c.txt", patch, 10).unwrap();
        assert_eq!(vfs.read_file("c.txt"), Some("FOO bar BAZ"));
    }

    #[test]
    fn unknown_format_is_rejected() {
        let mut vfs = vfs_with("d.txt", "content");
        assert!(matches!(
            apply_patch(&mut vfs, "d.txt", "just some text", 10),
            Err(PatchError::UnsupportedFormat)
        ));
    }

    #[tokio::test]
    async fn file_locks_serialize_by_path() {
        let locks = Arc::new(FileLocks::new());
        let guard = locks.lock("src/main.rs").await;
        let other = Arc::clone(&locks);
        let contended = tokio::spawn(async move {
            let _guard = other.lock("src/main.rs").await;
        });
        // The second lock cannot complete while the first is held.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contended.is_finished());
        drop(guard);
        contended.await.unwrap();
    }
}
