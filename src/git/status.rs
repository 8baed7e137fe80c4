//! Three-way working-tree status.
//!
//! Wraps `git status --porcelain=v1 -z` and exposes the result as a matrix
//! of per-path states across HEAD, the working tree, and the stage.  The
//! porcelain listing only reports paths whose three states are not all
//! equal, so every entry in a computed matrix is a changed path; the entry
//! order is git's traversal order and is stable within one computation,
//! which the replay path relies on for its restore manifest.

use std::path::Path;

use anyhow::Result;
use tracing::warn;

use crate::git::commands::git_status_porcelain;

// ---------------------------------------------------------------------------
// Entry states
// ---------------------------------------------------------------------------

/// Presence of a path in the last commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadState {
    Absent,
    Present,
}

/// Content identity of a path in the working tree or the stage, relative to
/// HEAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeState {
    Absent,
    Unmodified,
    Modified,
}

/// One row of the status matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub path: String,
    pub head: HeadState,
    pub workdir: TreeState,
    pub stage: TreeState,
}

impl StatusEntry {
    /// A path is changed iff its three states are not all equal.
    pub fn is_changed(&self) -> bool {
        !(self.head == HeadState::Present
            && self.workdir == TreeState::Unmodified
            && self.stage == TreeState::Unmodified)
    }

    /// The working-tree state signals a deletion.
    pub fn workdir_deleted(&self) -> bool {
        self.workdir == TreeState::Absent
    }
}

// ---------------------------------------------------------------------------
// Matrix
// ---------------------------------------------------------------------------

/// Ordered set of changed paths for one working tree.
#[derive(Debug, Clone, Default)]
pub struct StatusMatrix {
    entries: Vec<StatusEntry>,
}

impl StatusMatrix {
    /// Compute the matrix for `workdir` by invoking the underlying status
    /// porcelain.
    pub async fn compute(workdir: &Path) -> Result<Self> {
        let raw = git_status_porcelain(workdir).await?;
        Ok(Self {
            entries: parse_porcelain(&raw),
        })
    }

    pub fn entries(&self) -> &[StatusEntry] {
        &self.entries
    }

    pub fn has_changes(&self) -> bool {
        self.entries.iter().any(StatusEntry::is_changed)
    }

    /// Changed paths in traversal order.  Duplicates are impossible since
    /// status is per-path.
    pub fn changed_paths(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.is_changed())
            .map(|e| e.path.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Porcelain v1 parsing
// ---------------------------------------------------------------------------

/// Parse NUL-delimited `--porcelain=v1 -z` output.
///
/// Records are `XY <path>` with a second NUL-separated original path for
/// renames/copies; a rename expands into a new-path entry and a deleted
/// old-path entry.
fn parse_porcelain(raw: &[u8]) -> Vec<StatusEntry> {
    let mut entries = Vec::new();
    let mut fields = raw.split(|&b| b == 0).filter(|f| !f.is_empty());

    while let Some(record) = fields.next() {
        if record.len() < 4 {
            warn!(record = %String::from_utf8_lossy(record), "short status record");
            continue;
        }
        let (x, y) = (record[0], record[1]);
        let path = String::from_utf8_lossy(&record[3..]).into_owned();

        // Ignored entries should not appear without --ignored; skip defensively.
        if x == b'!' {
            continue;
        }

        // Untracked: absent from HEAD and stage, present in the worktree.
        if x == b'?' {
            entries.push(StatusEntry {
                path,
                head: HeadState::Absent,
                workdir: TreeState::Modified,
                stage: TreeState::Absent,
            });
            continue;
        }

        let renamed_from = if x == b'R' || x == b'C' {
            fields
                .next()
                .map(|f| String::from_utf8_lossy(f).into_owned())
        } else {
            None
        };

        let head = if x == b'A' || renamed_from.is_some() {
            HeadState::Absent
        } else {
            HeadState::Present
        };
        let stage = match x {
            b' ' => TreeState::Unmodified,
            b'D' => TreeState::Absent,
            _ => TreeState::Modified,
        };
        let workdir = match y {
            b' ' => stage,
            b'D' => TreeState::Absent,
            _ => TreeState::Modified,
        };

        entries.push(StatusEntry {
            path,
            head,
            workdir,
            stage,
        });

        // The rename source no longer exists anywhere but HEAD.
        if let Some(old_path) = renamed_from {
            // A copy leaves the source in place.
            if x == b'R' {
                entries.push(StatusEntry {
                    path: old_path,
                    head: HeadState::Present,
                    workdir: TreeState::Absent,
                    stage: TreeState::Absent,
                });
            }
        }
    }

    entries
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Vec<StatusEntry> {
        parse_porcelain(raw.as_bytes())
    }

    #[test]
    fn empty_output_is_clean() {
        let matrix = StatusMatrix {
            entries: parse(""),
        };
        assert!(!matrix.has_changes());
        assert!(matrix.changed_paths().is_empty());
    }

    #[test]
    fn untracked_file() {
        let entries = parse("?? new.txt\0");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "new.txt");
        assert_eq!(entries[0].head, HeadState::Absent);
        assert_eq!(entries[0].workdir, TreeState::Modified);
        assert_eq!(entries[0].stage, TreeState::Absent);
        assert!(entries[0].is_changed());
        assert!(!entries[0].workdir_deleted());
    }

    #[test]
    fn unstaged_modification() {
        let entries = parse(" M lib.rs\0");
        assert_eq!(entries[0].stage, TreeState::Unmodified);
        assert_eq!(entries[0].workdir, TreeState::Modified);
        assert_eq!(entries[0].head, HeadState::Present);
    }

    #[test]
    fn staged_modification_clean_worktree() {
        let entries = parse("M  lib.rs\0");
        assert_eq!(entries[0].stage, TreeState::Modified);
        // Worktree matches the stage.
        assert_eq!(entries[0].workdir, TreeState::Modified);
    }

    #[test]
    fn worktree_deletion() {
        let entries = parse(" D gone.txt\0");
        assert!(entries[0].workdir_deleted());
        assert_eq!(entries[0].stage, TreeState::Unmodified);
    }

    #[test]
    fn staged_deletion() {
        let entries = parse("D  gone.txt\0");
        assert!(entries[0].workdir_deleted());
        assert_eq!(entries[0].stage, TreeState::Absent);
        assert_eq!(entries[0].head, HeadState::Present);
    }

    #[test]
    fn staged_addition() {
        let entries = parse("A  new.txt\0");
        assert_eq!(entries[0].head, HeadState::Absent);
        assert_eq!(entries[0].stage, TreeState::Modified);
        assert_eq!(entries[0].workdir, TreeState::Modified);
    }

    #[test]
    fn rename_expands_to_two_entries() {
        let entries = parse("R  new.txt\0old.txt\0");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "new.txt");
        assert_eq!(entries[0].head, HeadState::Absent);
        assert_eq!(entries[1].path, "old.txt");
        assert!(entries[1].workdir_deleted());
        assert_eq!(entries[1].stage, TreeState::Absent);
    }

    #[test]
    fn order_is_preserved() {
        let entries = parse(" M b.txt\0?? a.txt\0 M c.txt\0");
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["b.txt", "a.txt", "c.txt"]);
    }

    #[test]
    fn short_record_is_skipped() {
        let entries = parse("M\0 M ok.txt\0");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "ok.txt");
    }
}
