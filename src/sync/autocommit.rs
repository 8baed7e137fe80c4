//! Auto-commit of working-tree deltas into a synthetic commit.
//!
//! Used both for sync-before-read ("auto-commit") and for preserving local
//! edits before a push replay ("auto-stash").  The engine always ends up on
//! a named branch before committing: a detached HEAD is recovered onto the
//! default branch through checkout, create-and-checkout, and finally forced
//! checkout.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument};

use crate::git::commands::{
    git_checkout, git_checkout_force, git_checkout_new_branch, git_commit, git_current_branch,
    git_stage_path, git_stage_removal, CommitIdentity,
};
use crate::git::status::StatusMatrix;

/// What the synthetic commit is for; selects identity and message tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPurpose {
    AutoCommit,
    AutoStash,
}

impl CommitPurpose {
    fn tag(self) -> &'static str {
        match self {
            Self::AutoCommit => "auto-commit",
            Self::AutoStash => "auto-stash",
        }
    }

    fn identity(self) -> CommitIdentity {
        match self {
            Self::AutoCommit => CommitIdentity {
                name: "Forgebench Auto-Commit",
                email: "auto-commit@forgebench.local",
            },
            Self::AutoStash => CommitIdentity {
                name: "Forgebench Auto-Stash",
                email: "auto-stash@forgebench.local",
            },
        }
    }
}

/// Result of a non-empty auto-commit.
#[derive(Debug, Clone)]
pub struct AutoCommitOutcome {
    /// Id of the created commit.
    pub commit: String,
    /// Branch the commit landed on.
    pub branch: String,
    /// Ordered snapshot of the paths that were changed, captured before any
    /// mutation.  The replay path uses this as its restore manifest.
    pub changed_paths: Vec<String>,
}

/// Commit every working-tree delta in `workdir`.
///
/// Returns `None` when the status matrix reports no changes; callers must
/// treat that as "nothing to sync".  No ref or index mutation happens in
/// that case.
#[instrument(skip(workdir), fields(workdir = %workdir.display(), ?purpose))]
pub async fn auto_commit(
    workdir: &Path,
    default_branch: &str,
    purpose: CommitPurpose,
) -> Result<Option<AutoCommitOutcome>> {
    let matrix = StatusMatrix::compute(workdir).await?;
    if !matrix.has_changes() {
        debug!("working tree is clean; nothing to commit");
        return Ok(None);
    }

    let branch = match git_current_branch(workdir).await? {
        Some(branch) => branch,
        None => {
            info!(branch = default_branch, "HEAD is detached; recovering onto branch");
            ensure_branch(workdir, default_branch).await?;
            default_branch.to_string()
        }
    };

    let changed_paths = matrix.changed_paths();
    for entry in matrix.entries() {
        if entry.workdir_deleted() {
            git_stage_removal(workdir, &entry.path)
                .await
                .with_context(|| format!("failed to stage removal of {}", entry.path))?;
        } else {
            git_stage_path(workdir, &entry.path)
                .await
                .with_context(|| format!("failed to stage {}", entry.path))?;
        }
    }

    let message = format!("{} at {}", purpose.tag(), Utc::now().to_rfc3339());
    let commit = git_commit(workdir, &message, purpose.identity()).await?;

    info!(
        %commit,
        %branch,
        paths = changed_paths.len(),
        "committed working-tree changes"
    );

    Ok(Some(AutoCommitOutcome {
        commit,
        branch,
        changed_paths,
    }))
}

/// Land on `branch` no matter what state the working tree is in.
///
/// Three tiers, tried in order: plain checkout, create-and-checkout for a
/// branch that does not exist yet, forced checkout as the last resort when
/// a dirty tree blocks the switch.
async fn ensure_branch(workdir: &Path, branch: &str) -> Result<()> {
    if git_checkout(workdir, branch).await.is_ok() {
        return Ok(());
    }

    info!(%branch, "checkout failed; attempting to create the branch");
    if git_checkout_new_branch(workdir, branch).await.is_ok() {
        return Ok(());
    }

    info!(%branch, "branch exists but could not be checked out; forcing");
    git_checkout_force(workdir, branch)
        .await
        .with_context(|| format!("failed to force-checkout branch {branch}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::tempdir;

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = StdCommand::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .expect("failed to run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    fn init_repo(dir: &Path) {
        git(dir, &["init"]);
        git(dir, &["symbolic-ref", "HEAD", "refs/heads/master"]);
        git(dir, &["config", "user.name", "test"]);
        git(dir, &["config", "user.email", "test@example.com"]);
    }

    fn commit_file(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-m", "seed"]);
    }

    #[tokio::test]
    async fn clean_tree_is_a_noop() {
        let tmp = tempdir().unwrap();
        init_repo(tmp.path());
        commit_file(tmp.path(), "a.txt", "a");
        let head_before = git(tmp.path(), &["rev-parse", "HEAD"]);

        let outcome = auto_commit(tmp.path(), "master", CommitPurpose::AutoCommit)
            .await
            .unwrap();

        assert!(outcome.is_none());
        assert_eq!(git(tmp.path(), &["rev-parse", "HEAD"]), head_before);
    }

    #[tokio::test]
    async fn commits_untracked_and_modified_paths() {
        let tmp = tempdir().unwrap();
        init_repo(tmp.path());
        commit_file(tmp.path(), "a.txt", "a");

        std::fs::write(tmp.path().join("a.txt"), "a2").unwrap();
        std::fs::write(tmp.path().join("b.txt"), "b").unwrap();

        let outcome = auto_commit(tmp.path(), "master", CommitPurpose::AutoCommit)
            .await
            .unwrap()
            .expect("changes should produce a commit");

        assert_eq!(outcome.branch, "master");
        assert_eq!(outcome.changed_paths, vec!["a.txt", "b.txt"]);

        let subject = git(tmp.path(), &["log", "-1", "--format=%s"]);
        assert!(subject.starts_with("auto-commit at "), "subject: {subject}");

        // Tree is clean afterwards.
        let status = git(tmp.path(), &["status", "--porcelain"]);
        assert!(status.trim().is_empty(), "status: {status}");
    }

    #[tokio::test]
    async fn stages_deletions_as_removals() {
        let tmp = tempdir().unwrap();
        init_repo(tmp.path());
        commit_file(tmp.path(), "a.txt", "a");
        std::fs::write(tmp.path().join("b.txt"), "b").unwrap();
        git(tmp.path(), &["add", "."]);
        git(tmp.path(), &["commit", "-m", "two files"]);

        std::fs::remove_file(tmp.path().join("a.txt")).unwrap();

        let outcome = auto_commit(tmp.path(), "master", CommitPurpose::AutoCommit)
            .await
            .unwrap()
            .expect("deletion is a change");
        assert_eq!(outcome.changed_paths, vec!["a.txt"]);

        let show = git(tmp.path(), &["show", "--name-status", "--format=", "HEAD"]);
        assert!(show.contains("D\ta.txt"), "show: {show}");
    }

    #[tokio::test]
    async fn detached_head_recovers_onto_master() {
        let tmp = tempdir().unwrap();
        init_repo(tmp.path());
        commit_file(tmp.path(), "a.txt", "a");
        git(tmp.path(), &["checkout", "--detach"]);

        std::fs::write(tmp.path().join("a.txt"), "edited while detached").unwrap();

        let outcome = auto_commit(tmp.path(), "master", CommitPurpose::AutoCommit)
            .await
            .unwrap()
            .expect("dirty tree should commit");

        assert_eq!(outcome.branch, "master");
        let branch = git(tmp.path(), &["symbolic-ref", "--short", "HEAD"]);
        assert_eq!(branch.trim(), "master");
        let contents = std::fs::read_to_string(tmp.path().join("a.txt")).unwrap();
        assert_eq!(contents, "edited while detached");
    }

    #[tokio::test]
    async fn stash_purpose_uses_stash_identity() {
        let tmp = tempdir().unwrap();
        init_repo(tmp.path());
        commit_file(tmp.path(), "a.txt", "a");
        std::fs::write(tmp.path().join("a.txt"), "dirty").unwrap();

        auto_commit(tmp.path(), "master", CommitPurpose::AutoStash)
            .await
            .unwrap()
            .expect("dirty tree should stash");

        let author = git(tmp.path(), &["log", "-1", "--format=%an"]);
        assert_eq!(author.trim(), "Forgebench Auto-Stash");
        let subject = git(tmp.path(), &["log", "-1", "--format=%s"]);
        assert!(subject.starts_with("auto-stash at "));
    }
}
