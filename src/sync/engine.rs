//! Bare↔workdir synchronization passes.
//!
//! The synchronizer owns both repository handles and orchestrates the
//! object-store mirror and the auto-commit engine in two directions:
//!
//! - **workdir→bare** runs before a fetch/clone is served so the bare
//!   repository reflects uncommitted edits.  Concurrent triggers coalesce
//!   through a single-flight gate: the in-flight pass's result is good
//!   enough for every caller that skipped.
//! - **bare→workdir** runs after a push completes.  Local edits are
//!   preserved as an auto-stash commit, the pushed commit is force-checked
//!   out, and the stashed paths that survive the push are restored by a
//!   deferred, tracked task.  The pushed commit always wins for the files
//!   it touches.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::git::commands::{
    git_checkout_force, git_checkout_path_from, git_current_branch, git_init_bare, git_ls_files,
};
use crate::git::objects::{mirror_tree, MirrorPolicy};
use crate::git::refs;
use crate::git::status::StatusMatrix;
use crate::singleflight::SingleFlight;
use crate::sync::autocommit::{auto_commit, CommitPurpose};

/// Result of a workdir→bare pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another pass was in flight; this trigger coalesced into it.
    Skipped,
    /// The working tree had nothing to sync.
    Clean,
    /// A new commit was mirrored into the bare repository.
    Synced { commit: String },
}

pub struct Synchronizer {
    workdir: PathBuf,
    bare: PathBuf,
    default_branch: String,
    restore_delay: Duration,
    gate: SingleFlight,
    /// Most recently scheduled stash-restore task.  A newer push supersedes
    /// (aborts) a pending restore; tests and shutdown can await it.
    restore_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Synchronizer {
    pub fn new(
        workdir: PathBuf,
        bare: PathBuf,
        default_branch: String,
        restore_delay: Duration,
    ) -> Self {
        Self {
            workdir,
            bare,
            default_branch,
            restore_delay,
            gate: SingleFlight::new("sync"),
            restore_task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn bare(&self) -> &Path {
        &self.bare
    }

    fn workdir_git_dir(&self) -> PathBuf {
        self.workdir.join(".git")
    }

    // -----------------------------------------------------------------------
    // Bootstrap
    // -----------------------------------------------------------------------

    /// Create the bare repository from the working tree if it does not exist
    /// yet.  Returns `true` when a new bare repo was created.
    ///
    /// A working tree that is not a git repository is a structural skip, not
    /// an error: the server keeps running without a bare mirror until the
    /// workdir becomes valid.
    #[instrument(skip(self), fields(bare = %self.bare.display()))]
    pub async fn bootstrap(&self) -> Result<bool> {
        if self.bare.join("HEAD").is_file() {
            debug!("bare repository already exists");
            return Ok(false);
        }

        if !self.workdir_git_dir().exists() {
            warn!(
                workdir = %self.workdir.display(),
                "working tree is not a git repository; serving without a bare mirror"
            );
            return Ok(false);
        }

        info!("creating bare repository from working tree");
        git_init_bare(&self.bare).await?;

        mirror_tree(
            &self.workdir_git_dir().join("objects"),
            &self.bare.join("objects"),
            MirrorPolicy::Overwrite,
        )
        .await?;
        mirror_tree(
            &self.workdir_git_dir().join("refs"),
            &self.bare.join("refs"),
            MirrorPolicy::Overwrite,
        )
        .await?;

        if let Some(branch) = git_current_branch(&self.workdir).await? {
            tokio::fs::write(self.bare.join("HEAD"), format!("ref: refs/heads/{branch}\n"))
                .await
                .context("failed to point bare HEAD at the working branch")?;
        }

        info!(bare = %self.bare.display(), "bare repository created");
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // workdir → bare
    // -----------------------------------------------------------------------

    /// Mirror uncommitted working-tree changes into the bare repository.
    ///
    /// Idempotent: with no pending edits this degrades to a no-op that
    /// touches neither refs nor the index.
    #[instrument(skip(self))]
    pub async fn sync_workdir_to_bare(&self) -> Result<SyncOutcome> {
        let Some(_guard) = self.gate.try_begin() else {
            debug!("sync already in progress; coalescing");
            return Ok(SyncOutcome::Skipped);
        };

        let Some(outcome) =
            auto_commit(&self.workdir, &self.default_branch, CommitPurpose::AutoCommit).await?
        else {
            debug!("no changes in working tree to sync");
            return Ok(SyncOutcome::Clean);
        };

        // Expectation for the ref update, taken before we mutate the bare
        // side; a push landing after this read makes the swap fail instead
        // of being silently overwritten.
        let expected = refs::read_ref(&self.bare, &outcome.branch).await?;

        let stats = mirror_tree(
            &self.workdir_git_dir().join("objects"),
            &self.bare.join("objects"),
            MirrorPolicy::Overwrite,
        )
        .await?;
        if stats.failed > 0 {
            warn!(failed = stats.failed, "some object files could not be mirrored");
        }

        refs::cas_ref(
            &self.bare,
            &outcome.branch,
            expected.as_deref(),
            &outcome.commit,
        )
        .await
        .context("bare ref update lost a race with a concurrent push")?;

        info!(
            commit = %outcome.commit,
            branch = %outcome.branch,
            objects_copied = stats.copied,
            "mirrored working tree into bare repository"
        );
        Ok(SyncOutcome::Synced {
            commit: outcome.commit,
        })
    }

    // -----------------------------------------------------------------------
    // bare → workdir
    // -----------------------------------------------------------------------

    /// Replay a pushed commit onto the working tree.
    ///
    /// Uncommitted local edits are preserved as an auto-stash commit before
    /// the forced checkout; paths not touched by the push are restored from
    /// the stash afterwards by a deferred task.
    #[instrument(skip(self), fields(%branch, %commit))]
    pub async fn sync_bare_to_workdir(&self, branch: &str, commit: &str) -> Result<()> {
        // Snapshot-and-stash must happen before anything mutates the tree;
        // the changed-path list is the restore manifest.
        let stash =
            auto_commit(&self.workdir, &self.default_branch, CommitPurpose::AutoStash).await?;
        if let Some(stash) = &stash {
            info!(
                stash = %stash.commit,
                paths = stash.changed_paths.len(),
                "stashed local edits before replay"
            );
        }

        // Never overwrite: the workdir's own objects, the fresh stash commit
        // included, must survive the mirror.
        mirror_tree(
            &self.bare.join("objects"),
            &self.workdir_git_dir().join("objects"),
            MirrorPolicy::CreateIfAbsent,
        )
        .await?;

        refs::write_ref(&self.workdir_git_dir(), branch, commit).await?;
        git_checkout_force(&self.workdir, branch).await?;

        if let Some(stash) = stash {
            self.schedule_restore(stash.commit, stash.changed_paths)
                .await;
        }

        info!("replayed pushed commit onto working tree");
        Ok(())
    }

    /// Schedule the deferred stash restore, superseding any pending one.
    async fn schedule_restore(&self, stash: String, manifest: Vec<String>) {
        let workdir = self.workdir.clone();
        let delay = self.restore_delay;

        let mut slot = self.restore_task.lock().await;
        if let Some(previous) = slot.take() {
            if !previous.is_finished() {
                warn!("aborting a pending stash restore superseded by a newer push");
                previous.abort();
            }
        }

        *slot = Some(tokio::spawn(async move {
            // Let the forced checkout settle before touching the tree again.
            tokio::time::sleep(delay).await;
            if let Err(err) = restore_stashed_paths(&workdir, &stash, &manifest).await {
                error!(error = %err, %stash, "stash restore failed");
            }
        }));
    }

    /// Await the most recently scheduled restore, if any.
    pub async fn wait_for_pending_restore(&self) {
        let handle = self.restore_task.lock().await.take();
        if let Some(handle) = handle {
            // An aborted or panicked restore was already logged.
            let _ = handle.await;
        }
    }
}

/// Restore each manifest path that still exists after the replay checkout.
///
/// Paths deleted by the incoming push are skipped, never resurrected.  A
/// failure on one path is logged and does not abort the remaining paths.
async fn restore_stashed_paths(workdir: &Path, stash: &str, manifest: &[String]) -> Result<()> {
    let mut surviving: HashSet<String> = git_ls_files(workdir).await?.into_iter().collect();
    // Untracked-but-present paths (the stash captured them, the push did not
    // touch them) still count as existing.
    let matrix = StatusMatrix::compute(workdir).await?;
    surviving.extend(matrix.changed_paths());

    let mut restored = 0usize;
    for path in manifest {
        if !surviving.contains(path) {
            info!(%path, "skipping restore: path was deleted by the incoming push");
            continue;
        }
        match git_checkout_path_from(workdir, stash, path).await {
            Ok(()) => restored += 1,
            Err(err) => warn!(%path, error = %err, "could not restore path from stash"),
        }
    }

    info!(restored, total = manifest.len(), "re-applied stashed edits");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
