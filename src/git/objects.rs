//! Mirroring of git object-store trees between repositories.
//!
//! Copies the loose-object fan-out directories (and anything else under
//! `objects/`, pack directories included) from one git directory to another.
//! Two policies cover the two sync directions: workdir→bare overwrites,
//! bare→workdir only fills gaps so the workdir's own objects -- the stash
//! commit in particular -- survive.  Individual file failures are logged and
//! skipped; they never abort the walk.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

/// How to treat files that already exist at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorPolicy {
    /// Overwrite unconditionally, clearing a read-only bit first.
    Overwrite,
    /// Copy only when the destination file does not yet exist.
    CreateIfAbsent,
}

/// Counters for one mirror pass, used for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorStats {
    pub copied: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Recursively copy the tree rooted at `src` into `dest` under `policy`.
///
/// A missing source directory is a no-op, not an error.  The walk is
/// synchronous file-system work, so it runs on the blocking pool.
#[instrument(fields(src = %src.display(), dest = %dest.display(), ?policy))]
pub async fn mirror_tree(src: &Path, dest: &Path, policy: MirrorPolicy) -> Result<MirrorStats> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();

    let stats = tokio::task::spawn_blocking(move || mirror_tree_sync(&src, &dest, policy))
        .await
        .context("mirror task panicked")?;

    debug!(
        copied = stats.copied,
        skipped = stats.skipped,
        failed = stats.failed,
        "mirror pass complete"
    );
    Ok(stats)
}

/// Synchronous implementation of [`mirror_tree`].
pub fn mirror_tree_sync(src: &Path, dest: &Path, policy: MirrorPolicy) -> MirrorStats {
    let mut stats = MirrorStats::default();

    if !src.exists() {
        debug!(src = %src.display(), "source directory missing; nothing to mirror");
        return stats;
    }

    let mut stack: Vec<(PathBuf, PathBuf)> = vec![(src.to_path_buf(), dest.to_path_buf())];
    while let Some((src_dir, dest_dir)) = stack.pop() {
        if let Err(err) = std::fs::create_dir_all(&dest_dir) {
            warn!(
                dir = %dest_dir.display(),
                error = %err,
                "failed to create destination directory; skipping subtree"
            );
            stats.failed += 1;
            continue;
        }

        let entries = match std::fs::read_dir(&src_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    dir = %src_dir.display(),
                    error = %err,
                    "failed to read source directory; skipping subtree"
                );
                stats.failed += 1;
                continue;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(_) => continue,
            };

            let target = dest_dir.join(entry.file_name());
            if file_type.is_dir() {
                stack.push((entry.path(), target));
            } else if file_type.is_file() {
                copy_file(&entry.path(), &target, policy, &mut stats);
            }
            // Symlinks and other special files are ignored.
        }
    }

    stats
}

fn copy_file(src: &Path, dest: &Path, policy: MirrorPolicy, stats: &mut MirrorStats) {
    let dest_exists = dest.exists();

    if policy == MirrorPolicy::CreateIfAbsent && dest_exists {
        stats.skipped += 1;
        return;
    }

    // Loose objects are written read-only; clear the bit or the copy fails.
    if dest_exists {
        if let Ok(metadata) = std::fs::metadata(dest) {
            let mut permissions = metadata.permissions();
            if permissions.readonly() {
                #[allow(clippy::permissions_set_readonly_false)]
                permissions.set_readonly(false);
                let _ = std::fs::set_permissions(dest, permissions);
            }
        }
    }

    match std::fs::copy(src, dest) {
        Ok(_) => stats.copied += 1,
        Err(err) => {
            warn!(
                src = %src.display(),
                dest = %dest.display(),
                error = %err,
                "could not copy object file"
            );
            stats.failed += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
