//! Direct manipulation of loose branch-ref files.
//!
//! The sync engine writes `refs/heads/<branch>` files itself instead of
//! going through porcelain ref-update commands.  Reads fall back to
//! `packed-refs` so a repacked repository still resolves.  Updates on the
//! workdir→bare path go through [`cas_ref`], which fails on a concurrent
//! change instead of silently losing it.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, instrument};

fn branch_ref_path(git_dir: &Path, branch: &str) -> PathBuf {
    git_dir.join("refs").join("heads").join(branch)
}

fn validate_oid(oid: &str) -> Result<()> {
    // 40-hex SHA-1 or 64-hex SHA-256.
    if (oid.len() == 40 || oid.len() == 64) && oid.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Ok(());
    }
    bail!("invalid object id: {oid:?}");
}

/// Read the commit id a branch points at, or `None` when the branch does
/// not exist (neither loose nor packed).
pub async fn read_ref(git_dir: &Path, branch: &str) -> Result<Option<String>> {
    let ref_path = branch_ref_path(git_dir, branch);
    match tokio::fs::read_to_string(&ref_path).await {
        Ok(contents) => return Ok(Some(contents.trim().to_string())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read ref file: {}", ref_path.display()));
        }
    }

    // Loose file absent; the ref may live in packed-refs.
    let packed = git_dir.join("packed-refs");
    let contents = match tokio::fs::read_to_string(&packed).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read packed-refs: {}", packed.display()));
        }
    };

    let wanted = format!("refs/heads/{branch}");
    for line in contents.lines() {
        if line.starts_with('#') || line.starts_with('^') {
            continue;
        }
        if let Some((oid, name)) = line.split_once(' ') {
            if name.trim() == wanted {
                return Ok(Some(oid.trim().to_string()));
            }
        }
    }
    Ok(None)
}

/// Write a branch ref file, unconditionally (last writer wins).
///
/// The contents are written to a lock file and renamed into place so a
/// concurrent reader never observes a partial oid.
#[instrument(fields(git_dir = %git_dir.display(), %branch, %oid))]
pub async fn write_ref(git_dir: &Path, branch: &str, oid: &str) -> Result<()> {
    validate_oid(oid)?;

    let ref_path = branch_ref_path(git_dir, branch);
    if let Some(parent) = ref_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create ref directory: {}", parent.display()))?;
    }

    // Append rather than replace an extension; branch names may contain dots.
    let lock_path = {
        let mut os = ref_path.clone().into_os_string();
        os.push(".lock");
        PathBuf::from(os)
    };
    tokio::fs::write(&lock_path, format!("{oid}\n"))
        .await
        .with_context(|| format!("failed to write ref lock file: {}", lock_path.display()))?;
    tokio::fs::rename(&lock_path, &ref_path)
        .await
        .with_context(|| format!("failed to move ref into place: {}", ref_path.display()))?;

    debug!("ref written");
    Ok(())
}

/// Update a branch ref only if it still has the expected value.
///
/// `expected` is `None` when the branch is not supposed to exist yet.  A
/// mismatch means another writer (a concurrent push) got there first; the
/// caller decides whether that is fatal.
#[instrument(fields(git_dir = %git_dir.display(), %branch))]
pub async fn cas_ref(
    git_dir: &Path,
    branch: &str,
    expected: Option<&str>,
    new_oid: &str,
) -> Result<()> {
    let current = read_ref(git_dir, branch).await?;
    if current.as_deref() != expected {
        bail!(
            "ref {branch} changed concurrently: expected {:?}, found {:?}",
            expected,
            current
        );
    }
    write_ref(git_dir, branch, new_oid).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const OID_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const OID_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let tmp = tempdir().unwrap();
        write_ref(tmp.path(), "master", OID_A).await.unwrap();

        let contents = std::fs::read_to_string(tmp.path().join("refs/heads/master")).unwrap();
        assert_eq!(contents, format!("{OID_A}\n"));
        assert_eq!(
            read_ref(tmp.path(), "master").await.unwrap().as_deref(),
            Some(OID_A)
        );
    }

    #[tokio::test]
    async fn read_missing_ref_is_none() {
        let tmp = tempdir().unwrap();
        assert_eq!(read_ref(tmp.path(), "master").await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_falls_back_to_packed_refs() {
        let tmp = tempdir().unwrap();
        std::fs::write(
            tmp.path().join("packed-refs"),
            format!(
                "# pack-refs with: peeled fully-peeled sorted\n{OID_A} refs/heads/master\n^{OID_B}\n"
            ),
        )
        .unwrap();

        assert_eq!(
            read_ref(tmp.path(), "master").await.unwrap().as_deref(),
            Some(OID_A)
        );
        assert_eq!(read_ref(tmp.path(), "other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn loose_ref_shadows_packed() {
        let tmp = tempdir().unwrap();
        std::fs::write(
            tmp.path().join("packed-refs"),
            format!("{OID_A} refs/heads/master\n"),
        )
        .unwrap();
        write_ref(tmp.path(), "master", OID_B).await.unwrap();

        assert_eq!(
            read_ref(tmp.path(), "master").await.unwrap().as_deref(),
            Some(OID_B)
        );
    }

    #[tokio::test]
    async fn rejects_bogus_oid() {
        let tmp = tempdir().unwrap();
        assert!(write_ref(tmp.path(), "master", "not-an-oid").await.is_err());
        assert!(write_ref(tmp.path(), "master", "").await.is_err());
    }

    #[tokio::test]
    async fn cas_succeeds_on_expected_value() {
        let tmp = tempdir().unwrap();
        write_ref(tmp.path(), "master", OID_A).await.unwrap();

        cas_ref(tmp.path(), "master", Some(OID_A), OID_B)
            .await
            .unwrap();
        assert_eq!(
            read_ref(tmp.path(), "master").await.unwrap().as_deref(),
            Some(OID_B)
        );
    }

    #[tokio::test]
    async fn cas_fails_on_concurrent_change() {
        let tmp = tempdir().unwrap();
        write_ref(tmp.path(), "master", OID_B).await.unwrap();

        let result = cas_ref(tmp.path(), "master", Some(OID_A), OID_A).await;
        assert!(result.is_err());
        // The losing update must not clobber the ref.
        assert_eq!(
            read_ref(tmp.path(), "master").await.unwrap().as_deref(),
            Some(OID_B)
        );
    }

    #[tokio::test]
    async fn cas_with_none_expects_absent_branch() {
        let tmp = tempdir().unwrap();

        cas_ref(tmp.path(), "master", None, OID_A).await.unwrap();
        assert!(cas_ref(tmp.path(), "master", None, OID_B).await.is_err());
    }

    #[tokio::test]
    async fn branch_names_with_slashes_create_subdirectories() {
        let tmp = tempdir().unwrap();
        write_ref(tmp.path(), "feature/nested", OID_A).await.unwrap();
        assert_eq!(
            read_ref(tmp.path(), "feature/nested")
                .await
                .unwrap()
                .as_deref(),
            Some(OID_A)
        );
    }
}
