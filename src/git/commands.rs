//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every function in this module shells out to the system `git` binary for
//! the actual work: index/commit/checkout mutations for the sync engine and
//! the `--stateless-rpc` protocol endpoints for the transport gate.  Object
//! and ref *files* are manipulated directly elsewhere (`git::objects`,
//! `git::refs`); everything that needs git's own semantics goes through
//! here.
//!
//! All functions are fully `async` and use the Tokio process runtime.

use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// Synthetic identity used for auto-commit / auto-stash commits.
#[derive(Debug, Clone, Copy)]
pub struct CommitIdentity {
    pub name: &'static str,
    pub email: &'static str,
}

/// Which smart-HTTP service endpoint to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitService {
    UploadPack,
    ReceivePack,
}

impl GitService {
    /// Protocol name as it appears in `info/refs?service=...`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    fn subcommand(&self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }
}

// ---------------------------------------------------------------------------
// Command construction
// ---------------------------------------------------------------------------

/// Base `git` command pointed at `repo`, with prompts and hooks disabled.
fn git_command(repo: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(repo);
    cmd.args(["-c", "core.hooksPath="]);
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd
}

fn check_status(output: &std::process::Output, what: &str) -> Result<()> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{what} failed (status {}): {}", output.status, stderr.trim());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Run `git status --porcelain=v1 -z --untracked-files=all` and return the
/// raw NUL-delimited output.  Parsing lives in [`crate::git::status`].
#[instrument(fields(workdir = %workdir.display()))]
pub async fn git_status_porcelain(workdir: &Path) -> Result<Vec<u8>> {
    let output = git_command(workdir)
        .args(["status", "--porcelain=v1", "-z", "--untracked-files=all"])
        .output()
        .await
        .context("failed to spawn git status")?;
    check_status(&output, "git status")?;
    Ok(output.stdout)
}

// ---------------------------------------------------------------------------
// Branch resolution and checkout
// ---------------------------------------------------------------------------

/// Return the branch HEAD points at, or `None` when HEAD is detached.
#[instrument(fields(workdir = %workdir.display()))]
pub async fn git_current_branch(workdir: &Path) -> Result<Option<String>> {
    let output = git_command(workdir)
        .args(["symbolic-ref", "--short", "-q", "HEAD"])
        .output()
        .await
        .context("failed to spawn git symbolic-ref")?;

    if output.status.success() {
        let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
        return Ok(Some(branch));
    }

    // `-q` exits 1 with no output for a detached HEAD; anything on stderr
    // means a real failure (e.g. not a repository).
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.trim().is_empty() {
        debug!("HEAD is detached");
        Ok(None)
    } else {
        bail!(
            "git symbolic-ref failed (status {}): {}",
            output.status,
            stderr.trim()
        );
    }
}

/// Run `git checkout <branch>`.
#[instrument(fields(workdir = %workdir.display(), %branch))]
pub async fn git_checkout(workdir: &Path, branch: &str) -> Result<()> {
    let output = git_command(workdir)
        .args(["checkout", "--quiet", branch])
        .output()
        .await
        .context("failed to spawn git checkout")?;
    check_status(&output, "git checkout")
}

/// Run `git checkout -b <branch>` (create and switch).
#[instrument(fields(workdir = %workdir.display(), %branch))]
pub async fn git_checkout_new_branch(workdir: &Path, branch: &str) -> Result<()> {
    let output = git_command(workdir)
        .args(["checkout", "--quiet", "-b", branch])
        .output()
        .await
        .context("failed to spawn git checkout -b")?;
    check_status(&output, "git checkout -b")
}

/// Run `git checkout -f <branch>`.  Destructive: working-tree files are
/// overwritten to match the branch tip.
#[instrument(fields(workdir = %workdir.display(), %branch))]
pub async fn git_checkout_force(workdir: &Path, branch: &str) -> Result<()> {
    let output = git_command(workdir)
        .args(["checkout", "--quiet", "-f", branch])
        .output()
        .await
        .context("failed to spawn git checkout -f")?;
    check_status(&output, "git checkout -f")
}

/// Run `git checkout <commit> -- <path>`, restoring a single path's content
/// (worktree and index) from the given commit.
#[instrument(fields(workdir = %workdir.display(), %commit, %path))]
pub async fn git_checkout_path_from(workdir: &Path, commit: &str, path: &str) -> Result<()> {
    let output = git_command(workdir)
        .args(["checkout", "--quiet", commit, "--"])
        .arg(path)
        .output()
        .await
        .context("failed to spawn git checkout -- <path>")?;
    check_status(&output, "git checkout -- <path>")
}

// ---------------------------------------------------------------------------
// Staging and commit
// ---------------------------------------------------------------------------

/// Stage a single added or modified path.
pub async fn git_stage_path(workdir: &Path, path: &str) -> Result<()> {
    let output = git_command(workdir)
        .args(["add", "--"])
        .arg(path)
        .output()
        .await
        .context("failed to spawn git add")?;
    check_status(&output, "git add")
}

/// Stage the removal of a path that is gone from the working tree.
pub async fn git_stage_removal(workdir: &Path, path: &str) -> Result<()> {
    let output = git_command(workdir)
        .args(["rm", "--cached", "--ignore-unmatch", "--quiet", "--"])
        .arg(path)
        .output()
        .await
        .context("failed to spawn git rm --cached")?;
    check_status(&output, "git rm --cached")
}

/// Commit the index with the given message and synthetic identity; returns
/// the new commit id.
#[instrument(skip(message), fields(workdir = %workdir.display()))]
pub async fn git_commit(
    workdir: &Path,
    message: &str,
    identity: CommitIdentity,
) -> Result<String> {
    let output = git_command(workdir)
        .args(["-c", "commit.gpgsign=false", "commit", "--quiet", "-m"])
        .arg(message)
        .env("GIT_AUTHOR_NAME", identity.name)
        .env("GIT_AUTHOR_EMAIL", identity.email)
        .env("GIT_COMMITTER_NAME", identity.name)
        .env("GIT_COMMITTER_EMAIL", identity.email)
        .output()
        .await
        .context("failed to spawn git commit")?;
    check_status(&output, "git commit")?;

    let commit = git_rev_parse(workdir, "HEAD").await?;
    debug!(%commit, "commit created");
    Ok(commit)
}

/// Run `git rev-parse <rev>` and return the resolved object id.
pub async fn git_rev_parse(repo: &Path, rev: &str) -> Result<String> {
    let output = git_command(repo)
        .args(["rev-parse", rev])
        .output()
        .await
        .context("failed to spawn git rev-parse")?;
    check_status(&output, "git rev-parse")?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// List index-tracked paths (`git ls-files -z`).
pub async fn git_ls_files(workdir: &Path) -> Result<Vec<String>> {
    let output = git_command(workdir)
        .args(["ls-files", "-z"])
        .output()
        .await
        .context("failed to spawn git ls-files")?;
    check_status(&output, "git ls-files")?;

    Ok(output
        .stdout
        .split(|&b| b == 0)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect())
}

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

/// Initialise a new bare Git repository at `path`.
///
/// If the directory already contains a valid bare repo (has a `HEAD` file),
/// this is a no-op.
#[instrument(fields(path = %path.display()))]
pub async fn git_init_bare(path: &Path) -> Result<()> {
    if path.join("HEAD").is_file() {
        debug!("bare repo already exists; skipping init");
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create parent directory: {}", parent.display()))?;
    }

    let mut cmd = Command::new("git");
    cmd.arg("init").arg("--bare").arg(path);
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let output = cmd.output().await.context("failed to spawn git init --bare")?;
    check_status(&output, "git init --bare")?;

    debug!("bare repo initialised");
    Ok(())
}

// ---------------------------------------------------------------------------
// Smart-HTTP protocol endpoints
// ---------------------------------------------------------------------------

/// Run the service's `--stateless-rpc --advertise-refs` mode and return the
/// raw ref advertisement (without the smart-HTTP service header framing).
#[instrument(fields(repo = %repo.display(), service = service.name()))]
pub async fn git_advertise_refs(repo: &Path, service: GitService) -> Result<Vec<u8>> {
    let output = git_command(repo)
        .args([service.subcommand(), "--stateless-rpc", "--advertise-refs", "."])
        .output()
        .await
        .with_context(|| format!("failed to spawn git {}", service.subcommand()))?;
    check_status(&output, service.name())?;
    Ok(output.stdout)
}

/// Pipe `input` through `git <service> --stateless-rpc <repo>` and return
/// the complete stdout as bytes.
#[instrument(skip(input), fields(repo = %repo.display(), service = service.name(), input_len = input.len()))]
pub async fn git_serve_rpc(repo: &Path, service: GitService, input: &[u8]) -> Result<Vec<u8>> {
    let mut cmd = git_command(repo);
    cmd.args([service.subcommand(), "--stateless-rpc", "."]);
    cmd.stdin(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn git {}", service.subcommand()))?;

    // Write the request body to stdin, then close it to signal EOF.
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input)
            .await
            .with_context(|| format!("failed to write to git {} stdin", service.subcommand()))?;
        drop(stdin);
    }

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("git {} failed", service.subcommand()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(
            status = %output.status,
            stderr = %stderr,
            "git {} exited with non-zero status",
            service.subcommand()
        );
    }

    Ok(output.stdout)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
