//! Install+build pipeline for the working tree.
//!
//! One build at a time: a single-flight gate rejects overlapping runs
//! outright.  The pipeline ensures the package-registry config file exists,
//! then runs the install and build commands as child processes in the
//! workdir, streaming their output line-by-line to an optional progress
//! callback together with a heuristic percentage estimated from a
//! configurable marker table.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::config::{BuildConfig, ProgressConfig};
use crate::singleflight::SingleFlight;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Terminal result of a successful pipeline run.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// Which stream an output line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStream {
    Stdout,
    Stderr,
}

impl fmt::Display for BuildStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildPhase {
    Install,
    Build,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install => write!(f, "install"),
            Self::Build => write!(f, "build"),
        }
    }
}

pub type StartCallback = Arc<dyn Fn() + Send + Sync>;
pub type ProgressCallback = Arc<dyn Fn(&str, BuildStream, u8) + Send + Sync>;
pub type CompleteCallback = Arc<dyn Fn(&Result<BuildOutcome>) + Send + Sync>;

// ---------------------------------------------------------------------------
// Progress estimation
// ---------------------------------------------------------------------------

/// Output-derived progress percentage.
///
/// Install occupies `0..=install_ceiling`; the build phase ratchets through
/// the marker table up to 100.  The estimate only ever moves forward.
struct ProgressEstimator<'a> {
    config: &'a ProgressConfig,
    phase: BuildPhase,
    percent: f64,
}

impl<'a> ProgressEstimator<'a> {
    fn new(config: &'a ProgressConfig) -> Self {
        Self {
            config,
            phase: BuildPhase::Install,
            percent: 0.0,
        }
    }

    fn enter(&mut self, phase: BuildPhase) {
        self.phase = phase;
        if phase == BuildPhase::Build {
            self.percent = self.percent.max(f64::from(self.config.install_ceiling));
        }
    }

    fn observe(&mut self, line: &str) -> u8 {
        let mut recognized = false;
        for marker in &self.config.markers {
            if line.contains(&marker.needle) {
                self.percent = self.percent.max(f64::from(marker.percent));
                recognized = true;
            }
        }

        // Keep the install indicator moving even when nothing matches, so a
        // long dependency install does not look stalled.
        if !recognized && self.phase == BuildPhase::Install {
            self.percent = (self.percent + self.config.install_nudge)
                .min(f64::from(self.config.install_ceiling));
        }

        self.percent.round().clamp(0.0, 100.0) as u8
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub struct BuildRunner {
    workdir: PathBuf,
    config: BuildConfig,
    gate: SingleFlight,
    on_start: Option<StartCallback>,
    on_progress: Option<ProgressCallback>,
    on_complete: Option<CompleteCallback>,
}

impl BuildRunner {
    pub fn new(workdir: PathBuf, config: BuildConfig) -> Self {
        Self {
            workdir,
            config,
            gate: SingleFlight::new("build"),
            on_start: None,
            on_progress: None,
            on_complete: None,
        }
    }

    pub fn with_on_start(mut self, callback: StartCallback) -> Self {
        self.on_start = Some(callback);
        self
    }

    pub fn with_on_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn with_on_complete(mut self, callback: CompleteCallback) -> Self {
        self.on_complete = Some(callback);
        self
    }

    /// Run the two-phase pipeline.
    ///
    /// Fails fast with "already in progress" when another run holds the
    /// gate; that rejection is returned to the caller only and does not
    /// reach the completion callback.
    #[instrument(skip(self), fields(workdir = %self.workdir.display()))]
    pub async fn run(&self) -> Result<BuildOutcome> {
        let Some(_guard) = self.gate.try_begin() else {
            bail!("build already in progress");
        };

        if let Some(on_start) = &self.on_start {
            on_start();
        }
        info!("build pipeline started");

        let result = self.run_pipeline().await;
        match &result {
            Ok(outcome) => info!(exit_code = outcome.exit_code, "build pipeline succeeded"),
            Err(err) => debug!(error = %err, "build pipeline failed"),
        }

        if let Some(on_complete) = &self.on_complete {
            on_complete(&result);
        }
        result
    }

    async fn run_pipeline(&self) -> Result<BuildOutcome> {
        self.ensure_registry_config().await?;

        let mut estimator = ProgressEstimator::new(&self.config.progress);

        let install = self
            .run_phase(&self.config.install_command, BuildPhase::Install, &mut estimator)
            .await?;
        if install.exit_code != 0 {
            bail!(
                "install phase failed (exit {}): {}",
                install.exit_code,
                output_tail(&install.stderr, self.config.output_tail_bytes)
            );
        }

        let build = self
            .run_phase(&self.config.build_command, BuildPhase::Build, &mut estimator)
            .await?;
        if build.exit_code != 0 {
            bail!(
                "build phase failed (exit {}): {}",
                build.exit_code,
                output_tail(&build.stderr, self.config.output_tail_bytes)
            );
        }

        Ok(BuildOutcome {
            exit_code: build.exit_code,
            stdout: build.stdout,
            stderr: build.stderr,
            success: true,
        })
    }

    /// Create the package-registry config file once, idempotently.
    async fn ensure_registry_config(&self) -> Result<()> {
        let path = self.workdir.join(&self.config.registry_file);
        if tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("failed to probe {}", path.display()))?
        {
            return Ok(());
        }
        tokio::fs::write(&path, &self.config.registry_contents)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "created package-registry configuration");
        Ok(())
    }

    async fn run_phase(
        &self,
        cmdline: &[String],
        phase: BuildPhase,
        estimator: &mut ProgressEstimator<'_>,
    ) -> Result<PhaseOutput> {
        estimator.enter(phase);
        debug!(%phase, command = ?cmdline, "running build phase");

        let (program, args) = cmdline
            .split_first()
            .with_context(|| format!("empty {phase} command"))?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {phase} command"))?;

        let stdout = child
            .stdout
            .take()
            .with_context(|| format!("failed to capture {phase} stdout"))?;
        let stderr = child
            .stderr
            .take()
            .with_context(|| format!("failed to capture {phase} stderr"))?;

        let (tx, mut rx) = tokio::sync::mpsc::channel::<(BuildStream, String)>(64);
        tokio::spawn(forward_lines(stdout, BuildStream::Stdout, tx.clone()));
        tokio::spawn(forward_lines(stderr, BuildStream::Stderr, tx));

        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();
        while let Some((stream, line)) = rx.recv().await {
            let percent = estimator.observe(&line);
            if let Some(on_progress) = &self.on_progress {
                on_progress(&line, stream, percent);
            }
            let buf = match stream {
                BuildStream::Stdout => &mut stdout_buf,
                BuildStream::Stderr => &mut stderr_buf,
            };
            buf.push_str(&line);
            buf.push('\n');
        }

        let status = child
            .wait()
            .await
            .with_context(|| format!("failed to wait for {phase} command"))?;

        Ok(PhaseOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: stdout_buf,
            stderr: stderr_buf,
        })
    }
}

struct PhaseOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

async fn forward_lines(
    reader: impl AsyncRead + Unpin,
    stream: BuildStream,
    tx: tokio::sync::mpsc::Sender<(BuildStream, String)>,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send((stream, line)).await.is_err() {
            break;
        }
    }
}

/// Last `max_bytes` of `output`, aligned to a character boundary.
fn output_tail(output: &str, max_bytes: usize) -> &str {
    if output.len() <= max_bytes {
        return output;
    }
    let mut start = output.len() - max_bytes;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    &output[start..]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProgressMarker;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn config(install: &str, build: &str) -> BuildConfig {
        BuildConfig {
            install_command: sh(install),
            build_command: sh(build),
            ..BuildConfig::default()
        }
    }

    #[test]
    fn estimator_nudges_during_install_up_to_ceiling() {
        let progress = ProgressConfig {
            install_ceiling: 10,
            install_nudge: 4.0,
            markers: vec![],
        };
        let mut estimator = ProgressEstimator::new(&progress);
        assert_eq!(estimator.observe("fetching deps"), 4);
        assert_eq!(estimator.observe("fetching more"), 8);
        assert_eq!(estimator.observe("still going"), 10);
        assert_eq!(estimator.observe("capped"), 10);
    }

    #[test]
    fn estimator_markers_ratchet_monotonically() {
        let progress = ProgressConfig {
            install_ceiling: 10,
            install_nudge: 0.5,
            markers: vec![
                ProgressMarker {
                    needle: "transforming".to_string(),
                    percent: 40,
                },
                ProgressMarker {
                    needle: "built in".to_string(),
                    percent: 95,
                },
            ],
        };
        let mut estimator = ProgressEstimator::new(&progress);
        estimator.enter(BuildPhase::Build);
        assert_eq!(estimator.observe("noise"), 10);
        assert_eq!(estimator.observe("transforming modules..."), 40);
        // Unrecognized build output holds steady.
        assert_eq!(estimator.observe("noise"), 40);
        assert_eq!(estimator.observe("built in 1.2s"), 95);
        // A late early-phase marker cannot move progress backwards.
        assert_eq!(estimator.observe("transforming again"), 95);
    }

    #[test]
    fn output_tail_truncates_long_output() {
        assert_eq!(output_tail("abcdef", 4), "cdef");
        assert_eq!(output_tail("abc", 8), "abc");
    }

    #[tokio::test]
    async fn successful_pipeline_reports_outcome() {
        let tmp = tempdir().unwrap();
        let runner = BuildRunner::new(
            tmp.path().to_path_buf(),
            config("echo installing", "echo built in 1.2s"),
        );

        let outcome = runner.run().await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.stdout.contains("built in 1.2s"));
    }

    #[tokio::test]
    async fn creates_registry_config_idempotently() {
        let tmp = tempdir().unwrap();
        let runner = BuildRunner::new(tmp.path().to_path_buf(), config("true", "true"));

        runner.run().await.unwrap();
        let npmrc = tmp.path().join(".npmrc");
        assert!(npmrc.exists());

        // Pre-existing contents survive the second run.
        std::fs::write(&npmrc, "registry=https://example.com/\n").unwrap();
        runner.run().await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&npmrc).unwrap(),
            "registry=https://example.com/\n"
        );
    }

    #[tokio::test]
    async fn install_failure_is_terminal_with_tail() {
        let tmp = tempdir().unwrap();
        let runner = BuildRunner::new(
            tmp.path().to_path_buf(),
            config("echo boom >&2; exit 3", "echo never-runs"),
        );

        let err = runner.run().await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("install phase failed (exit 3)"), "{message}");
        assert!(message.contains("boom"), "{message}");
    }

    #[tokio::test]
    async fn build_failure_is_terminal() {
        let tmp = tempdir().unwrap();
        let runner = BuildRunner::new(
            tmp.path().to_path_buf(),
            config("true", "echo broken >&2; exit 2"),
        );

        let err = runner.run().await.unwrap_err();
        assert!(err.to_string().contains("build phase failed (exit 2)"));
    }

    #[tokio::test]
    async fn concurrent_build_is_rejected() {
        let tmp = tempdir().unwrap();
        let runner = Arc::new(BuildRunner::new(
            tmp.path().to_path_buf(),
            config("sleep 0.5", "true"),
        ));

        let first = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.run().await })
        };
        // Give the first run time to take the gate.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let second = runner.run().await;
        let err = second.unwrap_err();
        assert_eq!(err.to_string(), "build already in progress");

        let first = first.await.unwrap();
        assert!(first.is_ok(), "first build should have completed");
    }

    #[tokio::test]
    async fn callbacks_fire_in_order() {
        let tmp = tempdir().unwrap();
        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let runner = BuildRunner::new(
            tmp.path().to_path_buf(),
            config("echo install-line", "echo built in 0.1s"),
        )
        .with_on_start({
            let events = Arc::clone(&events);
            Arc::new(move || events.lock().unwrap().push("start".to_string()))
        })
        .with_on_progress({
            let events = Arc::clone(&events);
            Arc::new(move |line, stream, percent| {
                events
                    .lock()
                    .unwrap()
                    .push(format!("progress:{stream}:{percent}:{line}"))
            })
        })
        .with_on_complete({
            let events = Arc::clone(&events);
            Arc::new(move |result| {
                events
                    .lock()
                    .unwrap()
                    .push(format!("complete:{}", result.is_ok()))
            })
        });

        runner.run().await.unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.first().map(String::as_str), Some("start"));
        assert_eq!(events.last().map(String::as_str), Some("complete:true"));
        assert!(events.iter().any(|e| e.contains("install-line")));
        // The "built in" marker drives the estimate to 95.
        assert!(
            events.iter().any(|e| e.starts_with("progress:stdout:95:")),
            "events: {events:?}"
        );
    }
}
