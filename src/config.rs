use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub repos: RepoConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub build: BuildConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RepoConfig {
    /// Directory that holds the bare repository (created if missing).
    pub root: String,
    /// Path to the editable working tree (must contain its own `.git`).
    pub workdir: String,
    /// Name the bare repository is served under; the on-disk directory is
    /// `<root>/<bare_name>.git`.
    #[serde(default = "default_bare_name")]
    pub bare_name: String,
    /// Branch the auto-commit engine falls back to when HEAD is detached.
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

impl RepoConfig {
    /// On-disk path of the bare repository.
    pub fn bare_path(&self) -> PathBuf {
        Path::new(&self.root).join(format!("{}.git", self.bare_name))
    }

    pub fn workdir_path(&self) -> PathBuf {
        PathBuf::from(&self.workdir)
    }
}

fn default_bare_name() -> String {
    "bare".to_string()
}

fn default_branch() -> String {
    "master".to_string()
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Name of the environment variable that holds the token signing secret.
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
    /// Capability a token's claims must carry for any git or build access.
    #[serde(default = "default_required_capability")]
    pub required_capability: String,
    /// Alternate header consulted when `Authorization` is absent.
    #[serde(default = "default_alt_header")]
    pub alt_header: String,
    /// SQLite file backing the revocation/refresh-token store.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_env: default_secret_env(),
            required_capability: default_required_capability(),
            alt_header: default_alt_header(),
            db_path: default_db_path(),
        }
    }
}

fn default_secret_env() -> String {
    "FORGEBENCH_AUTH_SECRET".to_string()
}

fn default_required_capability() -> String {
    "manage_workdir".to_string()
}

fn default_alt_header() -> String {
    "authorization-x".to_string()
}

fn default_db_path() -> String {
    "/var/lib/forgebench/auth.db".to_string()
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Delay before the deferred stash restore runs, letting the forced
    /// checkout settle.
    #[serde(default = "default_restore_delay_ms")]
    pub restore_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            restore_delay_ms: default_restore_delay_ms(),
        }
    }
}

fn default_restore_delay_ms() -> u64 {
    1000
}

// ---------------------------------------------------------------------------
// Build pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    /// Dependency-install command, argv form.
    #[serde(default = "default_install_command")]
    pub install_command: Vec<String>,
    /// Build command, argv form.
    #[serde(default = "default_build_command")]
    pub build_command: Vec<String>,
    /// Package-registry config file created in the workdir when absent.
    #[serde(default = "default_registry_file")]
    pub registry_file: String,
    #[serde(default = "default_registry_contents")]
    pub registry_contents: String,
    /// How many trailing bytes of output a failure report carries.
    #[serde(default = "default_output_tail_bytes")]
    pub output_tail_bytes: usize,
    #[serde(default)]
    pub progress: ProgressConfig,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            install_command: default_install_command(),
            build_command: default_build_command(),
            registry_file: default_registry_file(),
            registry_contents: default_registry_contents(),
            output_tail_bytes: default_output_tail_bytes(),
            progress: ProgressConfig::default(),
        }
    }
}

fn default_install_command() -> Vec<String> {
    vec!["npm".to_string(), "install".to_string()]
}

fn default_build_command() -> Vec<String> {
    vec!["npm".to_string(), "run".to_string(), "build".to_string()]
}

fn default_registry_file() -> String {
    ".npmrc".to_string()
}

fn default_registry_contents() -> String {
    "registry=https://registry.npmjs.org/\n".to_string()
}

fn default_output_tail_bytes() -> usize {
    2048
}

/// Marker table and phase weighting for the output-derived progress
/// percentage.  The estimate is inherently best-effort; keeping the table in
/// configuration makes the heuristics tunable per project.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressConfig {
    /// Upper bound of the install phase's progress range.
    #[serde(default = "default_install_ceiling")]
    pub install_ceiling: u8,
    /// Increment applied per unrecognized install-phase output line.
    #[serde(default = "default_install_nudge")]
    pub install_nudge: f64,
    /// Substring markers that ratchet progress to a fixed percentage.
    #[serde(default = "default_markers")]
    pub markers: Vec<ProgressMarker>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            install_ceiling: default_install_ceiling(),
            install_nudge: default_install_nudge(),
            markers: default_markers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressMarker {
    pub needle: String,
    pub percent: u8,
}

fn default_install_ceiling() -> u8 {
    10
}

fn default_install_nudge() -> f64 {
    0.5
}

fn default_markers() -> Vec<ProgressMarker> {
    [
        ("vite v", 15),
        ("transforming", 40),
        ("rendering chunks", 70),
        ("computing gzip size", 85),
        ("built in", 95),
    ]
    .into_iter()
    .map(|(needle, percent)| ProgressMarker {
        needle: needle.to_string(),
        percent,
    })
    .collect()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.repos.bare_name.is_empty() && !config.repos.bare_name.contains('/'),
        "repos.bare_name must be a bare directory name"
    );
    anyhow::ensure!(
        !config.repos.default_branch.is_empty(),
        "repos.default_branch must not be empty"
    );
    anyhow::ensure!(
        !config.build.install_command.is_empty() && !config.build.build_command.is_empty(),
        "build commands must not be empty"
    );
    anyhow::ensure!(
        config.build.progress.install_ceiling <= 100,
        "progress.install_ceiling must be 0-100"
    );
    anyhow::ensure!(
        config.build.progress.install_nudge > 0.0,
        "progress.install_nudge must be positive"
    );
    anyhow::ensure!(
        config
            .build
            .progress
            .markers
            .iter()
            .all(|m| m.percent <= 100 && !m.needle.is_empty()),
        "progress.markers entries must have a needle and a percent of at most 100"
    );
    Ok(())
}
