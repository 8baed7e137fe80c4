//! Revocation and refresh-token persistence.
//!
//! A small SQLite store keyed by SHA-256 token hashes.  Rows are written by
//! an external identity service; this server only checks membership and
//! opportunistically prunes expired rows whenever a revoked token is seen.
//! The connection is synchronous, so async callers go through
//! `spawn_blocking`.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS revoked_tokens (
    token_hash TEXT PRIMARY KEY,
    expires_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS refresh_tokens (
    token_hash TEXT PRIMARY KEY,
    expires_at INTEGER NOT NULL
);
";

pub struct TokenStore {
    conn: Mutex<Connection>,
}

impl TokenStore {
    /// Open (creating if necessary) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create token store directory: {}", parent.display())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open token store: {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to initialise token store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("token store mutex poisoned"))
    }

    /// Whether a token hash appears in the revocation set.
    pub fn is_revoked(&self, token_hash: &str) -> Result<bool> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare_cached("SELECT 1 FROM revoked_tokens WHERE token_hash = ?1")?;
        let found = stmt.exists(params![token_hash])?;
        Ok(found)
    }

    /// Record a revoked token.
    pub fn revoke(&self, token_hash: &str, expires_at: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO revoked_tokens (token_hash, expires_at) VALUES (?1, ?2)",
            params![token_hash, expires_at],
        )?;
        Ok(())
    }

    /// Record a refresh token.
    pub fn record_refresh(&self, token_hash: &str, expires_at: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO refresh_tokens (token_hash, expires_at) VALUES (?1, ?2)",
            params![token_hash, expires_at],
        )?;
        Ok(())
    }

    /// Delete expired rows from both tables; returns how many went away.
    pub fn purge_expired(&self, now: i64) -> Result<usize> {
        let conn = self.conn()?;
        let revoked = conn.execute(
            "DELETE FROM revoked_tokens WHERE expires_at < ?1",
            params![now],
        )?;
        let refresh = conn.execute(
            "DELETE FROM refresh_tokens WHERE expires_at < ?1",
            params![now],
        )?;
        Ok(revoked + refresh)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
