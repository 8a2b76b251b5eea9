pub mod hops;

use anyhow::{Context, Result};
use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use hops::{SENTINEL, rank};

const SCHEMA: &str = include_str!("schema.sql");

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub id: i64,
    pub hash: String,
    pub height: i64,
    pub ancestor: i64,
}

impl CommitRecord {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            hash: row.get(1)?,
            height: row.get(2)?,
            ancestor: row.get(3)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RepoRecord {
    pub id: i64,
    pub name: String,
    pub last_accessed_at: i64,
    pub commits: i64,
    pub symbols: i64,
}

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("Failed to enable WAL mode")?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(mode = %mode, "Database did not switch to WAL mode");
        }
        Self::init(conn)
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        register_regexp(&conn).context("Failed to register regexp function")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize database schema")?;
        Ok(Self { conn })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    // ── Transaction control ──

    pub fn begin_transaction(&self) -> Result<()> {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .context("Failed to begin transaction")?;
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.conn
            .execute_batch("COMMIT")
            .context("Failed to commit transaction")?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        if !self.conn.is_autocommit() {
            self.conn
                .execute_batch("ROLLBACK")
                .context("Failed to roll back transaction")?;
        }
        Ok(())
    }

    // ── Repository operations ──

    /// Returns the repository id, creating the record on first use, and
    /// refreshes its access time.
    pub fn ensure_repo(&self, name: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT OR IGNORE INTO repositories (name) VALUES (?1)",
            params![name],
        )?;
        let id = self.conn.query_row(
            "SELECT id FROM repositories WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        self.touch_repo(id)?;
        Ok(id)
    }

    pub fn find_repo(&self, name: &str) -> Result<Option<i64>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM repositories WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Access times are strictly increasing across all repositories, so the
    /// eviction order is total even when touches land in the same millisecond.
    pub fn touch_repo(&self, repo_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE repositories
             SET last_accessed_at = MAX(?2, (SELECT COALESCE(MAX(last_accessed_at), 0) + 1 FROM repositories))
             WHERE id = ?1",
            params![repo_id, now_millis()],
        )?;
        Ok(())
    }

    pub fn list_repos(&self) -> Result<Vec<RepoRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.id, r.name, r.last_accessed_at,
                    (SELECT COUNT(*) FROM commits c WHERE c.repo_id = r.id),
                    (SELECT COUNT(*) FROM symbols s WHERE s.repo_id = r.id)
             FROM repositories r
             ORDER BY r.last_accessed_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RepoRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                last_accessed_at: row.get(2)?,
                commits: row.get(3)?,
                symbols: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn repo_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM repositories", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Repositories beyond the `keep` most recently accessed, oldest first.
    pub fn eviction_candidates(&self, keep: usize) -> Result<Vec<(i64, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name FROM (
                 SELECT id, name, last_accessed_at FROM repositories
                 ORDER BY last_accessed_at DESC
                 LIMIT -1 OFFSET ?1
             )
             ORDER BY last_accessed_at ASC",
        )?;
        let rows = stmt.query_map(params![keep as i64], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Deletes the repository with its commits and symbols. Returns false if
    /// it did not exist.
    pub fn delete_repo(&self, name: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM repositories WHERE name = ?1", params![name])
            .with_context(|| format!("Failed to delete repository {name}"))?;
        Ok(deleted > 0)
    }

    // ── Commit operations ──

    pub fn get_commit(&self, repo_id: i64, hash: &str) -> Result<Option<CommitRecord>> {
        let commit = self
            .conn
            .query_row(
                "SELECT id, hash, height, ancestor FROM commits WHERE repo_id = ?1 AND hash = ?2",
                params![repo_id, hash],
                CommitRecord::from_row,
            )
            .optional()?;
        Ok(commit)
    }

    pub fn insert_commit(
        &self,
        repo_id: i64,
        hash: &str,
        height: i64,
        ancestor: i64,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO commits (repo_id, hash, height, ancestor) VALUES (?1, ?2, ?3, ?4)",
                params![repo_id, hash, height, ancestor],
            )
            .with_context(|| format!("Failed to insert commit {hash}"))?;
        Ok(self.conn.last_insert_rowid())
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Registers `regexp(pattern, text)`, which SQLite calls for `text REGEXP pattern`.
/// Compiled patterns are cached per statement.
fn register_regexp(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let regex: Arc<Regex> = ctx.get_or_create_aux(0, |pattern| -> Result<_, Box<dyn std::error::Error + Send + Sync>> {
                Ok(Regex::new(pattern.as_str()?)?)
            })?;
            let text = ctx
                .get_raw(1)
                .as_str()
                .map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
            Ok(regex.is_match(text))
        },
    )
}
