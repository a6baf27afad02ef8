//! Health-check persistence -- the store trait, SQLite implementation, and
//! an in-memory variant.
//!
//! Saving a check never removes logs that are already stored: each log is
//! upserted by its own id. Two concurrent runs of the same check therefore
//! both keep their log, whichever finishes last.

pub mod memory;
pub mod schema;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::model::{ExecutionLog, HealthCheck};

pub use self::memory::MemoryStore;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Durable record of check definitions and their execution history.
#[async_trait]
pub trait HealthCheckStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<HealthCheck>>;

    /// Persist `check`, assigning an id if it has none, and return the
    /// stored document as it reads back after the write.
    ///
    /// A check that carries an id but is no longer stored is not recreated;
    /// the result is `None`.
    async fn save(&self, check: &HealthCheck) -> Result<Option<HealthCheck>>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn exists(&self, id: &str) -> Result<bool>;

    async fn list_all(&self) -> Result<Vec<HealthCheck>>;
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory {}", parent.display()))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// SQLite-backed [`HealthCheckStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn open(path: &str) -> Result<Self> {
        Ok(Self::new(open_pool(path)?))
    }
}

#[async_trait]
impl HealthCheckStore for SqliteStore {
    async fn load(&self, id: &str) -> Result<Option<HealthCheck>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<HealthCheck>> {
            let conn = pool.get()?;
            load_check(&conn, &id)
        })
        .await?
    }

    async fn save(&self, check: &HealthCheck) -> Result<Option<HealthCheck>> {
        let pool = self.pool.clone();
        let check = check.clone();
        tokio::task::spawn_blocking(move || save_check(&pool, &check)).await?
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let pool = self.pool.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool.get()?;
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM execution_logs WHERE check_id = ?1", params![id])?;
            tx.execute("DELETE FROM health_checks WHERE id = ?1", params![id])?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let pool = self.pool.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool> {
            let conn = pool.get()?;
            check_exists(&conn, &id)
        })
        .await?
    }

    async fn list_all(&self) -> Result<Vec<HealthCheck>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<HealthCheck>> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare("SELECT id FROM health_checks ORDER BY created_at, rowid")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut checks = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(check) = load_check(&conn, &id)? {
                    checks.push(check);
                }
            }
            Ok(checks)
        })
        .await?
    }
}

fn save_check(pool: &Pool, check: &HealthCheck) -> Result<Option<HealthCheck>> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;

    let id = match &check.id {
        // Definitions are immutable once stored, and a deleted check stays deleted.
        Some(id) => {
            if !check_exists(&tx, id)? {
                return Ok(None);
            }
            id.clone()
        }
        None => {
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO health_checks (id, name, owner, command) VALUES (?1, ?2, ?3, ?4)",
                params![id, check.name, check.owner, check.command],
            )
            .context("Failed to insert health check")?;
            id
        }
    };

    for log in &check.execution_logs {
        tx.execute(
            "INSERT INTO execution_logs
                (id, check_id, seq, start_time, end_time, status, output, triggered_by)
             VALUES (?1, ?2,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM execution_logs WHERE check_id = ?2),
                ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                end_time = excluded.end_time,
                status = excluded.status,
                output = excluded.output
             WHERE execution_logs.end_time IS NULL",
            params![
                log.id.to_string(),
                id,
                log.start_time.to_rfc3339(),
                log.end_time.map(|t| t.to_rfc3339()),
                log.status.as_str(),
                log.output,
                log.triggered_by,
            ],
        )
        .context("Failed to upsert execution log")?;
    }

    tx.commit()?;

    let saved = load_check(&conn, &id)?
        .with_context(|| format!("health check {} vanished after save", id))?;
    Ok(Some(saved))
}

fn check_exists(conn: &Connection, id: &str) -> Result<bool> {
    let found: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM health_checks WHERE id = ?1)",
        params![id],
        |row| row.get(0),
    )?;
    Ok(found)
}

fn load_check(conn: &Connection, id: &str) -> Result<Option<HealthCheck>> {
    let row = conn
        .query_row(
            "SELECT name, owner, command FROM health_checks WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;

    let Some((name, owner, command)) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT id, start_time, end_time, status, output, triggered_by
         FROM execution_logs WHERE check_id = ?1 ORDER BY seq",
    )?;
    let rows = stmt
        .query_map(params![id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut execution_logs = Vec::with_capacity(rows.len());
    for (log_id, start, end, status, output, triggered_by) in rows {
        execution_logs.push(ExecutionLog {
            id: Uuid::parse_str(&log_id)
                .with_context(|| format!("bad execution log id '{}'", log_id))?,
            start_time: parse_time(&start)?,
            end_time: end.as_deref().map(parse_time).transpose()?,
            status: status.parse()?,
            output,
            triggered_by,
        });
    }

    Ok(Some(HealthCheck {
        id: Some(id.to_string()),
        name,
        owner,
        command,
        execution_logs,
    }))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp '{}'", s))?
        .with_timezone(&Utc))
}
