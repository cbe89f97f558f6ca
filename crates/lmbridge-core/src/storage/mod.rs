use rusqlite::{Connection, Result};
use std::path::Path;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

/// One row per caller-facing chat request, written after the cascade settles.
#[derive(Debug, Clone)]
pub struct RequestLog {
    pub request_path: String,
    pub method: String,
    pub model: Option<String>,
    pub strategy: Option<String>,
    pub status_code: Option<i64>,
    pub error: Option<String>,
    pub created_at: i64,
}

#[derive(Debug)]
pub struct Storage {
    conn: Connection,
}

impl Storage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        // 中文注释：并发写入时给 SQLite 一点等待时间，避免瞬时 lock 导致请求直接失败。
        conn.busy_timeout(Duration::from_millis(3000))?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.busy_timeout(Duration::from_millis(3000))?;
        Ok(Self { conn })
    }

    pub fn init(&self) -> Result<()> {
        self.ensure_migrations_table()?;
        self.apply_sql_migration(
            "001_request_logs",
            include_str!("../../migrations/001_request_logs.sql"),
        )?;
        Ok(())
    }

    fn ensure_migrations_table(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                name TEXT PRIMARY KEY,
                applied_at INTEGER NOT NULL
            );",
        )
    }

    fn apply_sql_migration(&self, name: &str, sql: &str) -> Result<()> {
        let already: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE name = ?1",
            [name],
            |row| row.get(0),
        )?;
        if already > 0 {
            return Ok(());
        }
        self.conn.execute_batch(sql)?;
        self.conn.execute(
            "INSERT INTO schema_migrations (name, applied_at) VALUES (?1, ?2)",
            rusqlite::params![name, now_ts()],
        )?;
        Ok(())
    }

    pub fn insert_request_log(&self, record: &RequestLog) -> Result<()> {
        self.conn.execute(
            "INSERT INTO request_logs
                (request_path, method, model, strategy, status_code, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.request_path,
                record.method,
                record.model,
                record.strategy,
                record.status_code,
                record.error,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn list_request_logs(&self, limit: usize) -> Result<Vec<RequestLog>> {
        let mut stmt = self.conn.prepare(
            "SELECT request_path, method, model, strategy, status_code, error, created_at
             FROM request_logs ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(RequestLog {
                request_path: row.get(0)?,
                method: row.get(1)?,
                model: row.get(2)?,
                strategy: row.get(3)?,
                status_code: row.get(4)?,
                error: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;
        rows.collect()
    }

    pub fn clear_request_logs(&self) -> Result<usize> {
        self.conn.execute("DELETE FROM request_logs", [])
    }
}

pub fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|v| v.as_secs() as i64)
        .unwrap_or(0)
}
