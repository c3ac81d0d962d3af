//! SQLite TTL 存储
//!
//! 会话记录在进程重启后仍可被引用句柄找回（直到 TTL 到期）。
//! 过期时间以 Unix 毫秒保存，读路径按当前时间过滤。

#![cfg(feature = "async-sqlite")]

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;

use super::kv::{KvError, KvStore};

impl From<sqlx::Error> for KvError {
    fn from(e: sqlx::Error) -> Self {
        KvError::Backend(e.to_string())
    }
}

pub struct SqliteKvStore {
    pool: sqlx::sqlite::SqlitePool,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn deadline(ttl: Duration) -> i64 {
    now_millis().saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64)
}

impl SqliteKvStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, KvError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_kv_entries_expiry ON kv_entries(expires_at)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        sqlx::query(
            "INSERT INTO kv_entries (key, value, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(deadline(ttl))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let row = sqlx::query("SELECT value FROM kv_entries WHERE key = ? AND expires_at > ?")
            .bind(key)
            .bind(now_millis())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let result =
            sqlx::query("UPDATE kv_entries SET expires_at = ? WHERE key = ? AND expires_at > ?")
                .bind(deadline(ttl))
                .bind(key)
                .bind(now_millis())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let now = now_millis();
        let row = sqlx::query("SELECT expires_at FROM kv_entries WHERE key = ? AND expires_at > ?")
            .bind(key)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| {
            let expires_at: i64 = r.get("expires_at");
            Duration::from_millis((expires_at - now).max(0) as u64)
        }))
    }

    async fn delete(&self, keys: &[&str]) -> Result<usize, KvError> {
        let now = now_millis();
        let mut removed = 0;
        for key in keys {
            let result = sqlx::query("DELETE FROM kv_entries WHERE key = ? AND expires_at > ?")
                .bind(*key)
                .bind(now)
                .execute(&self.pool)
                .await?;
            removed += result.rows_affected() as usize;
        }
        Ok(removed)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        // LIKE 的通配符需要转义，前缀里可能出现 '_'
        let pattern = format!(
            "{}%",
            prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
        );
        let rows = sqlx::query(
            "SELECT key FROM kv_entries WHERE key LIKE ? ESCAPE '\\' AND expires_at > ? ORDER BY key",
        )
        .bind(pattern)
        .bind(now_millis())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("key")).collect())
    }

    async fn purge_expired(&self) -> Result<usize, KvError> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE expires_at <= ?")
            .bind(now_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}
