//! 带 TTL 的键值存储抽象
//!
//! SessionStore 只依赖这里的少量原语（带过期写入、读取、续期、删除、前缀枚举），
//! 默认使用进程内实现；开启 `async-sqlite` 特性后可换成 SQLite 持久化实现。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(String),
}

/// TTL 键值存储接口（单键操作原子）
#[async_trait]
pub trait KvStore: Send + Sync {
    /// 后端名称（用于统计与日志）
    fn backend_name(&self) -> &'static str;

    /// 写入并设置过期时间（覆盖已有值）
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;

    /// 读取；已过期视为不存在
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// 重设过期时间；键不存在时返回 false
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;

    /// 剩余存活时间
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError>;

    /// 删除若干键，返回实际删除数量
    async fn delete(&self, keys: &[&str]) -> Result<usize, KvError>;

    /// 枚举指定前缀下的未过期键
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError>;

    /// 物理删除已过期键
    async fn purge_expired(&self) -> Result<usize, KvError>;
}

/// 超长 TTL 截断到约 100 年，避免 `Instant` 加法溢出
const MAX_ENTRY_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

fn deadline(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl.min(MAX_ENTRY_TTL)).unwrap_or(now)
}

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// 进程内 TTL 存储
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: deadline(Instant::now(), ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = deadline(now, ttl);
                Ok(true)
            }
            Some(_) => {
                entries.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.expires_at.saturating_duration_since(now)))
    }

    async fn delete(&self, keys: &[&str]) -> Result<usize, KvError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = entries.remove(*key) {
                if entry.is_live(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn purge_expired(&self) -> Result<usize, KvError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_memory_kv_expiry() {
        let kv = MemoryKvStore::new();
        kv.set_ex("a", "1", Duration::from_secs(10)).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap().as_deref(), Some("1"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(kv.get("a").await.unwrap(), None);
        assert!(!kv.expire("a", Duration::from_secs(10)).await.unwrap());
        assert!(kv.keys_with_prefix("").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_kv_expire_extends_lifetime() {
        let kv = MemoryKvStore::new();
        kv.set_ex("a", "1", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(kv.expire("a", Duration::from_secs(10)).await.unwrap());
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(kv.get("a").await.unwrap().is_some());
        let ttl = kv.ttl("a").await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_memory_kv_huge_ttl_is_clamped() {
        let kv = MemoryKvStore::new();
        kv.set_ex("a", "1", Duration::MAX).await.unwrap();
        assert!(kv.expire("a", Duration::from_secs(u64::MAX)).await.unwrap());
        let ttl = kv.ttl("a").await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(365 * 24 * 3600));
        assert!(ttl <= MAX_ENTRY_TTL);
    }

    #[tokio::test]
    async fn test_memory_kv_prefix_and_delete() {
        let kv = MemoryKvStore::new();
        let ttl = Duration::from_secs(60);
        kv.set_ex("p:1", "x", ttl).await.unwrap();
        kv.set_ex("p:2", "y", ttl).await.unwrap();
        kv.set_ex("q:1", "z", ttl).await.unwrap();

        assert_eq!(kv.keys_with_prefix("p:").await.unwrap(), vec!["p:1", "p:2"]);
        assert_eq!(kv.delete(&["p:1", "p:9"]).await.unwrap(), 1);
        assert_eq!(kv.keys_with_prefix("p:").await.unwrap(), vec!["p:2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_kv_purge_expired() {
        let kv = MemoryKvStore::new();
        kv.set_ex("short", "1", Duration::from_secs(1)).await.unwrap();
        kv.set_ex("long", "2", Duration::from_secs(100)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(kv.purge_expired().await.unwrap(), 1);
        assert!(kv.get("long").await.unwrap().is_some());
    }
}
