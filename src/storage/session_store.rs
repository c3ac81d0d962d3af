//! 加密会话存储
//!
//! 两类键：
//! - `dbagent:session:<id>` → 加密后的会话记录
//! - `dbagent:ref:<handle>` → 会话键（调用方只持有 handle）
//!
//! 两个键使用同一 TTL，每次按引用读取都会同时续期。引用键存在但记录已消失
//! （孤立引用）时按“不存在”处理；记录解密失败是完整性错误，与“不存在”区分。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

use super::codec::{CodecError, EncryptionCodec};
use super::kv::{KvError, KvStore};
use super::record::{SessionRecord, SessionSummary, StoredRecord};
use crate::core::ErrorKind;

pub const SESSION_PREFIX: &str = "dbagent:session:";
pub const REFERENCE_PREFIX: &str = "dbagent:ref:";
/// 单个会话允许的最长 TTL（30 天）
pub const MAX_SESSION_TTL_SECS: u64 = 30 * 24 * 3600;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Backend(#[from] KvError),

    #[error("session record for {reference} failed integrity check: {source}")]
    Integrity {
        reference: String,
        #[source]
        source: CodecError,
    },

    #[error("failed to encode session record: {0}")]
    Encode(#[source] CodecError),

    #[error("session {0} expired or was deleted")]
    Expired(String),

    #[error("session capacity reached ({0} active sessions)")]
    Capacity(usize),

    #[error("invalid session ttl: {0}")]
    InvalidTtl(u64),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Integrity { .. } => ErrorKind::Integrity,
            StoreError::Expired(_) => ErrorKind::NotFound,
            StoreError::Capacity(_) | StoreError::InvalidTtl(_) => ErrorKind::UserInput,
            StoreError::Backend(_) | StoreError::Encode(_) => ErrorKind::Internal,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionStoreSettings {
    pub default_ttl_secs: u64,
    pub max_sessions: usize,
}

impl Default for SessionStoreSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3600,
            max_sessions: 100,
        }
    }
}

/// 列表结果：可解密的摘要 + 损坏记录数
#[derive(Clone, Debug, Default, Serialize)]
pub struct SessionListing {
    pub sessions: Vec<SessionSummary>,
    pub corrupted: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct StoreStats {
    pub backend: &'static str,
    pub total_sessions: usize,
    pub total_references: usize,
    pub max_sessions: usize,
    pub default_ttl_secs: u64,
}

pub struct SessionStore {
    kv: Arc<dyn KvStore>,
    codec: Arc<EncryptionCodec>,
    settings: SessionStoreSettings,
}

fn reference_key(reference: &str) -> String {
    format!("{REFERENCE_PREFIX}{reference}")
}

impl SessionStore {
    pub fn new(
        kv: Arc<dyn KvStore>,
        codec: Arc<EncryptionCodec>,
        settings: SessionStoreSettings,
    ) -> Self {
        Self { kv, codec, settings }
    }

    pub fn settings(&self) -> &SessionStoreSettings {
        &self.settings
    }

    /// 创建会话，返回新的记录（含引用句柄）
    pub async fn create_session(&self, ttl_secs: Option<u64>) -> Result<SessionRecord, StoreError> {
        let ttl_secs = ttl_secs.unwrap_or(self.settings.default_ttl_secs);
        if ttl_secs == 0 || ttl_secs > MAX_SESSION_TTL_SECS {
            return Err(StoreError::InvalidTtl(ttl_secs));
        }

        let active = self.kv.keys_with_prefix(SESSION_PREFIX).await?.len();
        if active >= self.settings.max_sessions {
            tracing::warn!(active, max = self.settings.max_sessions, "Session capacity reached");
            return Err(StoreError::Capacity(active));
        }

        let session_key = format!("{SESSION_PREFIX}{}", uuid::Uuid::new_v4().simple());
        let reference = format!("ref_{}", uuid::Uuid::new_v4().simple());
        let mut record = SessionRecord::new(session_key.clone(), reference.clone(), ttl_secs);
        record.audit(
            "session",
            "created",
            serde_json::json!({ "ttl_secs": ttl_secs }),
        );

        let ttl = Duration::from_secs(ttl_secs);
        self.write_record(&record, ttl).await?;
        self.kv.set_ex(&reference_key(&reference), &session_key, ttl).await?;

        tracing::info!(reference = %reference, ttl_secs, "Session created");
        Ok(record)
    }

    /// 按引用读取：刷新 last_accessed_at 并为两个键续期
    pub async fn get_by_reference(&self, reference: &str) -> Result<Option<SessionRecord>, StoreError> {
        let ref_key = reference_key(reference);
        let Some(session_key) = self.kv.get(&ref_key).await? else {
            return Ok(None);
        };
        let Some(blob) = self.kv.get(&session_key).await? else {
            tracing::debug!(reference, "Orphaned reference; treating as not found");
            return Ok(None);
        };

        let mut record = self.open_blob(reference, &blob)?;
        if record.reference != reference || record.session_key != session_key {
            return Err(StoreError::Integrity {
                reference: reference.to_string(),
                source: CodecError::Decryption("record does not belong to this reference".into()),
            });
        }

        record.last_accessed_at = Utc::now();
        let ttl = Duration::from_secs(record.ttl_secs);
        self.write_record(&record, ttl).await?;
        self.kv.expire(&ref_key, ttl).await?;
        Ok(Some(record))
    }

    /// 回写记录；引用已过期或已删除时失败（不复活会话）
    pub async fn update_session(&self, record: &mut SessionRecord) -> Result<(), StoreError> {
        let ttl = Duration::from_secs(record.ttl_secs);
        let ref_key = reference_key(&record.reference);
        if !self.kv.expire(&ref_key, ttl).await? {
            return Err(StoreError::Expired(record.reference.clone()));
        }
        record.last_accessed_at = Utc::now();
        self.write_record(record, ttl).await
    }

    /// 删除会话；返回是否确实删除了记录
    pub async fn delete_session(&self, reference: &str) -> Result<bool, StoreError> {
        let ref_key = reference_key(reference);
        let Some(session_key) = self.kv.get(&ref_key).await? else {
            return Ok(false);
        };
        let removed = self.kv.delete(&[ref_key.as_str(), session_key.as_str()]).await?;
        tracing::info!(reference, removed, "Session deleted");
        Ok(removed > 0)
    }

    /// 列出所有可解密的会话；损坏记录只计数并记录日志
    pub async fn list_active_sessions(&self) -> Result<SessionListing, StoreError> {
        let mut listing = SessionListing::default();
        for ref_key in self.kv.keys_with_prefix(REFERENCE_PREFIX).await? {
            let reference = &ref_key[REFERENCE_PREFIX.len()..];
            let Some(session_key) = self.kv.get(&ref_key).await? else {
                continue;
            };
            let Some(blob) = self.kv.get(&session_key).await? else {
                continue;
            };
            match self.open_blob(reference, &blob) {
                Ok(record) => listing.sessions.push(SessionSummary::from(&record)),
                Err(e) => {
                    tracing::error!(reference, error = %e, "Skipping undecryptable session");
                    listing.corrupted += 1;
                }
            }
        }
        listing.sessions.sort_by_key(|s| s.created_at);
        Ok(listing)
    }

    /// 剩余存活时间（按引用键计算）
    pub async fn remaining_ttl(&self, reference: &str) -> Result<Option<Duration>, StoreError> {
        Ok(self.kv.ttl(&reference_key(reference)).await?)
    }

    /// 清扫：物理删除过期键，并删除指向已消失记录的孤立引用
    pub async fn cleanup_expired(&self) -> Result<usize, StoreError> {
        let mut removed = self.kv.purge_expired().await?;
        for ref_key in self.kv.keys_with_prefix(REFERENCE_PREFIX).await? {
            let Some(session_key) = self.kv.get(&ref_key).await? else {
                continue;
            };
            if self.kv.get(&session_key).await?.is_none() {
                removed += self.kv.delete(&[ref_key.as_str()]).await?;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Cleaned up expired session keys");
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(StoreStats {
            backend: self.kv.backend_name(),
            total_sessions: self.kv.keys_with_prefix(SESSION_PREFIX).await?.len(),
            total_references: self.kv.keys_with_prefix(REFERENCE_PREFIX).await?.len(),
            max_sessions: self.settings.max_sessions,
            default_ttl_secs: self.settings.default_ttl_secs,
        })
    }

    async fn write_record(&self, record: &SessionRecord, ttl: Duration) -> Result<(), StoreError> {
        let stored = record.seal(&self.codec).map_err(StoreError::Encode)?;
        let blob = self.codec.encrypt_struct(&stored).map_err(StoreError::Encode)?;
        self.kv.set_ex(&record.session_key, &blob, ttl).await?;
        Ok(())
    }

    fn open_blob(&self, reference: &str, blob: &str) -> Result<SessionRecord, StoreError> {
        let integrity = |source| StoreError::Integrity {
            reference: reference.to_string(),
            source,
        };
        let stored: StoredRecord = self.codec.decrypt_struct(blob).map_err(integrity)?;
        stored.open(&self.codec).map_err(integrity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AgentStatus, DatabaseFamily};
    use crate::storage::MemoryKvStore;
    use crate::tools::ConnectionDescriptor;

    fn store_with(kv: Arc<MemoryKvStore>, secret: &str, max_sessions: usize) -> SessionStore {
        SessionStore::new(
            kv,
            Arc::new(EncryptionCodec::new(secret, 1_000).unwrap()),
            SessionStoreSettings {
                default_ttl_secs: 60,
                max_sessions,
            },
        )
    }

    fn store() -> SessionStore {
        store_with(Arc::new(MemoryKvStore::new()), "store-test", 10)
    }

    #[tokio::test]
    async fn test_create_and_get_by_reference() {
        let store = store();
        let created = store.create_session(None).await.unwrap();
        assert!(created.reference.starts_with("ref_"));
        assert_eq!(created.ttl_secs, 60);

        let loaded = store.get_by_reference(&created.reference).await.unwrap().unwrap();
        assert_eq!(loaded.session_key, created.session_key);
        assert_eq!(loaded.agent_status, AgentStatus::Initializing);
        assert!(loaded.last_accessed_at >= created.last_accessed_at);
    }

    #[tokio::test]
    async fn test_references_are_unique() {
        let store = store();
        let a = store.create_session(None).await.unwrap();
        let b = store.create_session(None).await.unwrap();
        assert_ne!(a.reference, b.reference);
        assert_ne!(a.session_key, b.session_key);
    }

    #[tokio::test]
    async fn test_unknown_reference_is_none() {
        assert!(store().get_by_reference("ref_missing").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_access_refreshes_ttl_and_expiry_hides_session() {
        let store = store();
        let created = store.create_session(Some(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.get_by_reference(&created.reference).await.unwrap().is_some());

        // 续期后再过 8 秒仍然存在
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.get_by_reference(&created.reference).await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.get_by_reference(&created.reference).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_after_expiry_does_not_resurrect() {
        let store = store();
        let mut record = store.create_session(Some(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        record.agent_status = AgentStatus::CollectingCredentials;
        let err = store.update_session(&mut record).await.unwrap_err();
        assert!(matches!(err, StoreError::Expired(_)));
        assert!(store.get_by_reference(&record.reference).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_persists_descriptor_encrypted() {
        let kv = Arc::new(MemoryKvStore::new());
        let store = store_with(kv.clone(), "store-test", 10);
        let mut record = store.create_session(None).await.unwrap();
        record.connection_descriptor = Some(ConnectionDescriptor {
            family: DatabaseFamily::Postgresql,
            host: "db.local".into(),
            port: 5432,
            username: "app".into(),
            password: "hunter2".into(),
            database_name: Some("orders".into()),
            tls_mode: "prefer".into(),
        });
        store.update_session(&mut record).await.unwrap();

        let raw = kv.get(&record.session_key).await.unwrap().unwrap();
        assert!(!raw.contains("hunter2"));
        assert!(!raw.contains("db.local"));

        let loaded = store.get_by_reference(&record.reference).await.unwrap().unwrap();
        assert_eq!(loaded.connection_descriptor.unwrap().password, "hunter2");
    }

    #[tokio::test]
    async fn test_wrong_key_is_integrity_error_not_absence() {
        let kv = Arc::new(MemoryKvStore::new());
        let writer = store_with(kv.clone(), "key-one", 10);
        let reader = store_with(kv, "key-two", 10);
        let record = writer.create_session(None).await.unwrap();

        let err = reader.get_by_reference(&record.reference).await.unwrap_err();
        assert!(matches!(err, StoreError::Integrity { .. }));
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[tokio::test]
    async fn test_orphaned_reference_is_not_found() {
        let kv = Arc::new(MemoryKvStore::new());
        let store = store_with(kv.clone(), "store-test", 10);
        let record = store.create_session(None).await.unwrap();
        kv.delete(&[record.session_key.as_str()]).await.unwrap();

        assert!(store.get_by_reference(&record.reference).await.unwrap().is_none());
        assert_eq!(store.cleanup_expired().await.unwrap(), 1);
        assert_eq!(store.stats().await.unwrap().total_references, 0);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = store();
        let record = store.create_session(None).await.unwrap();
        assert!(store.delete_session(&record.reference).await.unwrap());
        assert!(!store.delete_session(&record.reference).await.unwrap());
        assert!(store.get_by_reference(&record.reference).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_counts_corrupted_records() {
        let kv = Arc::new(MemoryKvStore::new());
        let store = store_with(kv.clone(), "store-test", 10);
        let good = store.create_session(None).await.unwrap();
        let bad = store.create_session(None).await.unwrap();
        kv.set_ex(&bad.session_key, "garbage", Duration::from_secs(60))
            .await
            .unwrap();

        let listing = store.list_active_sessions().await.unwrap();
        assert_eq!(listing.corrupted, 1);
        assert_eq!(listing.sessions.len(), 1);
        assert_eq!(listing.sessions[0].reference, good.reference);
    }

    #[tokio::test]
    async fn test_capacity_and_zero_ttl() {
        let store = store_with(Arc::new(MemoryKvStore::new()), "store-test", 1);
        store.create_session(None).await.unwrap();
        assert!(matches!(
            store.create_session(None).await.unwrap_err(),
            StoreError::Capacity(1)
        ));
        assert!(matches!(
            store.create_session(Some(0)).await.unwrap_err(),
            StoreError::InvalidTtl(0)
        ));
    }

    #[tokio::test]
    async fn test_oversized_ttl_rejected() {
        let store = store_with(Arc::new(MemoryKvStore::new()), "store-test", 10);
        assert!(matches!(
            store.create_session(Some(u64::MAX)).await.unwrap_err(),
            StoreError::InvalidTtl(u64::MAX)
        ));
        assert!(matches!(
            store.create_session(Some(MAX_SESSION_TTL_SECS + 1)).await.unwrap_err(),
            StoreError::InvalidTtl(_)
        ));
        let created = store.create_session(Some(MAX_SESSION_TTL_SECS)).await.unwrap();
        assert_eq!(created.ttl_secs, MAX_SESSION_TTL_SECS);
        assert_eq!(store.stats().await.unwrap().total_sessions, 1);
    }
}
