//! 存储层：加密编解码、TTL 键值存储、加密会话存储

pub mod codec;
pub mod kv;
pub mod record;
pub mod session_store;
#[cfg(feature = "async-sqlite")]
pub mod sqlite_kv;

pub use codec::{CodecError, EncryptionCodec, DEFAULT_KDF_ITERATIONS};
pub use kv::{KvError, KvStore, MemoryKvStore};
pub use record::{AuditEntry, SessionRecord, SessionSummary};
pub use session_store::{
    SessionListing, SessionStore, SessionStoreSettings, StoreError, StoreStats,
    MAX_SESSION_TTL_SECS,
};
#[cfg(feature = "async-sqlite")]
pub use sqlite_kv::SqliteKvStore;
