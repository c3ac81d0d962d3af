//! 会话记录
//!
//! `SessionRecord` 是解密后的内存形态；写入存储前先转成 `StoredRecord`，
//! 其中描述里的密码再单独加密一次（整条记录随后还会整体加密）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::codec::{CodecError, EncryptionCodec};
use crate::core::{AgentStatus, ConnectionStatus, DatabaseFamily};
use crate::tools::ConnectionDescriptor;

/// 审计条目（不含密码）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub step: String,
    pub action: String,
    #[serde(default)]
    pub detail: Value,
}

/// 会话记录（内存形态）
#[derive(Clone, Debug)]
pub struct SessionRecord {
    pub session_key: String,
    pub reference: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub is_active: bool,
    pub agent_status: AgentStatus,
    pub connection_status: ConnectionStatus,
    pub connection_descriptor: Option<ConnectionDescriptor>,
    pub connection_error: Option<String>,
    pub connection_tested_at: Option<DateTime<Utc>>,
    pub server_version: Option<String>,
    pub mcp_worker_id: Option<String>,
    pub audit_log: Vec<AuditEntry>,
}

impl SessionRecord {
    pub fn new(session_key: String, reference: String, ttl_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            session_key,
            reference,
            created_at: now,
            last_accessed_at: now,
            ttl_secs,
            is_active: true,
            agent_status: AgentStatus::Initializing,
            connection_status: ConnectionStatus::Pending,
            connection_descriptor: None,
            connection_error: None,
            connection_tested_at: None,
            server_version: None,
            mcp_worker_id: None,
            audit_log: Vec::new(),
        }
    }

    pub fn audit(&mut self, step: &str, action: &str, detail: Value) {
        self.audit_log.push(AuditEntry {
            timestamp: Utc::now(),
            step: step.to_string(),
            action: action.to_string(),
            detail,
        });
    }

    pub fn family(&self) -> Option<DatabaseFamily> {
        self.connection_descriptor.as_ref().map(|d| d.family)
    }

    /// 转为持久化形态：密码单独加密
    pub fn seal(&self, codec: &EncryptionCodec) -> Result<StoredRecord, CodecError> {
        let descriptor = match &self.connection_descriptor {
            Some(d) => Some(SealedDescriptor {
                family: d.family,
                host: d.host.clone(),
                port: d.port,
                username: d.username.clone(),
                password_token: codec.encrypt_str(&d.password)?,
                database_name: d.database_name.clone(),
                tls_mode: d.tls_mode.clone(),
            }),
            None => None,
        };
        Ok(StoredRecord {
            session_key: self.session_key.clone(),
            reference: self.reference.clone(),
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
            ttl_secs: self.ttl_secs,
            is_active: self.is_active,
            agent_status: self.agent_status,
            connection_status: self.connection_status,
            connection_descriptor: descriptor,
            connection_error: self.connection_error.clone(),
            connection_tested_at: self.connection_tested_at,
            server_version: self.server_version.clone(),
            mcp_worker_id: self.mcp_worker_id.clone(),
            audit_log: self.audit_log.clone(),
        })
    }
}

/// 持久化的连接描述（密码为密文令牌）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealedDescriptor {
    pub family: DatabaseFamily,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password_token: String,
    pub database_name: Option<String>,
    pub tls_mode: String,
}

/// 会话记录的持久化形态
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredRecord {
    pub session_key: String,
    pub reference: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub is_active: bool,
    pub agent_status: AgentStatus,
    pub connection_status: ConnectionStatus,
    pub connection_descriptor: Option<SealedDescriptor>,
    pub connection_error: Option<String>,
    pub connection_tested_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub server_version: Option<String>,
    pub mcp_worker_id: Option<String>,
    #[serde(default)]
    pub audit_log: Vec<AuditEntry>,
}

impl StoredRecord {
    /// 还原为内存形态：解密密码
    pub fn open(self, codec: &EncryptionCodec) -> Result<SessionRecord, CodecError> {
        let descriptor = match self.connection_descriptor {
            Some(d) => Some(ConnectionDescriptor {
                family: d.family,
                host: d.host,
                port: d.port,
                username: d.username,
                password: codec.decrypt_str(&d.password_token)?,
                database_name: d.database_name,
                tls_mode: d.tls_mode,
            }),
            None => None,
        };
        Ok(SessionRecord {
            session_key: self.session_key,
            reference: self.reference,
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
            ttl_secs: self.ttl_secs,
            is_active: self.is_active,
            agent_status: self.agent_status,
            connection_status: self.connection_status,
            connection_descriptor: descriptor,
            connection_error: self.connection_error,
            connection_tested_at: self.connection_tested_at,
            server_version: self.server_version,
            mcp_worker_id: self.mcp_worker_id,
            audit_log: self.audit_log,
        })
    }
}

/// 会话列表中的脱敏摘要
#[derive(Clone, Debug, Serialize)]
pub struct SessionSummary {
    pub reference: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub is_active: bool,
    pub agent_status: AgentStatus,
    pub connection_status: ConnectionStatus,
    pub family: Option<DatabaseFamily>,
}

impl From<&SessionRecord> for SessionSummary {
    fn from(record: &SessionRecord) -> Self {
        Self {
            reference: record.reference.clone(),
            created_at: record.created_at,
            last_accessed_at: record.last_accessed_at,
            ttl_secs: record.ttl_secs,
            is_active: record.is_active,
            agent_status: record.agent_status,
            connection_status: record.connection_status,
            family: record.family(),
        }
    }
}
