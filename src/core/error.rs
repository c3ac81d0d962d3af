//! Agent 错误类型与恢复动作
//!
//! 错误按四类归档（用户输入 / 连通性 / 完整性 / 协议），再加上状态机非法迁移；
//! `kind()` 给出分类，`recovery()` 告诉调用方下一步该做什么。

use serde::Serialize;
use thiserror::Error;

use crate::core::AgentStatus;
use crate::storage::StoreError;
use crate::workers::WorkerError;

/// 错误分类（对外响应中的 error_kind）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UserInput,
    Connectivity,
    Integrity,
    Protocol,
    InvalidTransition,
    NotFound,
    Internal,
}

/// Agent 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Session not found or expired: {0}")]
    SessionNotFound(String),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: AgentStatus, to: AgentStatus },

    #[error("Session {reference} is not ready (status: {status})")]
    NotReady { reference: String, status: AgentStatus },

    #[error("No credentials supplied for this session")]
    MissingCredentials,

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Session store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::SessionNotFound(_) => ErrorKind::NotFound,
            AgentError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            AgentError::NotReady { .. } | AgentError::MissingCredentials => ErrorKind::UserInput,
            AgentError::Worker(e) => e.kind(),
            AgentError::Store(e) => e.kind(),
            AgentError::ConfigError(_) => ErrorKind::Internal,
        }
    }

    pub fn recovery(&self) -> RecoveryAction {
        match self.kind() {
            ErrorKind::UserInput => RecoveryAction::FixInput,
            ErrorKind::Connectivity => RecoveryAction::RetryConnection,
            ErrorKind::NotFound => RecoveryAction::CreateSession,
            ErrorKind::Integrity | ErrorKind::Protocol => RecoveryAction::Escalate,
            ErrorKind::InvalidTransition | ErrorKind::Internal => RecoveryAction::Abort,
        }
    }
}

/// 调用方收到错误后的建议动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// 修正凭据或查询后重新提交
    FixInput,
    /// 使用修正后的凭据重试连接（或 retry_connection 复用已存描述）
    RetryConnection,
    /// 会话已过期或不存在，重新创建
    CreateSession,
    /// 记录已损坏或 Worker 行为异常，需要运维介入
    Escalate,
    /// 终止当前操作
    Abort,
}
