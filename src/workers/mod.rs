//! 数据库 Worker 编排：按数据库类型启动子进程，通过 stdio JSON 协议调用工具
//!
//! - **protocol**: 线协议与工具结果类型
//! - **registry**: 数据库类型 → 可执行文件的静态映射
//! - **process**: 单个 Worker 子进程（握手、请求/响应关联、优雅退出与强杀）
//! - **orchestrator**: Worker 表的唯一所有者（actor），负责占用、超时、空闲回收

pub mod orchestrator;
pub mod process;
pub mod protocol;
pub mod registry;

use thiserror::Error;

use crate::core::{DatabaseFamily, ErrorKind};

pub use orchestrator::{OrchestratorSettings, WorkerInfo, WorkerOrchestrator, WorkerState};
pub use protocol::{ProtocolError, ToolSpec};
pub use registry::{WorkerRegistry, WorkerSpec};

#[derive(Error, Debug, Clone)]
pub enum WorkerError {
    #[error("No worker registered for database family: {0}")]
    UnsupportedFamily(DatabaseFamily),

    #[error("Failed to start {family} worker: {message}")]
    Start {
        family: DatabaseFamily,
        message: String,
    },

    #[error("Worker not found: {0}")]
    NotFound(String),

    #[error("Worker {0} is busy with another call")]
    Busy(String),

    #[error("Worker {worker_id} timed out after {timeout_ms}ms calling {tool}")]
    Timeout {
        worker_id: String,
        tool: String,
        timeout_ms: u64,
    },

    #[error("Worker {0} exited unexpectedly")]
    Exited(String),

    #[error("Worker {worker_id} protocol error: {source}")]
    Protocol {
        worker_id: String,
        #[source]
        source: ProtocolError,
    },

    #[error("Worker I/O error: {0}")]
    Io(String),

    /// Worker 正常返回了工具级错误（例如 SQL 语法错误）
    #[error("{0}")]
    Tool(String),

    #[error("Worker pool is shut down")]
    PoolClosed,
}

impl WorkerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::UnsupportedFamily(_) | WorkerError::Tool(_) => ErrorKind::UserInput,
            WorkerError::Start { .. }
            | WorkerError::Busy(_)
            | WorkerError::Timeout { .. }
            | WorkerError::Exited(_)
            | WorkerError::Io(_) => ErrorKind::Connectivity,
            WorkerError::Protocol { .. } => ErrorKind::Protocol,
            WorkerError::NotFound(_) => ErrorKind::NotFound,
            WorkerError::PoolClosed => ErrorKind::Internal,
        }
    }

    /// 该错误之后 Worker 不可再用（已被或应被终止）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkerError::Timeout { .. }
                | WorkerError::Exited(_)
                | WorkerError::Protocol { .. }
                | WorkerError::Io(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, WorkerError::Timeout { .. })
    }
}
