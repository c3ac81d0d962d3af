//! 核心层：错误分类、状态与迁移表、Agent 状态机、优雅关闭

pub mod error;
pub mod family;
pub mod shutdown;
pub mod state;
pub mod state_machine;

pub use error::{AgentError, ErrorKind, RecoveryAction};
pub use family::DatabaseFamily;
pub use shutdown::{
    run_with_graceful_shutdown, ShutdownCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason,
};
pub use state::{check_transition, AgentStatus, ConnectionStatus};
pub use state_machine::{AgentRun, AgentStateMachine, OperationResponse, SessionOperation};
