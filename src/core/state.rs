//! 状态定义：Agent 状态、连接状态与合法迁移表
//!
//! 只有 AgentStateMachine 会调用 `check_transition` 推进状态；其它组件只读。

use serde::{Deserialize, Serialize};

use crate::core::AgentError;

/// Agent 阶段（持久化在 SessionRecord 中）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Initializing,
    CollectingCredentials,
    TestingConnection,
    Connected,
    Ready,
    Error,
    Disconnected,
}

impl AgentStatus {
    /// 当前状态允许迁移到的目标状态
    pub fn allowed_targets(self) -> &'static [AgentStatus] {
        use AgentStatus::*;
        match self {
            Initializing => &[CollectingCredentials, Error],
            CollectingCredentials => &[TestingConnection, Error],
            // 连接测试超时落在 Error，ConnectionStatus 记为 Timeout
            TestingConnection => &[Connected, Error],
            Connected => &[Ready, Disconnected, Error],
            Ready => &[Disconnected, Error],
            Error => &[Initializing, Disconnected],
            Disconnected => &[Initializing],
        }
    }

    pub fn can_transition_to(self, to: AgentStatus) -> bool {
        self.allowed_targets().contains(&to)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Initializing => "initializing",
            AgentStatus::CollectingCredentials => "collecting_credentials",
            AgentStatus::TestingConnection => "testing_connection",
            AgentStatus::Connected => "connected",
            AgentStatus::Ready => "ready",
            AgentStatus::Error => "error",
            AgentStatus::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 连接测试状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Pending,
    Testing,
    Success,
    Failed,
    Timeout,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::Testing => "testing",
            ConnectionStatus::Success => "success",
            ConnectionStatus::Failed => "failed",
            ConnectionStatus::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 校验迁移是否合法；非法时返回 InvalidTransition，不修改任何状态
pub fn check_transition(from: AgentStatus, to: AgentStatus) -> Result<(), AgentError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(AgentError::InvalidTransition { from, to })
    }
}
