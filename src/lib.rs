//! dbagent - 会话级数据库连接 Agent
//!
//! 模块划分：
//! - **agent**: 对外操作（创建会话、连接、查询、列表、表结构、会话信息、删除）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 状态机、错误分类、优雅关闭
//! - **observability**: tracing 初始化
//! - **storage**: 加密编解码、TTL 键值存储、会话存储
//! - **tools**: 凭据校验、查询防护、连接工具
//! - **workers**: 数据库 Worker 子进程协议与编排

pub mod agent;
pub mod config;
pub mod core;
pub mod observability;
pub mod storage;
pub mod tools;
pub mod workers;

pub use agent::{build_agent, DatabaseAgent};
