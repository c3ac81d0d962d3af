//! 连接工具：通过 Worker 执行连接测试、查询、列表与表结构
//!
//! 默认每次操作启动一个新 Worker，结束后立即停止；`keep_warm` 打开时，成功调用后的
//! Worker 保留给会话复用（会话记录里的 `mcp_worker_id`），出错则总是停止。

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use super::descriptor::ConnectionDescriptor;
use super::validation::{is_valid_table_name, validate_query, QueryRejection};
use crate::core::ErrorKind;
use crate::workers::protocol::{
    QueryResult, SchemaResult, TablesResult, TestConnectionResult, TOOL_EXECUTE_QUERY,
    TOOL_GET_SCHEMA, TOOL_LIST_TABLES, TOOL_TEST_CONNECTION,
};
use crate::workers::{ProtocolError, WorkerError, WorkerOrchestrator, WorkerState};

/// 工具调用失败
#[derive(Error, Debug, Clone)]
pub enum ToolFailure {
    #[error("Query rejected: {0}")]
    Rejected(QueryRejection),

    #[error("Invalid table name: {0}")]
    InvalidTable(String),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl ToolFailure {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolFailure::Rejected(_) | ToolFailure::InvalidTable(_) => ErrorKind::UserInput,
            ToolFailure::Worker(e) => e.kind(),
        }
    }

    /// 失败是否说明连接本身已不可用（Worker 起不来、超时、协议错误）
    pub fn breaks_connection(&self) -> bool {
        match self {
            ToolFailure::Worker(e) => !matches!(
                e,
                WorkerError::Tool(_) | WorkerError::Busy(_) | WorkerError::PoolClosed
            ),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ToolFailure::Worker(e) if e.is_timeout())
    }
}

/// 成功的工具调用，以及（keep_warm 时）保留下来的 Worker
#[derive(Clone, Debug)]
pub struct ToolRun<T> {
    pub data: T,
    pub worker_id: Option<String>,
}

/// 连接测试结果（测试失败不是错误，而是 success = false）
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionTestOutcome {
    pub success: bool,
    pub message: String,
    pub server_version: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub timed_out: bool,
    #[serde(skip)]
    pub worker_id: Option<String>,
}

impl ConnectionTestOutcome {
    fn failed(error: &WorkerError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            server_version: None,
            error_kind: Some(error.kind()),
            timed_out: error.is_timeout(),
            worker_id: None,
        }
    }
}

pub struct ConnectionTools {
    orchestrator: WorkerOrchestrator,
    keep_warm: bool,
}

impl ConnectionTools {
    pub fn new(orchestrator: WorkerOrchestrator, keep_warm: bool) -> Self {
        Self {
            orchestrator,
            keep_warm,
        }
    }

    pub fn orchestrator(&self) -> &WorkerOrchestrator {
        &self.orchestrator
    }

    pub fn keep_warm(&self) -> bool {
        self.keep_warm
    }

    /// 测试连接：启动 Worker → test_connection → 停止 Worker（keep_warm 且成功时保留）
    pub async fn test_connection(&self, descriptor: &ConnectionDescriptor) -> ConnectionTestOutcome {
        let args = Value::Object(descriptor.tool_arguments());
        let run = self
            .run_tool(descriptor, TOOL_TEST_CONNECTION, args, None, |v| {
                serde_json::from_value::<TestConnectionResult>(v)
            })
            .await;

        match run {
            Ok(ToolRun { data, worker_id }) if data.success => {
                tracing::info!(
                    url = %descriptor.redacted_url(),
                    version = ?data.version,
                    "Connection test succeeded"
                );
                ConnectionTestOutcome {
                    success: true,
                    message: if data.message.is_empty() {
                        "Connection successful".to_string()
                    } else {
                        data.message
                    },
                    server_version: data.version,
                    error_kind: None,
                    timed_out: false,
                    worker_id,
                }
            }
            Ok(ToolRun { data, worker_id }) => {
                // 数据库拒绝了连接；保留的 Worker 没有用处
                if let Some(id) = worker_id {
                    self.release(&id).await;
                }
                tracing::warn!(url = %descriptor.redacted_url(), "Connection test failed: {}", data.message);
                ConnectionTestOutcome {
                    success: false,
                    message: data.message,
                    server_version: None,
                    error_kind: Some(ErrorKind::Connectivity),
                    timed_out: false,
                    worker_id: None,
                }
            }
            Err(ToolFailure::Worker(e)) => {
                tracing::warn!(url = %descriptor.redacted_url(), error = %e, "Connection test failed");
                ConnectionTestOutcome::failed(&e)
            }
            Err(other) => ConnectionTestOutcome {
                success: false,
                message: other.to_string(),
                server_version: None,
                error_kind: Some(other.kind()),
                timed_out: false,
                worker_id: None,
            },
        }
    }

    /// 执行查询；防护不通过时不会接触任何 Worker
    pub async fn execute_query(
        &self,
        descriptor: &ConnectionDescriptor,
        query: &str,
        lease: Option<&str>,
    ) -> Result<ToolRun<QueryResult>, ToolFailure> {
        validate_query(query).map_err(ToolFailure::Rejected)?;
        let mut args = descriptor.tool_arguments();
        args.insert("query".into(), Value::String(query.trim().to_string()));
        self.run_tool(descriptor, TOOL_EXECUTE_QUERY, Value::Object(args), lease, |v| {
            serde_json::from_value::<QueryResult>(v)
        })
        .await
    }

    pub async fn list_tables(
        &self,
        descriptor: &ConnectionDescriptor,
        lease: Option<&str>,
    ) -> Result<ToolRun<TablesResult>, ToolFailure> {
        let args = Value::Object(descriptor.tool_arguments());
        self.run_tool(descriptor, TOOL_LIST_TABLES, args, lease, |v| {
            serde_json::from_value::<TablesResult>(v)
        })
        .await
    }

    pub async fn get_schema(
        &self,
        descriptor: &ConnectionDescriptor,
        table: &str,
        lease: Option<&str>,
    ) -> Result<ToolRun<SchemaResult>, ToolFailure> {
        let table = table.trim();
        if !is_valid_table_name(table) {
            return Err(ToolFailure::InvalidTable(table.to_string()));
        }
        let mut args: Map<String, Value> = descriptor.tool_arguments();
        args.insert("table_name".into(), Value::String(table.to_string()));
        self.run_tool(descriptor, TOOL_GET_SCHEMA, Value::Object(args), lease, |v| {
            serde_json::from_value::<SchemaResult>(v)
        })
        .await
    }

    /// 停止会话绑定的 Worker（不存在时忽略）
    pub async fn release(&self, worker_id: &str) {
        if let Err(e) = self.orchestrator.stop_worker(worker_id).await {
            tracing::warn!(worker_id, error = %e, "Failed to stop worker");
        }
    }

    async fn acquire(
        &self,
        descriptor: &ConnectionDescriptor,
        lease: Option<&str>,
    ) -> Result<String, WorkerError> {
        if self.keep_warm {
            if let Some(id) = lease {
                if let Ok(Some(info)) = self.orchestrator.worker_status(id).await {
                    if info.state == WorkerState::Idle && info.family == descriptor.family {
                        return Ok(id.to_string());
                    }
                }
            }
        }
        self.orchestrator.start_worker(descriptor.family).await
    }

    async fn run_tool<T>(
        &self,
        descriptor: &ConnectionDescriptor,
        tool: &str,
        args: Value,
        lease: Option<&str>,
        decode: impl FnOnce(Value) -> Result<T, serde_json::Error>,
    ) -> Result<ToolRun<T>, ToolFailure> {
        let worker_id = self.acquire(descriptor, lease).await?;
        let result = self
            .orchestrator
            .call_tool(&worker_id, tool, args)
            .await
            .and_then(|value| {
                decode(value).map_err(|e| WorkerError::Protocol {
                    worker_id: worker_id.clone(),
                    source: ProtocolError::Malformed(format!("{tool} result: {e}")),
                })
            });

        let keep = self.keep_warm && result.is_ok();
        if !keep {
            self.release(&worker_id).await;
        }
        let data = result?;
        Ok(ToolRun {
            data,
            worker_id: keep.then_some(worker_id),
        })
    }
}
