//! Agent 状态机：会话记录的唯一修改者
//!
//! 每一步都先校验迁移是否合法，再修改记录、追加审计条目并立即回写存储。
//! 主流程：initialize → collect_credentials → validate_credentials → test_connection
//! → (Connected → Ready)；任何一步失败落到 Error，cleanup 最终落到 Disconnected。

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use crate::core::{check_transition, AgentError, AgentStatus, ConnectionStatus, ErrorKind};
use crate::storage::{SessionRecord, SessionStore};
use crate::tools::{
    build_descriptor, ConnectionDescriptor, ConnectionTestOutcome, ConnectionTools,
    CredentialInput, ToolFailure, ValidationReport,
};
use crate::workers::protocol::QueryResult;

const AWAITING_CREDENTIALS: &str = "Waiting for database credentials: family (postgresql or mysql), host, port (optional), username, password, database_name (optional), tls_mode (optional)";

/// 一次编排调用的工作上下文；只有 `record` 会被持久化
#[derive(Debug)]
pub struct AgentRun {
    pub record: SessionRecord,
    pending: Option<CredentialInput>,
    candidate: Option<ConnectionDescriptor>,
    pub message: String,
    pub validation: Option<ValidationReport>,
    pub test_outcome: Option<ConnectionTestOutcome>,
}

impl AgentRun {
    pub fn resume(record: SessionRecord) -> Self {
        Self {
            record,
            pending: None,
            candidate: None,
            message: String::new(),
            validation: None,
            test_outcome: None,
        }
    }

    pub fn status(&self) -> AgentStatus {
        self.record.agent_status
    }

    pub fn reference(&self) -> &str {
        &self.record.reference
    }
}

/// 连接就绪后可执行的操作
#[derive(Clone, Debug)]
pub enum SessionOperation {
    Query(String),
    ListTables,
    GetSchema(String),
}

impl SessionOperation {
    pub fn name(&self) -> &'static str {
        match self {
            SessionOperation::Query(_) => "query",
            SessionOperation::ListTables => "list_tables",
            SessionOperation::GetSchema(_) => "get_schema",
        }
    }
}

/// 操作结果（`{success, data | error}`）
#[derive(Clone, Debug, Serialize)]
pub struct OperationResponse {
    pub success: bool,
    pub reference: String,
    pub operation: &'static str,
    pub status: AgentStatus,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

fn preview(text: &str) -> String {
    if text.chars().count() > 200 {
        format!("{}...", text.chars().take(200).collect::<String>())
    } else {
        text.to_string()
    }
}

fn provided_fields(input: &CredentialInput) -> Vec<&'static str> {
    [
        ("family", input.family.is_some()),
        ("host", input.host.is_some()),
        ("port", input.port.is_some()),
        ("username", input.username.is_some()),
        ("password", input.password.is_some()),
        ("database_name", input.database_name.is_some()),
        ("tls_mode", input.tls_mode.is_some()),
    ]
    .into_iter()
    .filter(|(_, present)| *present)
    .map(|(name, _)| name)
    .collect()
}

pub struct AgentStateMachine {
    store: Arc<SessionStore>,
    tools: Arc<ConnectionTools>,
}

impl AgentStateMachine {
    pub fn new(store: Arc<SessionStore>, tools: Arc<ConnectionTools>) -> Self {
        Self { store, tools }
    }

    fn transition(&self, run: &mut AgentRun, to: AgentStatus, step: &str) -> Result<(), AgentError> {
        let from = run.record.agent_status;
        check_transition(from, to)?;
        run.record.agent_status = to;
        run.record
            .audit(step, "status_changed", json!({ "from": from, "to": to }));
        tracing::info!(reference = %run.record.reference, %from, %to, step, "Agent status changed");
        Ok(())
    }

    async fn persist(&self, run: &mut AgentRun) -> Result<(), AgentError> {
        self.store.update_session(&mut run.record).await?;
        Ok(())
    }

    async fn load(&self, reference: &str) -> Result<SessionRecord, AgentError> {
        self.store
            .get_by_reference(reference)
            .await?
            .ok_or_else(|| AgentError::SessionNotFound(reference.to_string()))
    }

    /// 解析或创建会话，并把状态归位到 Initializing
    pub async fn initialize(
        &self,
        reference: Option<&str>,
        ttl_secs: Option<u64>,
    ) -> Result<AgentRun, AgentError> {
        let record = match reference {
            Some(r) => self.load(r).await?,
            None => self.store.create_session(ttl_secs).await?,
        };
        let mut run = AgentRun::resume(record);

        let reset = match run.status() {
            AgentStatus::Initializing | AgentStatus::CollectingCredentials => false,
            AgentStatus::Error | AgentStatus::Disconnected => {
                self.transition(&mut run, AgentStatus::Initializing, "initialize")?;
                true
            }
            AgentStatus::Connected | AgentStatus::Ready => {
                self.transition(&mut run, AgentStatus::Disconnected, "initialize")?;
                self.transition(&mut run, AgentStatus::Initializing, "initialize")?;
                true
            }
            // 上一次测试被中断（进程退出等），视为失败
            AgentStatus::TestingConnection => {
                self.transition(&mut run, AgentStatus::Error, "initialize")?;
                self.transition(&mut run, AgentStatus::Initializing, "initialize")?;
                true
            }
        };
        if reset {
            if let Some(id) = run.record.mcp_worker_id.take() {
                self.tools.release(&id).await;
            }
            run.record.connection_status = ConnectionStatus::Pending;
            run.record.connection_error = None;
        }

        run.record.is_active = true;
        run.record.audit(
            "initialize",
            "session_ready",
            json!({ "resumed": reference.is_some() }),
        );
        run.message = format!("Session {} initialized", run.record.reference);
        self.persist(&mut run).await?;
        Ok(run)
    }

    /// 进入凭据收集；无输入时重复给出提示（幂等）
    pub async fn collect_credentials(
        &self,
        run: &mut AgentRun,
        input: Option<CredentialInput>,
    ) -> Result<(), AgentError> {
        match run.status() {
            AgentStatus::Initializing => {
                self.transition(run, AgentStatus::CollectingCredentials, "collect_credentials")?
            }
            AgentStatus::CollectingCredentials => {}
            other => {
                return Err(AgentError::InvalidTransition {
                    from: other,
                    to: AgentStatus::CollectingCredentials,
                })
            }
        }

        match input {
            Some(input) => {
                run.record.audit(
                    "collect_credentials",
                    "credentials_received",
                    json!({ "fields": provided_fields(&input) }),
                );
                run.pending = Some(input);
                run.message = "Credentials received; validating".to_string();
            }
            None if run.pending.is_some() => {}
            None => {
                run.record
                    .audit("collect_credentials", "awaiting_credentials", Value::Null);
                run.message = AWAITING_CREDENTIALS.to_string();
            }
        }
        self.persist(run).await
    }

    /// 校验凭据：通过 → TestingConnection，不通过 → Error
    pub async fn validate_credentials(
        &self,
        run: &mut AgentRun,
    ) -> Result<ValidationReport, AgentError> {
        if run.status() != AgentStatus::CollectingCredentials {
            return Err(AgentError::InvalidTransition {
                from: run.status(),
                to: AgentStatus::TestingConnection,
            });
        }
        let input = run.pending.take().ok_or(AgentError::MissingCredentials)?;

        let report = match build_descriptor(&input) {
            Ok(descriptor) => {
                self.transition(run, AgentStatus::TestingConnection, "validate_credentials")?;
                run.record.connection_status = ConnectionStatus::Testing;
                run.record.connection_error = None;
                run.record.audit(
                    "validate_credentials",
                    "validated",
                    json!({ "valid": true, "family": descriptor.family, "url": descriptor.redacted_url() }),
                );
                run.message = format!("Credentials valid; testing {}", descriptor.redacted_url());
                run.candidate = Some(descriptor);
                ValidationReport {
                    valid: true,
                    errors: Vec::new(),
                }
            }
            Err(report) => {
                self.transition(run, AgentStatus::Error, "validate_credentials")?;
                run.record.connection_error = Some(report.summary());
                run.record.audit(
                    "validate_credentials",
                    "rejected",
                    json!({ "valid": false, "errors": report.errors }),
                );
                run.message = format!("Credential validation failed: {}", report.summary());
                report
            }
        };

        run.validation = Some(report.clone());
        self.persist(run).await?;
        Ok(report)
    }

    /// 测试连接；只能在 TestingConnection 状态调用，否则不做任何修改
    pub async fn test_connection(
        &self,
        run: &mut AgentRun,
    ) -> Result<ConnectionTestOutcome, AgentError> {
        if run.status() != AgentStatus::TestingConnection {
            return Err(AgentError::InvalidTransition {
                from: run.status(),
                to: AgentStatus::Connected,
            });
        }
        let descriptor = run
            .candidate
            .take()
            .or_else(|| run.record.connection_descriptor.clone())
            .ok_or(AgentError::MissingCredentials)?;

        if let Some(id) = run.record.mcp_worker_id.take() {
            self.tools.release(&id).await;
        }
        // 描述在测试开始时挂到会话上，失败也保留（供 retry_connection 复用）
        run.record.connection_descriptor = Some(descriptor.clone());
        run.record.audit(
            "test_connection",
            "started",
            json!({ "url": descriptor.redacted_url() }),
        );

        let outcome = self.tools.test_connection(&descriptor).await;
        run.record.connection_tested_at = Some(chrono::Utc::now());

        if outcome.success {
            run.record.connection_status = ConnectionStatus::Success;
            run.record.connection_error = None;
            run.record.server_version = outcome.server_version.clone();
            run.record.mcp_worker_id = outcome.worker_id.clone();
            self.transition(run, AgentStatus::Connected, "test_connection")?;
            run.record.audit(
                "test_connection",
                "succeeded",
                json!({ "server_version": outcome.server_version }),
            );
            self.persist(run).await?;

            self.transition(run, AgentStatus::Ready, "ready")?;
            run.message = format!(
                "Connected to {}; session is ready for queries",
                descriptor.redacted_url()
            );
        } else {
            run.record.connection_status = if outcome.timed_out {
                ConnectionStatus::Timeout
            } else {
                ConnectionStatus::Failed
            };
            run.record.connection_error = Some(outcome.message.clone());
            self.transition(run, AgentStatus::Error, "test_connection")?;
            run.record.audit(
                "test_connection",
                "failed",
                json!({
                    "message": outcome.message,
                    "error_kind": outcome.error_kind,
                    "timed_out": outcome.timed_out,
                }),
            );
            run.message = format!("Connection test failed: {}", outcome.message);
        }

        run.test_outcome = Some(outcome.clone());
        self.persist(run).await?;
        Ok(outcome)
    }

    /// 复用会话里已保存的连接描述，直接进入 TestingConnection
    pub async fn reuse_stored_descriptor(&self, run: &mut AgentRun) -> Result<(), AgentError> {
        let descriptor = run
            .record
            .connection_descriptor
            .clone()
            .ok_or(AgentError::MissingCredentials)?;
        self.transition(run, AgentStatus::TestingConnection, "retry")?;
        run.record.connection_status = ConnectionStatus::Testing;
        run.record.audit(
            "retry",
            "reusing_descriptor",
            json!({ "url": descriptor.redacted_url() }),
        );
        run.candidate = Some(descriptor);
        self.persist(run).await
    }

    /// 释放 Worker，标记会话为非活跃并落到 Disconnected
    pub async fn cleanup(&self, run: &mut AgentRun) -> Result<(), AgentError> {
        if let Some(id) = run.record.mcp_worker_id.take() {
            self.tools.release(&id).await;
        }
        run.record.is_active = false;
        if run.status() != AgentStatus::Disconnected {
            if !run.status().can_transition_to(AgentStatus::Disconnected) {
                self.transition(run, AgentStatus::Error, "cleanup")?;
            }
            self.transition(run, AgentStatus::Disconnected, "cleanup")?;
        }
        run.record.audit("cleanup", "session_closed", Value::Null);
        run.message = format!("Session {} disconnected", run.record.reference);
        self.persist(run).await
    }

    /// 完整的连接流程：initialize → collect → validate → test
    pub async fn connect(
        &self,
        reference: &str,
        input: CredentialInput,
    ) -> Result<AgentRun, AgentError> {
        let mut run = self.initialize(Some(reference), None).await?;
        self.collect_credentials(&mut run, Some(input)).await?;
        let report = self.validate_credentials(&mut run).await?;
        if report.valid {
            self.test_connection(&mut run).await?;
        }
        Ok(run)
    }

    /// 用已保存的描述重新测试连接（不需要重新提交密码）
    pub async fn retry(&self, reference: &str) -> Result<AgentRun, AgentError> {
        let mut run = self.initialize(Some(reference), None).await?;
        if run.record.connection_descriptor.is_none() {
            return Err(AgentError::MissingCredentials);
        }
        if run.status() == AgentStatus::Initializing {
            self.transition(&mut run, AgentStatus::CollectingCredentials, "retry")?;
        }
        self.reuse_stored_descriptor(&mut run).await?;
        self.test_connection(&mut run).await?;
        Ok(run)
    }

    pub async fn disconnect(&self, reference: &str) -> Result<AgentRun, AgentError> {
        let mut run = AgentRun::resume(self.load(reference).await?);
        self.cleanup(&mut run).await?;
        Ok(run)
    }

    /// 在 Ready 会话上执行操作；连接类失败把会话置为 Error，工具级错误不改变状态
    pub async fn run_operation(
        &self,
        reference: &str,
        op: SessionOperation,
    ) -> Result<OperationResponse, AgentError> {
        let mut run = AgentRun::resume(self.load(reference).await?);
        let not_ready = |status| AgentError::NotReady {
            reference: reference.to_string(),
            status,
        };
        if run.status() != AgentStatus::Ready {
            return Err(not_ready(run.status()));
        }
        let descriptor = run
            .record
            .connection_descriptor
            .clone()
            .ok_or_else(|| not_ready(run.status()))?;
        let lease = run.record.mcp_worker_id.clone();
        let lease = lease.as_deref();

        let result: Result<(Value, Option<String>, Value), ToolFailure> = match &op {
            SessionOperation::Query(query) => {
                let detail_query = preview(query);
                self.tools
                    .execute_query(&descriptor, query, lease)
                    .await
                    .map(|r| {
                        let detail = match &r.data {
                            QueryResult::Select { row_count, .. } => {
                                json!({ "query": detail_query, "kind": "select", "row_count": row_count })
                            }
                            QueryResult::Modify { row_count, .. } => {
                                json!({ "query": detail_query, "kind": "modify", "row_count": row_count })
                            }
                        };
                        (serde_json::to_value(&r.data).unwrap_or(Value::Null), r.worker_id, detail)
                    })
            }
            SessionOperation::ListTables => self
                .tools
                .list_tables(&descriptor, lease)
                .await
                .map(|r| {
                    let detail = json!({ "tables": r.data.tables.len() });
                    (serde_json::to_value(&r.data).unwrap_or(Value::Null), r.worker_id, detail)
                }),
            SessionOperation::GetSchema(table) => self
                .tools
                .get_schema(&descriptor, table, lease)
                .await
                .map(|r| {
                    let detail = json!({ "table": table, "columns": r.data.columns.len() });
                    (serde_json::to_value(&r.data).unwrap_or(Value::Null), r.worker_id, detail)
                }),
        };

        let response = match result {
            Ok((data, worker_id, detail)) => {
                run.record.mcp_worker_id = worker_id;
                run.record.audit(op.name(), "succeeded", detail);
                OperationResponse {
                    success: true,
                    reference: reference.to_string(),
                    operation: op.name(),
                    status: run.status(),
                    data: Some(data),
                    error: None,
                    error_kind: None,
                }
            }
            Err(failure) => {
                // 出错后 Worker 已被停止
                run.record.mcp_worker_id = None;
                run.record.audit(
                    op.name(),
                    "failed",
                    json!({ "error": failure.to_string(), "error_kind": failure.kind() }),
                );
                if failure.breaks_connection() {
                    run.record.connection_status = if failure.is_timeout() {
                        ConnectionStatus::Timeout
                    } else {
                        ConnectionStatus::Failed
                    };
                    run.record.connection_error = Some(failure.to_string());
                    self.transition(&mut run, AgentStatus::Error, op.name())?;
                }
                OperationResponse {
                    success: false,
                    reference: reference.to_string(),
                    operation: op.name(),
                    status: run.status(),
                    data: None,
                    error: Some(failure.to_string()),
                    error_kind: Some(failure.kind()),
                }
            }
        };

        self.persist(&mut run).await?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{EncryptionCodec, MemoryKvStore, SessionStoreSettings};
    use crate::workers::{OrchestratorSettings, WorkerOrchestrator, WorkerRegistry};

    fn machine() -> (AgentStateMachine, Arc<SessionStore>) {
        let store = Arc::new(SessionStore::new(
            Arc::new(MemoryKvStore::new()),
            Arc::new(EncryptionCodec::new("machine-test", 1_000).unwrap()),
            SessionStoreSettings::default(),
        ));
        // 没有注册任何 Worker：所有连接测试都会以 UnsupportedFamily 失败
        let orchestrator =
            WorkerOrchestrator::new(WorkerRegistry::new(), OrchestratorSettings::default());
        let tools = Arc::new(ConnectionTools::new(orchestrator, false));
        (AgentStateMachine::new(store.clone(), tools), store)
    }

    fn credentials() -> CredentialInput {
        CredentialInput::new("postgresql", "db.local", "app", "hunter2-secret")
            .with_port(5432)
            .with_database("orders")
    }

    #[tokio::test]
    async fn test_collect_without_input_is_idempotent() {
        let (machine, _) = machine();
        let mut run = machine.initialize(None, None).await.unwrap();
        assert_eq!(run.status(), AgentStatus::Initializing);

        machine.collect_credentials(&mut run, None).await.unwrap();
        let first = run.message.clone();
        machine.collect_credentials(&mut run, None).await.unwrap();
        assert_eq!(run.status(), AgentStatus::CollectingCredentials);
        assert_eq!(run.message, first);
        assert!(first.contains("host"));
    }

    #[tokio::test]
    async fn test_validate_without_input_fails_without_state_change() {
        let (machine, _) = machine();
        let mut run = machine.initialize(None, None).await.unwrap();
        machine.collect_credentials(&mut run, None).await.unwrap();
        let err = machine.validate_credentials(&mut run).await.unwrap_err();
        assert!(matches!(err, AgentError::MissingCredentials));
        assert_eq!(run.status(), AgentStatus::CollectingCredentials);
    }

    #[tokio::test]
    async fn test_invalid_credentials_move_to_error() {
        let (machine, store) = machine();
        let mut run = machine.initialize(None, None).await.unwrap();
        let mut input = credentials();
        input.host = None;
        machine.collect_credentials(&mut run, Some(input)).await.unwrap();
        let report = machine.validate_credentials(&mut run).await.unwrap();

        assert!(!report.valid);
        assert!(report.has_error_for("host"));
        let stored = store.get_by_reference(run.reference()).await.unwrap().unwrap();
        assert_eq!(stored.agent_status, AgentStatus::Error);
        assert!(stored.connection_error.unwrap().contains("host"));
    }

    #[tokio::test]
    async fn test_test_connection_outside_testing_state_is_rejected() {
        let (machine, store) = machine();
        let mut run = machine.initialize(None, None).await.unwrap();
        machine.collect_credentials(&mut run, None).await.unwrap();
        let audit_len = run.record.audit_log.len();

        let err = machine.test_connection(&mut run).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::InvalidTransition {
                from: AgentStatus::CollectingCredentials,
                to: AgentStatus::Connected
            }
        ));
        assert_eq!(run.record.audit_log.len(), audit_len);
        let stored = store.get_by_reference(run.reference()).await.unwrap().unwrap();
        assert_eq!(stored.agent_status, AgentStatus::CollectingCredentials);
    }

    #[tokio::test]
    async fn test_failed_connection_keeps_descriptor_and_hides_password() {
        let (machine, store) = machine();
        let created = machine.initialize(None, None).await.unwrap();
        let run = machine
            .connect(created.reference(), credentials())
            .await
            .unwrap();

        assert_eq!(run.status(), AgentStatus::Error);
        let outcome = run.test_outcome.as_ref().unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::UserInput));

        let stored = store.get_by_reference(run.reference()).await.unwrap().unwrap();
        assert_eq!(stored.connection_status, ConnectionStatus::Failed);
        assert!(stored.connection_descriptor.is_some());
        assert!(stored.connection_tested_at.is_some());
        let audit = serde_json::to_string(&stored.audit_log).unwrap();
        assert!(!audit.contains("hunter2-secret"));
    }

    #[tokio::test]
    async fn test_error_session_can_be_reinitialized() {
        let (machine, _) = machine();
        let created = machine.initialize(None, None).await.unwrap();
        let failed = machine.connect(created.reference(), credentials()).await.unwrap();
        assert_eq!(failed.status(), AgentStatus::Error);

        let run = machine.initialize(Some(failed.reference()), None).await.unwrap();
        assert_eq!(run.status(), AgentStatus::Initializing);
        assert_eq!(run.record.connection_status, ConnectionStatus::Pending);
        assert!(run.record.connection_descriptor.is_some());
    }

    #[tokio::test]
    async fn test_retry_without_descriptor_is_rejected() {
        let (machine, _) = machine();
        let created = machine.initialize(None, None).await.unwrap();
        let err = machine.retry(created.reference()).await.unwrap_err();
        assert!(matches!(err, AgentError::MissingCredentials));
    }

    #[tokio::test]
    async fn test_cleanup_from_collecting_goes_through_error() {
        let (machine, store) = machine();
        let mut run = machine.initialize(None, None).await.unwrap();
        machine.collect_credentials(&mut run, None).await.unwrap();
        machine.cleanup(&mut run).await.unwrap();

        let stored = store.get_by_reference(run.reference()).await.unwrap().unwrap();
        assert_eq!(stored.agent_status, AgentStatus::Disconnected);
        assert!(!stored.is_active);
        let steps: Vec<_> = stored
            .audit_log
            .iter()
            .filter(|e| e.action == "status_changed")
            .map(|e| e.detail["to"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(steps.last().map(String::as_str), Some("disconnected"));
        assert!(steps.contains(&"error".to_string()));
    }

    #[tokio::test]
    async fn test_operation_requires_ready_session() {
        let (machine, _) = machine();
        let run = machine.initialize(None, None).await.unwrap();
        let err = machine
            .run_operation(run.reference(), SessionOperation::ListTables)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AgentError::NotReady {
                status: AgentStatus::Initializing,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unknown_reference_is_not_found() {
        let (machine, _) = machine();
        let err = machine.initialize(Some("ref_nope"), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
