//! 数据库会话 Agent 运行时
//!
//! 对调用方（命令行 JSON 行协议、上层 LLM 工具调用等）暴露的全部操作：
//! create_session / connect / query / list_tables / get_schema / get_session_info /
//! list_sessions / delete_session，以及 retry_connection / disconnect / list_workers / stats。
//!
//! 同一引用上的操作通过每引用一把异步锁串行执行；不同会话之间完全并发。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{
    AgentError, AgentRun, AgentStateMachine, AgentStatus, ConnectionStatus, ErrorKind,
    OperationResponse, SessionOperation, ShutdownCleanup,
};
use crate::storage::{
    AuditEntry, EncryptionCodec, KvStore, MemoryKvStore, SessionListing, SessionStore,
    SessionStoreSettings, StoreStats,
};
use crate::tools::{ConnectionTools, CredentialInput, DescriptorSummary, FieldError};
use crate::workers::{
    OrchestratorSettings, ToolSpec, WorkerInfo, WorkerOrchestrator, WorkerRegistry, WorkerState,
};

type LockTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// create_session 的返回
#[derive(Clone, Debug, Serialize)]
pub struct SessionCreated {
    pub reference: String,
    pub status: AgentStatus,
    pub ttl_secs: u64,
    pub created_at: DateTime<Utc>,
    pub message: String,
}

/// connect / retry_connection / disconnect 的返回
#[derive(Clone, Debug, Serialize)]
pub struct ConnectResponse {
    pub success: bool,
    pub reference: String,
    pub status: AgentStatus,
    pub connection_status: ConnectionStatus,
    pub message: String,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub server_version: Option<String>,
    pub connection: Option<DescriptorSummary>,
    pub validation_errors: Vec<FieldError>,
}

impl ConnectResponse {
    fn from_run(run: &AgentRun, success: bool) -> Self {
        let validation_errors = run
            .validation
            .as_ref()
            .map(|r| r.errors.clone())
            .unwrap_or_default();
        let error_kind = if !validation_errors.is_empty() {
            Some(ErrorKind::UserInput)
        } else {
            run.test_outcome.as_ref().and_then(|o| o.error_kind)
        };
        Self {
            success,
            reference: run.record.reference.clone(),
            status: run.record.agent_status,
            connection_status: run.record.connection_status,
            message: run.message.clone(),
            error: if success {
                None
            } else {
                run.record.connection_error.clone()
            },
            error_kind: if success { None } else { error_kind },
            server_version: run.record.server_version.clone(),
            connection: run.record.connection_descriptor.as_ref().map(|d| d.summary()),
            validation_errors,
        }
    }
}

/// get_session_info 的返回（不含密码）
#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    pub reference: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub remaining_ttl_secs: Option<u64>,
    pub is_active: bool,
    pub agent_status: AgentStatus,
    pub connection_status: ConnectionStatus,
    pub connection: Option<DescriptorSummary>,
    pub connection_error: Option<String>,
    pub connection_tested_at: Option<DateTime<Utc>>,
    pub server_version: Option<String>,
    pub worker_id: Option<String>,
    pub audit_log: Vec<AuditEntry>,
}

/// list_sessions 的返回
#[derive(Clone, Debug, Serialize)]
pub struct SessionListResponse {
    pub count: usize,
    #[serde(flatten)]
    pub listing: SessionListing,
}

#[derive(Clone, Debug, Serialize)]
pub struct AgentStats {
    pub store: StoreStats,
    pub workers: usize,
    pub busy_workers: usize,
    pub keep_warm: bool,
}

pub struct DatabaseAgent {
    store: Arc<SessionStore>,
    tools: Arc<ConnectionTools>,
    machine: AgentStateMachine,
    locks: LockTable,
    maintenance: CancellationToken,
}

/// 按配置构建 Agent：编解码器、存储后端、Worker 注册表与编排器，并启动后台清扫
pub async fn build_agent(cfg: &AppConfig) -> Result<DatabaseAgent, AgentError> {
    if cfg.security.uses_dev_key() {
        tracing::warn!(
            "No encryption key configured (security.encryption_key / DBAGENT__SECURITY__ENCRYPTION_KEY); using the development key"
        );
    }
    let codec = EncryptionCodec::new(cfg.security.effective_key(), cfg.security.kdf_iterations)
        .map_err(|e| AgentError::ConfigError(e.to_string()))?;

    let kv: Arc<dyn KvStore> = match cfg.store.backend.as_str() {
        "memory" => Arc::new(MemoryKvStore::new()),
        #[cfg(feature = "async-sqlite")]
        "sqlite" => Arc::new(
            crate::storage::SqliteKvStore::new(&cfg.store.sqlite_path)
                .await
                .map_err(|e| AgentError::ConfigError(e.to_string()))?,
        ),
        #[cfg(not(feature = "async-sqlite"))]
        "sqlite" => {
            return Err(AgentError::ConfigError(
                "store.backend = \"sqlite\" requires the async-sqlite feature".into(),
            ))
        }
        other => {
            return Err(AgentError::ConfigError(format!(
                "unknown store backend: {other}"
            )))
        }
    };

    let store = Arc::new(SessionStore::new(
        kv,
        Arc::new(codec),
        SessionStoreSettings {
            default_ttl_secs: cfg.session.default_ttl_secs,
            max_sessions: cfg.session.max_sessions,
        },
    ));

    let registry = WorkerRegistry::from_config(&cfg.workers).map_err(AgentError::ConfigError)?;
    if registry.families().is_empty() {
        tracing::warn!("No database workers configured under [workers.families]");
    }
    let orchestrator = WorkerOrchestrator::new(registry, OrchestratorSettings::from(&cfg.workers));

    let agent = DatabaseAgent::new(store, orchestrator, cfg.workers.keep_warm);
    agent.spawn_maintenance(Duration::from_secs(cfg.session.cleanup_interval_secs.max(1)));
    Ok(agent)
}

impl DatabaseAgent {
    pub fn new(store: Arc<SessionStore>, orchestrator: WorkerOrchestrator, keep_warm: bool) -> Self {
        let tools = Arc::new(ConnectionTools::new(orchestrator, keep_warm));
        Self {
            machine: AgentStateMachine::new(store.clone(), tools.clone()),
            store,
            tools,
            locks: Arc::new(Mutex::new(HashMap::new())),
            maintenance: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn orchestrator(&self) -> &WorkerOrchestrator {
        self.tools.orchestrator()
    }

    /// 周期性清扫过期会话，并回收不再使用的引用锁
    pub fn spawn_maintenance(&self, interval: Duration) {
        let store = self.store.clone();
        let locks = self.locks.clone();
        let token = self.maintenance.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.cleanup_expired().await {
                            tracing::warn!(error = %e, "Session cleanup failed");
                        }
                        let mut table = locks.lock().unwrap_or_else(PoisonError::into_inner);
                        table.retain(|_, lock| Arc::strong_count(lock) > 1);
                    }
                }
            }
        });
    }

    fn session_lock(&self, reference: &str) -> Arc<AsyncMutex<()>> {
        let mut table = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        table.entry(reference.to_string()).or_default().clone()
    }

    /// 创建会话，进入凭据收集阶段
    pub async fn create_session(&self, ttl_secs: Option<u64>) -> Result<SessionCreated, AgentError> {
        let mut run = self.machine.initialize(None, ttl_secs).await?;
        self.machine.collect_credentials(&mut run, None).await?;
        Ok(SessionCreated {
            reference: run.record.reference.clone(),
            status: run.record.agent_status,
            ttl_secs: run.record.ttl_secs,
            created_at: run.record.created_at,
            message: run.message,
        })
    }

    /// 提交凭据并测试连接；校验或连接失败返回 success = false（会话进入 Error）
    pub async fn connect(
        &self,
        reference: &str,
        credentials: CredentialInput,
    ) -> Result<ConnectResponse, AgentError> {
        let lock = self.session_lock(reference);
        let _guard = lock.lock().await;
        let run = self.machine.connect(reference, credentials).await?;
        let success = run.status() == AgentStatus::Ready;
        Ok(ConnectResponse::from_run(&run, success))
    }

    /// 复用已保存的连接描述重新测试
    pub async fn retry_connection(&self, reference: &str) -> Result<ConnectResponse, AgentError> {
        let lock = self.session_lock(reference);
        let _guard = lock.lock().await;
        let run = self.machine.retry(reference).await?;
        let success = run.status() == AgentStatus::Ready;
        Ok(ConnectResponse::from_run(&run, success))
    }

    pub async fn disconnect(&self, reference: &str) -> Result<ConnectResponse, AgentError> {
        let lock = self.session_lock(reference);
        let _guard = lock.lock().await;
        let run = self.machine.disconnect(reference).await?;
        Ok(ConnectResponse::from_run(&run, true))
    }

    pub async fn query(&self, reference: &str, query: &str) -> Result<OperationResponse, AgentError> {
        self.operation(reference, SessionOperation::Query(query.to_string()))
            .await
    }

    pub async fn list_tables(&self, reference: &str) -> Result<OperationResponse, AgentError> {
        self.operation(reference, SessionOperation::ListTables).await
    }

    pub async fn get_schema(
        &self,
        reference: &str,
        table: &str,
    ) -> Result<OperationResponse, AgentError> {
        self.operation(reference, SessionOperation::GetSchema(table.to_string()))
            .await
    }

    async fn operation(
        &self,
        reference: &str,
        op: SessionOperation,
    ) -> Result<OperationResponse, AgentError> {
        let lock = self.session_lock(reference);
        let _guard = lock.lock().await;
        self.machine.run_operation(reference, op).await
    }

    pub async fn get_session_info(&self, reference: &str) -> Result<SessionInfo, AgentError> {
        let lock = self.session_lock(reference);
        let _guard = lock.lock().await;
        let record = self
            .store
            .get_by_reference(reference)
            .await?
            .ok_or_else(|| AgentError::SessionNotFound(reference.to_string()))?;
        let remaining = self.store.remaining_ttl(reference).await?;
        Ok(SessionInfo {
            reference: record.reference,
            created_at: record.created_at,
            last_accessed_at: record.last_accessed_at,
            ttl_secs: record.ttl_secs,
            remaining_ttl_secs: remaining.map(|d| d.as_secs()),
            is_active: record.is_active,
            agent_status: record.agent_status,
            connection_status: record.connection_status,
            connection: record.connection_descriptor.as_ref().map(|d| d.summary()),
            connection_error: record.connection_error,
            connection_tested_at: record.connection_tested_at,
            server_version: record.server_version,
            worker_id: record.mcp_worker_id,
            audit_log: record.audit_log,
        })
    }

    pub async fn list_sessions(&self) -> Result<SessionListResponse, AgentError> {
        let listing = self.store.list_active_sessions().await?;
        Ok(SessionListResponse {
            count: listing.sessions.len(),
            listing,
        })
    }

    /// 删除会话（幂等）；若会话绑定了 Worker 先将其停止
    pub async fn delete_session(&self, reference: &str) -> Result<bool, AgentError> {
        let lock = self.session_lock(reference);
        let _guard = lock.lock().await;
        match self.store.get_by_reference(reference).await {
            Ok(Some(record)) => {
                if let Some(id) = record.mcp_worker_id {
                    self.tools.release(&id).await;
                }
            }
            Ok(None) => {}
            // 损坏的记录同样可以删除
            Err(e) => tracing::warn!(reference, error = %e, "Deleting unreadable session"),
        }
        let deleted = self.store.delete_session(reference).await?;
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(reference);
        Ok(deleted)
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerInfo>, AgentError> {
        Ok(self.orchestrator().list_workers().await?)
    }

    pub async fn worker_status(&self, worker_id: &str) -> Result<Option<WorkerInfo>, AgentError> {
        Ok(self.orchestrator().worker_status(worker_id).await?)
    }

    /// Worker 握手时声明的工具
    pub async fn list_tools(&self, worker_id: &str) -> Result<Vec<ToolSpec>, AgentError> {
        Ok(self.orchestrator().list_tools(worker_id).await?)
    }

    pub async fn stats(&self) -> Result<AgentStats, AgentError> {
        let workers = self.orchestrator().list_workers().await?;
        Ok(AgentStats {
            store: self.store.stats().await?,
            busy_workers: workers
                .iter()
                .filter(|w| w.state == WorkerState::Busy)
                .count(),
            workers: workers.len(),
            keep_warm: self.tools.keep_warm(),
        })
    }

    /// 停止后台清扫与全部 Worker；返回停止的 Worker 数
    pub async fn shutdown(&self) -> usize {
        self.maintenance.cancel();
        self.orchestrator().shutdown().await
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for DatabaseAgent {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let stopped = self.shutdown().await;
        tracing::info!(stopped, "Worker pool drained");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> DatabaseAgent {
        let store = Arc::new(SessionStore::new(
            Arc::new(MemoryKvStore::new()),
            Arc::new(EncryptionCodec::new("agent-test", 1_000).unwrap()),
            SessionStoreSettings::default(),
        ));
        let orchestrator =
            WorkerOrchestrator::new(WorkerRegistry::new(), OrchestratorSettings::default());
        DatabaseAgent::new(store, orchestrator, false)
    }

    #[tokio::test]
    async fn test_create_session_awaits_credentials() {
        let agent = agent();
        let created = agent.create_session(Some(120)).await.unwrap();
        assert_eq!(created.status, AgentStatus::CollectingCredentials);
        assert_eq!(created.ttl_secs, 120);
        assert!(created.message.contains("password"));

        let info = agent.get_session_info(&created.reference).await.unwrap();
        assert!(info.remaining_ttl_secs.unwrap() <= 120);
        assert!(info.connection.is_none());
    }

    #[tokio::test]
    async fn test_connect_with_invalid_credentials_reports_fields() {
        let agent = agent();
        let created = agent.create_session(None).await.unwrap();
        let input = CredentialInput::new("postgresql", "db.local", "bad user", "pw").with_port(80);
        let response = agent.connect(&created.reference, input).await.unwrap();

        assert!(!response.success);
        assert_eq!(response.status, AgentStatus::Error);
        assert_eq!(response.error_kind, Some(ErrorKind::UserInput));
        let fields: Vec<_> = response.validation_errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"port"));
        assert!(fields.contains(&"username"));
    }

    #[tokio::test]
    async fn test_unknown_reference_is_not_found() {
        let agent = agent();
        let err = agent.query("ref_missing", "SELECT 1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!agent.delete_session("ref_missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_sessions_and_stats() {
        let agent = agent();
        agent.create_session(None).await.unwrap();
        agent.create_session(None).await.unwrap();
        let listing = agent.list_sessions().await.unwrap();
        assert_eq!(listing.count, 2);
        assert_eq!(listing.listing.corrupted, 0);

        let stats = agent.stats().await.unwrap();
        assert_eq!(stats.store.total_sessions, 2);
        assert_eq!(stats.workers, 0);
    }

    #[tokio::test]
    async fn test_disconnect_marks_inactive() {
        let agent = agent();
        let created = agent.create_session(None).await.unwrap();
        let response = agent.disconnect(&created.reference).await.unwrap();
        assert_eq!(response.status, AgentStatus::Disconnected);
        let info = agent.get_session_info(&created.reference).await.unwrap();
        assert!(!info.is_active);
    }

    #[tokio::test]
    async fn test_shutdown_cleanup_closes_worker_pool() {
        let agent = agent();
        agent.cleanup().await.unwrap();
        assert_eq!(agent.name(), "agent");
        let err = agent
            .orchestrator()
            .start_worker(crate::core::DatabaseFamily::Postgresql)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::workers::WorkerError::PoolClosed));
    }
}
