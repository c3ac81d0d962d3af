//! Agent 端到端流程测试：使用 dbagent-mock-worker 作为数据库 Worker

use std::sync::Arc;
use std::time::Duration;

use dbagent::core::{AgentStatus, ConnectionStatus, DatabaseFamily, ErrorKind};
use dbagent::storage::{EncryptionCodec, MemoryKvStore, SessionStore, SessionStoreSettings};
use dbagent::tools::CredentialInput;
use dbagent::workers::{OrchestratorSettings, WorkerOrchestrator, WorkerRegistry, WorkerSpec};
use dbagent::DatabaseAgent;

const MOCK_WORKER: &str = env!("CARGO_BIN_EXE_dbagent-mock-worker");
const PASSWORD: &str = "s3cret-Passw0rd";

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        call_timeout: Duration::from_secs(2),
        startup_timeout: Duration::from_secs(10),
        stop_grace: Duration::from_millis(500),
        idle_timeout: Duration::from_secs(1800),
        reaper_interval: Duration::from_secs(60),
    }
}

fn agent_with(spec: WorkerSpec, keep_warm: bool) -> DatabaseAgent {
    let store = Arc::new(SessionStore::new(
        Arc::new(MemoryKvStore::new()),
        Arc::new(EncryptionCodec::new("integration-secret", 1_000).unwrap()),
        SessionStoreSettings::default(),
    ));
    let mut registry = WorkerRegistry::new();
    registry.register(DatabaseFamily::Postgresql, spec);
    DatabaseAgent::new(store, WorkerOrchestrator::new(registry, settings()), keep_warm)
}

fn agent() -> DatabaseAgent {
    agent_with(WorkerSpec::new(MOCK_WORKER), false)
}

fn credentials(password: &str) -> CredentialInput {
    CredentialInput::new("postgresql", "db.internal", "app_user", password)
        .with_port(5432)
        .with_database("orders")
}

fn log_lines(path: &std::path::Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_connect_then_query_list_and_describe() {
    let agent = agent();
    let created = agent.create_session(None).await.unwrap();
    assert_eq!(created.status, AgentStatus::CollectingCredentials);

    let connected = agent
        .connect(&created.reference, credentials(PASSWORD))
        .await
        .unwrap();
    assert!(connected.success, "{connected:?}");
    assert_eq!(connected.status, AgentStatus::Ready);
    assert_eq!(connected.connection_status, ConnectionStatus::Success);
    assert_eq!(connected.server_version.as_deref(), Some("PostgreSQL 16.2"));
    let rendered = serde_json::to_string(&connected).unwrap();
    assert!(!rendered.contains(PASSWORD));

    let query = agent
        .query(&created.reference, "SELECT id, name FROM customers")
        .await
        .unwrap();
    assert!(query.success);
    let data = query.data.unwrap();
    assert_eq!(data["type"], "select");
    assert_eq!(data["row_count"], 2);
    assert_eq!(data["rows"][0]["name"], "alice");

    let tables = agent.list_tables(&created.reference).await.unwrap();
    assert!(tables.success);
    let tables = tables.data.unwrap();
    assert_eq!(tables["tables"].as_array().unwrap().len(), 2);
    assert_eq!(tables["tables"][0]["table"], "customers");

    let schema = agent.get_schema(&created.reference, "customers").await.unwrap();
    assert!(schema.success);
    let schema = schema.data.unwrap();
    assert_eq!(schema["table_name"], "customers");
    assert_eq!(schema["columns"][0]["name"], "id");
    assert_eq!(schema["columns"][0]["data_type"], "integer");

    let info = agent.get_session_info(&created.reference).await.unwrap();
    assert_eq!(info.agent_status, AgentStatus::Ready);
    assert_eq!(info.connection.unwrap().username, "app_user");
    assert!(info.audit_log.iter().any(|e| e.step == "test_connection"));
    let rendered = serde_json::to_string(&agent.get_session_info(&created.reference).await.unwrap())
        .unwrap();
    assert!(!rendered.contains(PASSWORD));

    // 每次调用后 Worker 都会被停止
    assert!(agent.list_workers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_password_then_reconnect() {
    let agent = agent();
    let created = agent.create_session(None).await.unwrap();

    let failed = agent
        .connect(&created.reference, credentials("wrong"))
        .await
        .unwrap();
    assert!(!failed.success);
    assert_eq!(failed.status, AgentStatus::Error);
    assert_eq!(failed.connection_status, ConnectionStatus::Failed);
    assert_eq!(failed.error_kind, Some(ErrorKind::Connectivity));
    assert!(failed
        .error
        .unwrap()
        .contains("password authentication failed"));

    let info = agent.get_session_info(&created.reference).await.unwrap();
    assert_eq!(info.agent_status, AgentStatus::Error);
    assert!(info.connection.is_some());

    let recovered = agent
        .connect(&created.reference, credentials(PASSWORD))
        .await
        .unwrap();
    assert!(recovered.success);
    assert_eq!(recovered.status, AgentStatus::Ready);
}

#[tokio::test]
async fn test_retry_after_disconnect_reuses_stored_credentials() {
    let agent = agent();
    let created = agent.create_session(None).await.unwrap();
    agent
        .connect(&created.reference, credentials(PASSWORD))
        .await
        .unwrap();

    let closed = agent.disconnect(&created.reference).await.unwrap();
    assert_eq!(closed.status, AgentStatus::Disconnected);

    let retried = agent.retry_connection(&created.reference).await.unwrap();
    assert!(retried.success, "{retried:?}");
    assert_eq!(retried.status, AgentStatus::Ready);
    assert!(agent.get_session_info(&created.reference).await.unwrap().is_active);
}

#[tokio::test]
async fn test_rejected_query_never_reaches_worker() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("calls.log");
    let spec = WorkerSpec::new(MOCK_WORKER).with_env("MOCK_WORKER_CALL_LOG", log.to_str().unwrap());
    let agent = agent_with(spec, false);

    let created = agent.create_session(None).await.unwrap();
    agent
        .connect(&created.reference, credentials(PASSWORD))
        .await
        .unwrap();
    let before = log_lines(&log);
    assert!(before.iter().any(|m| m == "test_connection"));

    let response = agent
        .query(&created.reference, "DROP DATABASE orders")
        .await
        .unwrap();
    assert!(!response.success);
    assert_eq!(response.error_kind, Some(ErrorKind::UserInput));
    assert_eq!(response.status, AgentStatus::Ready);
    assert!(response.error.unwrap().contains("DROP DATABASE"));

    let stacked = agent
        .query(&created.reference, "SELECT 1; DELETE FROM orders")
        .await
        .unwrap();
    assert!(!stacked.success);

    assert_eq!(log_lines(&log), before);
}

#[tokio::test]
async fn test_operations_require_ready_session() {
    let agent = agent();
    let created = agent.create_session(None).await.unwrap();

    let err = agent.query(&created.reference, "SELECT 1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UserInput);
    let err = agent.list_tables(&created.reference).await.unwrap_err();
    assert!(err.to_string().contains("not ready"));

    let info = agent.get_session_info(&created.reference).await.unwrap();
    assert_eq!(info.agent_status, AgentStatus::CollectingCredentials);
}

#[tokio::test]
async fn test_delete_session_is_idempotent() {
    let agent = agent();
    let created = agent.create_session(None).await.unwrap();
    agent
        .connect(&created.reference, credentials(PASSWORD))
        .await
        .unwrap();

    assert!(agent.delete_session(&created.reference).await.unwrap());
    assert!(!agent.delete_session(&created.reference).await.unwrap());

    let err = agent.get_session_info(&created.reference).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(agent.list_sessions().await.unwrap().count, 0);
}

#[tokio::test]
async fn test_query_timeout_moves_session_to_error() {
    let agent = agent();
    let created = agent.create_session(None).await.unwrap();
    agent
        .connect(&created.reference, credentials(PASSWORD))
        .await
        .unwrap();

    let response = agent
        .query(&created.reference, "SELECT pg_sleep(60)")
        .await
        .unwrap();
    assert!(!response.success);
    assert_eq!(response.status, AgentStatus::Error);
    assert_eq!(response.error_kind, Some(ErrorKind::Connectivity));

    let info = agent.get_session_info(&created.reference).await.unwrap();
    assert_eq!(info.connection_status, ConnectionStatus::Timeout);
    assert!(info.worker_id.is_none());
    assert!(agent.list_workers().await.unwrap().is_empty());

    // 会话仍可通过已保存的描述恢复
    let retried = agent.retry_connection(&created.reference).await.unwrap();
    assert_eq!(retried.status, AgentStatus::Ready);
}

#[tokio::test]
async fn test_tool_error_keeps_session_ready() {
    let agent = agent();
    let created = agent.create_session(None).await.unwrap();
    agent
        .connect(&created.reference, credentials(PASSWORD))
        .await
        .unwrap();

    let response = agent
        .query(&created.reference, "SELECT syntax_error")
        .await
        .unwrap();
    assert!(!response.success);
    assert_eq!(response.status, AgentStatus::Ready);
    assert!(response.error.unwrap().contains("syntax error"));

    let missing = agent.get_schema(&created.reference, "ghosts").await.unwrap();
    assert!(!missing.success);
    assert_eq!(missing.status, AgentStatus::Ready);
}

#[tokio::test]
async fn test_connection_timeout_is_reported() {
    let spec = WorkerSpec::new(MOCK_WORKER).with_env("MOCK_WORKER_TEST_RESULT", "hang");
    let agent = agent_with(spec, false);
    let created = agent.create_session(None).await.unwrap();

    let response = agent
        .connect(&created.reference, credentials(PASSWORD))
        .await
        .unwrap();
    assert!(!response.success);
    assert_eq!(response.status, AgentStatus::Error);
    assert_eq!(response.connection_status, ConnectionStatus::Timeout);
}

#[tokio::test]
async fn test_worker_crash_during_connect() {
    let spec = WorkerSpec::new(MOCK_WORKER).with_env("MOCK_WORKER_TEST_RESULT", "crash");
    let agent = agent_with(spec, false);
    let created = agent.create_session(None).await.unwrap();

    let response = agent
        .connect(&created.reference, credentials(PASSWORD))
        .await
        .unwrap();
    assert!(!response.success);
    assert_eq!(response.status, AgentStatus::Error);
    assert_eq!(response.connection_status, ConnectionStatus::Failed);
    assert_eq!(response.error_kind, Some(ErrorKind::Protocol));
    assert!(agent.list_workers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_keep_warm_reuses_worker_until_delete() {
    let agent = agent_with(WorkerSpec::new(MOCK_WORKER), true);
    let created = agent.create_session(None).await.unwrap();
    agent
        .connect(&created.reference, credentials(PASSWORD))
        .await
        .unwrap();

    let worker_id = agent
        .get_session_info(&created.reference)
        .await
        .unwrap()
        .worker_id
        .expect("worker kept after successful test");

    agent
        .query(&created.reference, "SELECT id FROM customers")
        .await
        .unwrap();
    agent.list_tables(&created.reference).await.unwrap();

    let workers = agent.list_workers().await.unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].id, worker_id);
    assert_eq!(workers[0].calls, 3);

    assert!(agent.delete_session(&created.reference).await.unwrap());
    assert!(agent.list_workers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let agent = Arc::new(agent());
    let a = agent.create_session(None).await.unwrap();
    let b = agent.create_session(None).await.unwrap();

    let (ra, rb) = tokio::join!(
        agent.connect(&a.reference, credentials(PASSWORD)),
        agent.connect(&b.reference, credentials("wrong")),
    );
    assert_eq!(ra.unwrap().status, AgentStatus::Ready);
    assert_eq!(rb.unwrap().status, AgentStatus::Error);

    let listing = agent.list_sessions().await.unwrap();
    assert_eq!(listing.count, 2);
}

#[tokio::test]
async fn test_stub_reporting_success_reaches_ready() {
    let spec = WorkerSpec::new(MOCK_WORKER).with_env("MOCK_WORKER_VERSION", "15.2");
    let agent = agent_with(spec, false);
    let created = agent.create_session(None).await.unwrap();

    let input = CredentialInput::new("postgresql", "localhost", "u", "p")
        .with_port(5432)
        .with_database("d");
    let response = agent.connect(&created.reference, input).await.unwrap();
    assert_eq!(response.status, AgentStatus::Ready);
    assert_eq!(response.connection_status, ConnectionStatus::Success);
    assert_eq!(response.server_version.as_deref(), Some("15.2"));
}

#[tokio::test]
async fn test_stub_reporting_failure_keeps_descriptor() {
    let spec = WorkerSpec::new(MOCK_WORKER)
        .with_env("MOCK_WORKER_TEST_RESULT", "fail")
        .with_env("MOCK_WORKER_FAIL_MESSAGE", "auth failed");
    let agent = agent_with(spec, false);
    let created = agent.create_session(None).await.unwrap();

    let input = CredentialInput::new("postgresql", "localhost", "u", "p")
        .with_port(5432)
        .with_database("d");
    let response = agent.connect(&created.reference, input).await.unwrap();
    assert_eq!(response.status, AgentStatus::Error);

    let info = agent.get_session_info(&created.reference).await.unwrap();
    assert_eq!(info.connection_error.as_deref(), Some("auth failed"));
    let connection = info.connection.unwrap();
    assert_eq!(connection.host, "localhost");
    assert_eq!(connection.database_name.as_deref(), Some("d"));
}

#[tokio::test]
async fn test_stacked_admin_statement_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("calls.log");
    let spec = WorkerSpec::new(MOCK_WORKER).with_env("MOCK_WORKER_CALL_LOG", log.to_str().unwrap());
    let agent = agent_with(spec, false);
    let created = agent.create_session(None).await.unwrap();
    agent
        .connect(&created.reference, credentials(PASSWORD))
        .await
        .unwrap();
    let before = log_lines(&log).len();

    let response = agent
        .query(&created.reference, "DROP DATABASE prod; SELECT 1")
        .await
        .unwrap();
    assert!(!response.success);
    let error = response.error.unwrap();
    assert!(error.contains("DROP DATABASE"), "{error}");
    assert!(error.contains("Multiple statements"), "{error}");
    assert_eq!(log_lines(&log).len(), before);
}
