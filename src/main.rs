//! dbagent - 会话级数据库连接 Agent
//!
//! 入口：加载配置、初始化日志、构建 Agent，然后在 stdin/stdout 上逐行处理 JSON 请求：
//! `{"id": 1, "op": "create_session"}` → `{"id": 1, "ok": true, "result": {...}}`。
//! 日志只写 stderr。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dbagent::config::load_config;
use dbagent::core::{
    run_with_graceful_shutdown, AgentError, ErrorKind, RecoveryAction, ShutdownCoordinator,
    ShutdownManager,
};
use dbagent::tools::CredentialInput;
use dbagent::{build_agent, observability, DatabaseAgent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    CreateSession {
        #[serde(default)]
        ttl_secs: Option<u64>,
    },
    Connect {
        reference: String,
        credentials: CredentialInput,
    },
    RetryConnection {
        reference: String,
    },
    Disconnect {
        reference: String,
    },
    Query {
        reference: String,
        query: String,
    },
    ListTables {
        reference: String,
    },
    GetSchema {
        reference: String,
        table: String,
    },
    GetSessionInfo {
        reference: String,
    },
    ListSessions,
    DeleteSession {
        reference: String,
    },
    ListWorkers,
    WorkerStatus {
        worker_id: String,
    },
    ListTools {
        worker_id: String,
    },
    Stats,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<Value>,
    #[serde(flatten)]
    request: Request,
}

#[derive(Debug, Serialize)]
struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recovery: Option<RecoveryAction>,
}

impl Reply {
    fn ok(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
            error_kind: None,
            recovery: None,
        }
    }

    fn failed(id: Option<Value>, error: &AgentError) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            recovery: Some(error.recovery()),
        }
    }

    fn malformed(message: String) -> Self {
        Self {
            id: None,
            ok: false,
            result: None,
            error: Some(message),
            error_kind: Some(ErrorKind::UserInput),
            recovery: Some(RecoveryAction::FixInput),
        }
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, AgentError> {
    serde_json::to_value(value).map_err(|e| AgentError::ConfigError(e.to_string()))
}

async fn dispatch(agent: &DatabaseAgent, request: Request) -> Result<Value, AgentError> {
    match request {
        Request::CreateSession { ttl_secs } => to_value(agent.create_session(ttl_secs).await?),
        Request::Connect {
            reference,
            credentials,
        } => to_value(agent.connect(&reference, credentials).await?),
        Request::RetryConnection { reference } => {
            to_value(agent.retry_connection(&reference).await?)
        }
        Request::Disconnect { reference } => to_value(agent.disconnect(&reference).await?),
        Request::Query { reference, query } => to_value(agent.query(&reference, &query).await?),
        Request::ListTables { reference } => to_value(agent.list_tables(&reference).await?),
        Request::GetSchema { reference, table } => {
            to_value(agent.get_schema(&reference, &table).await?)
        }
        Request::GetSessionInfo { reference } => {
            to_value(agent.get_session_info(&reference).await?)
        }
        Request::ListSessions => to_value(agent.list_sessions().await?),
        Request::DeleteSession { reference } => {
            let deleted = agent.delete_session(&reference).await?;
            Ok(serde_json::json!({ "reference": reference, "deleted": deleted }))
        }
        Request::ListWorkers => to_value(agent.list_workers().await?),
        Request::WorkerStatus { worker_id } => to_value(agent.worker_status(&worker_id).await?),
        Request::ListTools { worker_id } => to_value(agent.list_tools(&worker_id).await?),
        Request::Stats => to_value(agent.stats().await?),
    }
}

async fn handle_line(agent: &DatabaseAgent, line: &str) -> Reply {
    let envelope: Envelope = match serde_json::from_str(line) {
        Ok(e) => e,
        Err(e) => return Reply::malformed(format!("Invalid request: {e}")),
    };
    match dispatch(agent, envelope.request).await {
        Ok(result) => Reply::ok(envelope.id, result),
        Err(e) => {
            tracing::debug!(error = %e, "Request failed");
            Reply::failed(envelope.id, &e)
        }
    }
}

/// 逐行处理 stdin，直到 EOF
async fn serve(agent: Arc<DatabaseAgent>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = handle_line(&agent, &line).await;
        let mut out = serde_json::to_string(&reply)?;
        out.push('\n');
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    std::env::var_os("DBAGENT_CONFIG").map(PathBuf::from)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = load_config(config_path_from_args()).context("Failed to load configuration")?;
    observability::init(&cfg.logging).context("Failed to initialize logging")?;

    let agent = Arc::new(build_agent(&cfg).await.context("Failed to create agent")?);
    tracing::info!(
        name = cfg.app.name.as_deref().unwrap_or("dbagent"),
        families = ?agent.orchestrator().families(),
        "Agent ready"
    );

    let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    coordinator.register(agent.clone());
    coordinator.register(agent.store().clone());

    let app = {
        let agent = agent.clone();
        async move {
            if let Err(e) = serve(agent).await {
                tracing::error!(error = %e, "Request loop failed");
            }
        }
    };
    run_with_graceful_shutdown(Arc::new(ShutdownManager::new()), app, || async {
        coordinator.run_cleanup().await;
    })
    .await;
    Ok(())
}
