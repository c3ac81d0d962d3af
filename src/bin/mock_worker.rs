//! 模拟数据库 Worker：实现 Worker 线协议，用于本地联调与集成测试
//!
//! 行为通过环境变量控制：
//! - `MOCK_WORKER_TEST_RESULT`: test_connection 的表现，success（默认）/ fail / hang / crash / garbage / wrong_id
//! - `MOCK_WORKER_VERSION`: 连接成功时报告的服务器版本
//! - `MOCK_WORKER_FAIL_MESSAGE`: fail 模式下的失败信息
//! - `MOCK_WORKER_HANDSHAKE`: 设为 missing_tools 时握手只声明部分工具
//! - `MOCK_WORKER_CALL_LOG`: 若设置，每收到一个请求就把方法名追加写入该文件
//!
//! 密码为 `wrong` 时 test_connection 报告认证失败；查询中包含 `pg_sleep` 时挂起，
//! 包含 `crash_worker` 时进程直接退出，包含 `syntax_error` 时返回工具错误。

use std::io::Write;

use dbagent::workers::protocol::{
    ColumnInfo, HandshakeResult, QueryResult, SchemaResult, TableInfo, TablesResult,
    TestConnectionResult, ToolRequest, ToolResponse, ToolSpec, HANDSHAKE_METHOD, PROTOCOL_VERSION,
    SHUTDOWN_METHOD, TOOL_EXECUTE_QUERY, TOOL_GET_SCHEMA, TOOL_LIST_TABLES, TOOL_TEST_CONNECTION,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn log_call(method: &str) {
    let Some(path) = env("MOCK_WORKER_CALL_LOG") else {
        return;
    };
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
    {
        let _ = writeln!(file, "{method}");
    }
}

fn tool_specs() -> Vec<ToolSpec> {
    let conn = [
        ("host", "string", true),
        ("port", "integer", true),
        ("username", "string", true),
        ("password", "string", true),
        ("database_name", "string", false),
        ("tls_mode", "string", false),
    ];
    let mut query = conn.to_vec();
    query.push(("query", "string", true));
    let mut schema = conn.to_vec();
    schema.push(("table_name", "string", true));

    let mut tools = vec![
        ToolSpec::new(TOOL_TEST_CONNECTION, "Open and close a connection", &conn),
        ToolSpec::new(TOOL_EXECUTE_QUERY, "Run a single statement", &query),
        ToolSpec::new(TOOL_LIST_TABLES, "List user tables", &conn),
        ToolSpec::new(TOOL_GET_SCHEMA, "Describe the columns of a table", &schema),
    ];
    if env("MOCK_WORKER_HANDSHAKE").as_deref() == Some("missing_tools") {
        tools.truncate(1);
    }
    tools
}

fn param<'a>(params: &'a Value, key: &str) -> &'a str {
    params.get(key).and_then(Value::as_str).unwrap_or_default()
}

enum Action {
    Reply(String),
    Hang,
    Exit,
}

fn reply(response: ToolResponse) -> Action {
    match serde_json::to_string(&response) {
        Ok(line) => Action::Reply(line),
        Err(_) => Action::Exit,
    }
}

fn ok<T: serde::Serialize>(id: u64, value: T) -> Action {
    reply(ToolResponse::ok(
        id,
        serde_json::to_value(value).unwrap_or(Value::Null),
    ))
}

fn test_connection(request: &ToolRequest) -> Action {
    let mode = env("MOCK_WORKER_TEST_RESULT").unwrap_or_else(|| "success".into());
    match mode.as_str() {
        "hang" => return Action::Hang,
        "crash" => return Action::Exit,
        "garbage" => return Action::Reply("this is not json".into()),
        "wrong_id" => {
            return reply(ToolResponse::ok(
                request.id + 1000,
                json!({ "success": true, "message": "ok" }),
            ))
        }
        _ => {}
    }
    let username = param(&request.params, "username");
    let result = if mode == "fail" {
        TestConnectionResult {
            success: false,
            message: env("MOCK_WORKER_FAIL_MESSAGE")
                .unwrap_or_else(|| "could not connect to server: Connection refused".into()),
            version: None,
        }
    } else if param(&request.params, "password") == "wrong" {
        TestConnectionResult {
            success: false,
            message: format!("password authentication failed for user \"{username}\""),
            version: None,
        }
    } else {
        TestConnectionResult {
            success: true,
            message: "Connection successful".into(),
            version: Some(env("MOCK_WORKER_VERSION").unwrap_or_else(|| "PostgreSQL 16.2".into())),
        }
    };
    ok(request.id, result)
}

fn execute_query(request: &ToolRequest) -> Action {
    let query = param(&request.params, "query");
    let lowered = query.to_ascii_lowercase();
    if lowered.contains("pg_sleep") {
        return Action::Hang;
    }
    if lowered.contains("crash_worker") {
        return Action::Exit;
    }
    if lowered.contains("syntax_error") {
        return reply(ToolResponse::err(
            request.id,
            format!("syntax error at or near \"{}\"", query.split_whitespace().last().unwrap_or("")),
        ));
    }
    let result = if lowered.trim_start().starts_with("select") {
        QueryResult::Select {
            columns: vec!["id".into(), "name".into()],
            rows: vec![
                json!({"id": 1, "name": "alice"}),
                json!({"id": 2, "name": "bob"}),
            ],
            row_count: 2,
        }
    } else {
        QueryResult::Modify {
            row_count: 1,
            message: Some("Query executed successfully. 1 rows affected.".into()),
        }
    };
    ok(request.id, result)
}

fn list_tables(request: &ToolRequest) -> Action {
    let tables = ["customers", "orders"]
        .iter()
        .map(|name| TableInfo {
            schema: Some("public".into()),
            table: name.to_string(),
            owner: Some(param(&request.params, "username").to_string()),
            kind: Some("table".into()),
        })
        .collect();
    ok(request.id, TablesResult { tables })
}

fn get_schema(request: &ToolRequest) -> Action {
    let table = param(&request.params, "table_name");
    if !matches!(table, "customers" | "orders" | "public.customers" | "public.orders") {
        return reply(ToolResponse::err(
            request.id,
            format!("relation \"{table}\" does not exist"),
        ));
    }
    ok(
        request.id,
        SchemaResult {
            table_name: Some(table.to_string()),
            columns: vec![
                ColumnInfo {
                    name: "id".into(),
                    data_type: "integer".into(),
                    nullable: false,
                    default: Some("nextval('id_seq')".into()),
                },
                ColumnInfo {
                    name: "name".into(),
                    data_type: "text".into(),
                    nullable: true,
                    default: None,
                },
            ],
        },
    )
}

fn handle(request: &ToolRequest) -> Action {
    match request.method.as_str() {
        HANDSHAKE_METHOD => ok(
            request.id,
            HandshakeResult {
                server: "mock-db-worker".into(),
                protocol_version: PROTOCOL_VERSION.into(),
                tools: tool_specs(),
            },
        ),
        TOOL_TEST_CONNECTION => test_connection(request),
        TOOL_EXECUTE_QUERY => execute_query(request),
        TOOL_LIST_TABLES => list_tables(request),
        TOOL_GET_SCHEMA => get_schema(request),
        SHUTDOWN_METHOD => Action::Exit,
        other => reply(ToolResponse::err(request.id, format!("unknown method: {other}"))),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: ToolRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("mock worker: bad request: {e}");
                continue;
            }
        };
        log_call(&request.method);

        match handle(&request) {
            Action::Reply(mut out) => {
                out.push('\n');
                stdout.write_all(out.as_bytes()).await?;
                stdout.flush().await?;
            }
            Action::Hang => std::future::pending::<()>().await,
            Action::Exit => {
                if request.method == SHUTDOWN_METHOD {
                    let mut out = serde_json::to_string(&ToolResponse::ok(request.id, Value::Null))?;
                    out.push('\n');
                    let _ = stdout.write_all(out.as_bytes()).await;
                    let _ = stdout.flush().await;
                }
                break;
            }
        }
    }
    Ok(())
}
