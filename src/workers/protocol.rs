//! Worker 线协议：标准输入输出上的逐行 JSON
//!
//! 请求 `{"method": ..., "params": {...}, "id": n}`，响应 `{"result": ...}` 或
//! `{"error": "..."}`，并带回同一个 `id`。启动后第一条请求必须是 `initialize`，
//! Worker 在响应里声明自己提供的工具；`shutdown` 请求后 Worker 应自行退出。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const PROTOCOL_VERSION: &str = "1";
pub const HANDSHAKE_METHOD: &str = "initialize";
pub const SHUTDOWN_METHOD: &str = "shutdown";

pub const TOOL_TEST_CONNECTION: &str = "test_connection";
pub const TOOL_EXECUTE_QUERY: &str = "execute_query";
pub const TOOL_LIST_TABLES: &str = "list_tables";
pub const TOOL_GET_SCHEMA: &str = "get_schema";

/// 每个数据库 Worker 必须提供的工具
pub const REQUIRED_TOOLS: [&str; 4] = [
    TOOL_TEST_CONNECTION,
    TOOL_EXECUTE_QUERY,
    TOOL_LIST_TABLES,
    TOOL_GET_SCHEMA,
];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("malformed worker message: {0}")]
    Malformed(String),

    #[error("response id mismatch: expected {expected}, got {got}")]
    CorrelationMismatch { expected: u64, got: u64 },

    #[error("worker does not provide required tools: {0:?}")]
    MissingTools(Vec<String>),

    #[error("worker closed its output stream")]
    Closed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: u64,
}

impl ToolRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            id,
        }
    }

    pub fn to_line(&self) -> Result<String, ProtocolError> {
        let mut line =
            serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub id: u64,
}

impl ToolResponse {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn err(id: u64, message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(message.into()),
            id,
        }
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line.trim()).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// 外层 Err 表示协议违规，内层 Err 表示工具报告的错误
    pub fn into_outcome(self) -> Result<Result<Value, String>, ProtocolError> {
        match (self.result, self.error) {
            (Some(_), Some(_)) => Err(ProtocolError::Malformed(
                "response carries both result and error".into(),
            )),
            (None, Some(e)) => Ok(Err(e)),
            (Some(v), None) => Ok(Ok(v)),
            // `"result": null` 反序列化后也落在这里
            (None, None) => Ok(Ok(Value::Null)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInputField {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
}

/// Worker 声明的工具
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input: Vec<ToolInputField>,
}

impl ToolSpec {
    pub fn new(name: &str, description: &str, input: &[(&str, &str, bool)]) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input: input
                .iter()
                .map(|(n, k, r)| ToolInputField {
                    name: n.to_string(),
                    kind: k.to_string(),
                    required: *r,
                })
                .collect(),
        }
    }
}

/// `initialize` 的响应
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResult {
    pub server: String,
    #[serde(default)]
    pub protocol_version: String,
    pub tools: Vec<ToolSpec>,
}

impl HandshakeResult {
    /// 检查必需工具是否齐全
    pub fn verify(&self) -> Result<(), ProtocolError> {
        let missing: Vec<String> = REQUIRED_TOOLS
            .iter()
            .filter(|name| !self.tools.iter().any(|t| t.name == **name))
            .map(|s| s.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::MissingTools(missing))
        }
    }
}

/// `test_connection` 的结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestConnectionResult {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// `execute_query` 的结果
///
/// `rows` 按 Worker 原样保留：既可以是按列名索引的对象，也可以是数组。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryResult {
    Select {
        #[serde(default)]
        columns: Vec<String>,
        #[serde(default)]
        rows: Vec<Value>,
        row_count: u64,
    },
    Modify {
        row_count: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// `list_tables` 结果中的一项
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    #[serde(default)]
    pub schema: Option<String>,
    pub table: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// `get_schema` 结果中的列
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<String>,
}

/// `list_tables` 的结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TablesResult {
    pub tables: Vec<TableInfo>,
}

/// `get_schema` 的结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchemaResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    pub columns: Vec<ColumnInfo>,
}
