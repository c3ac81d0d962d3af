//! 凭据校验与查询防护
//!
//! 校验是纯函数：不做任何网络或进程调用。查询防护只是纵深防御（拦截明显的
//! 管理类语句与多语句注入），并不是 SQL 解析器；真正的权限控制在数据库账号上。

use std::net::IpAddr;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use super::descriptor::{ConnectionDescriptor, CredentialInput, PortValue};
use crate::core::DatabaseFamily;

pub const MIN_PORT: i64 = 1024;
pub const MAX_PORT: i64 = 65535;
const MAX_HOST_LEN: usize = 253;
const MAX_IDENT_LEN: usize = 63;
const MAX_PASSWORD_LEN: usize = 255;
const MAX_QUERY_LEN: usize = 100_000;

/// 单个字段的校验错误
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<FieldError>,
}

impl ValidationReport {
    pub fn has_error_for(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }

    /// 汇总成一行，写入 connection_error
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

fn hostname_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?)*$")
            .expect("hostname regex")
    })
}

fn username_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_\-]+$").expect("username regex"))
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("identifier regex"))
}

fn table_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*(\.[a-zA-Z_][a-zA-Z0-9_]*)?$").expect("table regex")
    })
}

pub fn is_valid_host(host: &str) -> bool {
    if host.is_empty() || host.len() > MAX_HOST_LEN {
        return false;
    }
    host.parse::<IpAddr>().is_ok() || hostname_re().is_match(host)
}

pub fn is_valid_port(port: i64) -> bool {
    (MIN_PORT..=MAX_PORT).contains(&port)
}

pub fn is_valid_username(username: &str) -> bool {
    !username.is_empty() && username.len() <= MAX_IDENT_LEN && username_re().is_match(username)
}

pub fn is_valid_password(password: &str) -> bool {
    !password.is_empty() && password.len() <= MAX_PASSWORD_LEN
}

pub fn is_valid_database_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_IDENT_LEN && identifier_re().is_match(name)
}

pub fn is_valid_table_name(name: &str) -> bool {
    name.len() <= 2 * MAX_IDENT_LEN + 1 && table_name_re().is_match(name)
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// 字段级校验；收集全部错误而不是遇到第一个就返回
pub fn validate_credentials(input: &CredentialInput) -> ValidationReport {
    let mut errors = Vec::new();

    let family = match non_blank(&input.family) {
        None => {
            errors.push(FieldError::new("family", "Missing required field: family"));
            None
        }
        Some(raw) => match raw.parse::<DatabaseFamily>() {
            Ok(f) => Some(f),
            Err(msg) => {
                errors.push(FieldError::new("family", msg));
                None
            }
        },
    };

    match non_blank(&input.host) {
        None => errors.push(FieldError::new("host", "Missing required field: host")),
        Some(host) if !is_valid_host(host) => {
            errors.push(FieldError::new("host", format!("Invalid host format: {host}")))
        }
        Some(_) => {}
    }

    if let Some(port) = &input.port {
        let parsed = match port {
            PortValue::Number(n) => Some(*n),
            PortValue::Text(t) => t.trim().parse::<i64>().ok(),
        };
        match parsed {
            None => errors.push(FieldError::new("port", "Port must be a valid integer")),
            Some(p) if !is_valid_port(p) => errors.push(FieldError::new(
                "port",
                format!("Port must be between {MIN_PORT} and {MAX_PORT}"),
            )),
            Some(_) => {}
        }
    }

    match non_blank(&input.username) {
        None => errors.push(FieldError::new("username", "Missing required field: username")),
        Some(u) if !is_valid_username(u) => errors.push(FieldError::new(
            "username",
            "Invalid username format (letters, digits, '_' and '-' only, at most 63 characters)",
        )),
        Some(_) => {}
    }

    // 密码不 trim：空白字符可以是密码的一部分
    match input.password.as_deref() {
        None | Some("") => {
            errors.push(FieldError::new("password", "Missing required field: password"))
        }
        Some(p) if !is_valid_password(p) => errors.push(FieldError::new(
            "password",
            format!("Password must be at most {MAX_PASSWORD_LEN} characters"),
        )),
        Some(_) => {}
    }

    if let Some(db) = non_blank(&input.database_name) {
        if !is_valid_database_name(db) {
            errors.push(FieldError::new(
                "database_name",
                format!("Invalid database name format: {db}"),
            ));
        }
    }

    if let (Some(family), Some(mode)) = (family, non_blank(&input.tls_mode)) {
        if !family.tls_modes().contains(&mode) {
            errors.push(FieldError::new(
                "tls_mode",
                format!(
                    "Invalid TLS mode for {family}: {mode}. Valid modes: {}",
                    family.tls_modes().join(", ")
                ),
            ));
        }
    }

    ValidationReport {
        valid: errors.is_empty(),
        errors,
    }
}

/// 校验并归一化（补默认端口与 TLS 模式）
pub fn build_descriptor(input: &CredentialInput) -> Result<ConnectionDescriptor, ValidationReport> {
    let report = validate_credentials(input);
    if !report.valid {
        return Err(report);
    }
    let invalid = |field: &str| ValidationReport {
        valid: false,
        errors: vec![FieldError::new(field, format!("Missing required field: {field}"))],
    };

    let family: DatabaseFamily = non_blank(&input.family)
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| invalid("family"))?;
    let port = match &input.port {
        Some(PortValue::Number(n)) => u16::try_from(*n).ok(),
        Some(PortValue::Text(t)) => t.trim().parse::<u16>().ok(),
        None => Some(family.default_port()),
    }
    .ok_or_else(|| invalid("port"))?;

    Ok(ConnectionDescriptor {
        family,
        host: non_blank(&input.host).ok_or_else(|| invalid("host"))?.to_string(),
        port,
        username: non_blank(&input.username)
            .ok_or_else(|| invalid("username"))?
            .to_string(),
        password: input.password.clone().ok_or_else(|| invalid("password"))?,
        database_name: non_blank(&input.database_name).map(str::to_string),
        tls_mode: non_blank(&input.tls_mode)
            .unwrap_or(family.default_tls_mode())
            .to_string(),
    })
}

/// 被拒绝的查询及原因
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueryRejection {
    pub reasons: Vec<String>,
}

impl std::fmt::Display for QueryRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reasons.join("; "))
    }
}

/// 禁止的管理类语句（按词边界、忽略大小写与多余空白匹配）
const BLOCKED_STATEMENTS: [(&str, &str); 9] = [
    (r"\bDROP\s+DATABASE\b", "DROP DATABASE"),
    (r"\bCREATE\s+DATABASE\b", "CREATE DATABASE"),
    (r"\bALTER\s+DATABASE\b", "ALTER DATABASE"),
    (r"\bDROP\s+USER\b", "DROP USER"),
    (r"\bCREATE\s+USER\b", "CREATE USER"),
    (r"\bGRANT\s+ALL\b", "GRANT ALL"),
    (r"\bREVOKE\s+ALL\b", "REVOKE ALL"),
    (r"\bSHUTDOWN\b", "SHUTDOWN"),
    (r"\bKILL\b", "KILL"),
];

fn blocked_statements() -> &'static [(Regex, &'static str)] {
    static RES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RES.get_or_init(|| {
        BLOCKED_STATEMENTS
            .iter()
            .map(|(pattern, label)| {
                let re = Regex::new(&format!("(?i){pattern}")).expect("blocked statement regex");
                (re, *label)
            })
            .collect()
    })
}

/// 查询防护：空查询、多语句、管理类关键字一律拒绝
///
/// 除单个结尾分号外，任何位置的 `;` 都会被拒绝（包括字符串字面量内的分号），
/// 比按语句数计数更严格。
pub fn validate_query(query: &str) -> Result<(), QueryRejection> {
    let trimmed = query.trim();
    let mut reasons = Vec::new();

    if trimmed.is_empty() {
        reasons.push("Query must not be empty".to_string());
    }
    if trimmed.len() > MAX_QUERY_LEN {
        reasons.push(format!("Query exceeds {MAX_QUERY_LEN} characters"));
    }

    // 只允许一个结尾分号
    let body = trimmed.strip_suffix(';').unwrap_or(trimmed);
    if body.contains(';') {
        reasons.push("Multiple statements are not allowed".to_string());
    }

    for (re, label) in blocked_statements() {
        if re.is_match(trimmed) {
            reasons.push(format!("{label} is not allowed"));
        }
    }

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(QueryRejection { reasons })
    }
}
