//! 应用配置：从 config/dbagent.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DBAGENT__*` 覆盖（双下划线表示嵌套，如
//! `DBAGENT__SECURITY__ENCRYPTION_KEY=...`、`DBAGENT__WORKERS__CALL_TIMEOUT_SECS=10`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 未配置加密密钥时使用的开发密钥；启动时会打印警告
pub const DEV_ENCRYPTION_KEY: &str = "dbagent-dev-key-change-me";

/// 应用配置根（对应 config/dbagent.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub session: SessionSection,
    pub security: SecuritySection,
    pub store: StoreSection,
    pub workers: WorkersSection,
    pub logging: LoggingSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [session] 段：会话 TTL、容量与后台清扫间隔
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_max_sessions() -> usize {
    100
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            max_sessions: default_max_sessions(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

/// [security] 段：会话加密密钥与 PBKDF2 迭代次数
#[derive(Clone, Deserialize)]
pub struct SecuritySection {
    pub encryption_key: Option<String>,
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
}

fn default_kdf_iterations() -> u32 {
    crate::storage::DEFAULT_KDF_ITERATIONS
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            encryption_key: None,
            kdf_iterations: default_kdf_iterations(),
        }
    }
}

impl SecuritySection {
    /// 实际使用的密钥；未配置时回落到开发密钥
    pub fn effective_key(&self) -> &str {
        match self.encryption_key.as_deref() {
            Some(k) if !k.is_empty() => k,
            _ => DEV_ENCRYPTION_KEY,
        }
    }

    pub fn uses_dev_key(&self) -> bool {
        self.effective_key() == DEV_ENCRYPTION_KEY
    }
}

impl std::fmt::Debug for SecuritySection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecuritySection")
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "***"))
            .field("kdf_iterations", &self.kdf_iterations)
            .finish()
    }
}

/// [store] 段：memory（默认）或 sqlite（需 async-sqlite 特性）
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("dbagent_sessions.db")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sqlite_path: default_sqlite_path(),
        }
    }
}

/// [workers] 段：Worker 超时、空闲回收与各数据库类型的可执行文件
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// 启动 + 握手超时（秒）
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    /// 发送 shutdown 后等待退出的宽限期（毫秒）
    #[serde(default = "default_stop_grace_millis")]
    pub stop_grace_millis: u64,
    /// 空闲超过该分钟数的 Worker 会被回收
    #[serde(default = "default_idle_minutes")]
    pub idle_minutes: u64,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    /// 为 true 时连接成功后查询复用同一个 Worker，否则每次调用后停止
    #[serde(default)]
    pub keep_warm: bool,
    /// [workers.families.<family>]
    #[serde(default)]
    pub families: HashMap<String, WorkerFamilySection>,
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_startup_timeout_secs() -> u64 {
    10
}

fn default_stop_grace_millis() -> u64 {
    500
}

fn default_idle_minutes() -> u64 {
    30
}

fn default_reaper_interval_secs() -> u64 {
    60
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
            startup_timeout_secs: default_startup_timeout_secs(),
            stop_grace_millis: default_stop_grace_millis(),
            idle_minutes: default_idle_minutes(),
            reaper_interval_secs: default_reaper_interval_secs(),
            keep_warm: false,
            families: HashMap::new(),
        }
    }
}

/// 单个数据库类型的 Worker 启动方式
#[derive(Debug, Clone, Deserialize, Default)]
pub struct WorkerFamilySection {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// [logging] 段
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// pretty / json
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 DBAGENT__* 可覆盖
///
/// 1. 按顺序查找 config/dbagent.toml、../config/dbagent.toml、dbagent.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DBAGENT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/dbagent", "../config/dbagent", "dbagent"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DBAGENT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    let cfg: AppConfig = c.try_deserialize()?;
    validate_config(&cfg)?;
    Ok(cfg)
}

/// 拒绝会导致运行期异常的取值
pub fn validate_config(cfg: &AppConfig) -> Result<(), config::ConfigError> {
    let invalid = |msg: &str| Err(config::ConfigError::Message(msg.to_string()));
    if cfg.session.default_ttl_secs == 0 {
        return invalid("session.default_ttl_secs must be positive");
    }
    if cfg.session.default_ttl_secs > crate::storage::MAX_SESSION_TTL_SECS {
        return invalid("session.default_ttl_secs exceeds the 30 day limit");
    }
    if cfg.session.max_sessions == 0 {
        return invalid("session.max_sessions must be positive");
    }
    if cfg.workers.call_timeout_secs == 0 {
        return invalid("workers.call_timeout_secs must be positive");
    }
    if cfg.workers.startup_timeout_secs == 0 {
        return invalid("workers.startup_timeout_secs must be positive");
    }
    if cfg.security.kdf_iterations == 0 {
        return invalid("security.kdf_iterations must be positive");
    }
    if !matches!(cfg.store.backend.as_str(), "memory" | "sqlite") {
        return invalid("store.backend must be memory or sqlite");
    }
    Ok(())
}
