//! 数据库类型（Worker 按类型区分）

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 支持的数据库类型；每种类型对应一个 Worker 可执行文件
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseFamily {
    Postgresql,
    Mysql,
}

impl DatabaseFamily {
    pub const ALL: [DatabaseFamily; 2] = [DatabaseFamily::Postgresql, DatabaseFamily::Mysql];

    pub fn as_str(self) -> &'static str {
        match self {
            DatabaseFamily::Postgresql => "postgresql",
            DatabaseFamily::Mysql => "mysql",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            DatabaseFamily::Postgresql => 5432,
            DatabaseFamily::Mysql => 3306,
        }
    }

    pub fn default_tls_mode(self) -> &'static str {
        match self {
            DatabaseFamily::Postgresql => "prefer",
            DatabaseFamily::Mysql => "required",
        }
    }

    /// 各类型驱动接受的 TLS 模式取值
    pub fn tls_modes(self) -> &'static [&'static str] {
        match self {
            DatabaseFamily::Postgresql => &[
                "disable",
                "allow",
                "prefer",
                "require",
                "verify-ca",
                "verify-full",
            ],
            DatabaseFamily::Mysql => &[
                "disabled",
                "preferred",
                "required",
                "verify_ca",
                "verify_identity",
            ],
        }
    }

    /// URL scheme（用于脱敏连接串）
    pub fn scheme(self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for DatabaseFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "postgresql" | "postgres" | "pg" => Ok(DatabaseFamily::Postgresql),
            "mysql" => Ok(DatabaseFamily::Mysql),
            other => Err(format!(
                "Unsupported database family: {other}. Supported: postgresql, mysql"
            )),
        }
    }
}
