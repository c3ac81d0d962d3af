//! Worker 注册表：数据库类型 → 启动命令
//!
//! 注册表在启动时由配置构建，之后只读；未注册的类型直接报 UnsupportedFamily。

use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::WorkersSection;
use crate::core::DatabaseFamily;

use super::WorkerError;

/// 启动一个 Worker 所需的命令行
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl WorkerSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct WorkerRegistry {
    specs: HashMap<DatabaseFamily, WorkerSpec>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 [workers.families] 构建；未知的类型名视为配置错误
    pub fn from_config(section: &WorkersSection) -> Result<Self, String> {
        let mut registry = Self::new();
        for (name, family_cfg) in &section.families {
            let family: DatabaseFamily = name.parse()?;
            registry.register(
                family,
                WorkerSpec {
                    program: family_cfg.program.clone(),
                    args: family_cfg.args.clone(),
                    env: family_cfg.env.clone(),
                },
            );
        }
        Ok(registry)
    }

    pub fn register(&mut self, family: DatabaseFamily, spec: WorkerSpec) {
        self.specs.insert(family, spec);
    }

    pub fn resolve(&self, family: DatabaseFamily) -> Result<&WorkerSpec, WorkerError> {
        self.specs
            .get(&family)
            .ok_or(WorkerError::UnsupportedFamily(family))
    }

    pub fn families(&self) -> Vec<DatabaseFamily> {
        let mut families: Vec<_> = self.specs.keys().copied().collect();
        families.sort_by_key(|f| f.as_str());
        families
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerFamilySection;

    #[test]
    fn test_from_config_accepts_aliases() {
        let mut section = WorkersSection::default();
        section.families.insert(
            "postgres".into(),
            WorkerFamilySection {
                program: PathBuf::from("/opt/pg-worker"),
                args: vec![],
                env: HashMap::new(),
            },
        );
        let registry = WorkerRegistry::from_config(&section).unwrap();
        assert_eq!(registry.families(), vec![DatabaseFamily::Postgresql]);
        assert_eq!(
            registry.resolve(DatabaseFamily::Postgresql).unwrap().program,
            PathBuf::from("/opt/pg-worker")
        );
        assert!(matches!(
            registry.resolve(DatabaseFamily::Mysql),
            Err(WorkerError::UnsupportedFamily(DatabaseFamily::Mysql))
        ));
    }

    #[test]
    fn test_from_config_rejects_unknown_family() {
        let mut section = WorkersSection::default();
        section
            .families
            .insert("oracle".into(), WorkerFamilySection::default());
        assert!(WorkerRegistry::from_config(&section).is_err());
    }
}
