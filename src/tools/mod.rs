//! 连接工具箱：凭据模型与校验、查询防护、基于 Worker 的数据库操作

pub mod connection;
pub mod descriptor;
pub mod validation;

pub use connection::{ConnectionTestOutcome, ConnectionTools, ToolFailure, ToolRun};
pub use descriptor::{ConnectionDescriptor, CredentialInput, DescriptorSummary, PortValue};
pub use validation::{
    build_descriptor, validate_credentials, validate_query, FieldError, QueryRejection,
    ValidationReport,
};
