//! 配置模块
//!
//! 环境变量解析与后端部署配置

pub mod backend;
pub mod env;

pub use backend::{BackendConfig, BackendConfigs, ContainerBackendConfig, ProcessBackendConfig};
pub use env::OrchestratorConfig;
