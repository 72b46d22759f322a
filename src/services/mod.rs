//! 服务层模块
//!
//! 环境探测、部署后端、遥测与协调器

pub mod backend;
pub mod coordinator;
pub mod probe;
pub mod telemetry;

pub use backend::{BackendRegistry, ContainerBackend, DeploymentBackend, ProcessBackend};
pub use coordinator::Coordinator;
pub use probe::{EnvironmentDetector, EnvironmentProbe};
pub use telemetry::{AlertSubscriber, DeploymentTelemetry};
