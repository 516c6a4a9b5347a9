//! Config - 통합 설정 관리
//!
//! - `dockhand.rs` - DockhandConfig 통합 설정
//! - `environment.rs` - 대상 환경 카탈로그

mod dockhand;
mod environment;

pub use dockhand::{
    AgentSettings, ContextSettings, DiscoverySettings, DockerSettings, DockhandConfig,
    sanitize_component, DOCKHAND_CONFIG_FILE,
};
pub use environment::{EnvironmentCatalog, TargetEnvironment, ENVIRONMENTS_FILE};
