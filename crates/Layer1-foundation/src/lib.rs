//! # dockhand-foundation
//!
//! Foundation layer for dockhand:
//! - Error: 중앙 에러 타입
//! - Config: 통합 설정 (DockhandConfig, 대상 환경 카탈로그)
//! - Storage: JsonStore (범용)
//! - Process: 외부 명령 실행 (CommandRunner)
//! - Credential: 자격 증명 소스
//! - Node: 워커 노드 핸들
//!
//! ## 아키텍처
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Resource pools / execution contexts (upper layers)     │
//! │                     │                                   │
//! │          ┌─────────┴─────────┐                         │
//! │          ▼                   ▼                         │
//! │     Node (name)        CredentialStore                 │
//! │          │                                              │
//! │          ▼                                              │
//! │   CommandRunner (local, simulated, ...)                 │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod credential;
pub mod error;
pub mod node;
pub mod process;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{
    AgentSettings, ContextSettings, DiscoverySettings, DockerSettings, DockhandConfig,
    EnvironmentCatalog, TargetEnvironment, sanitize_component, DOCKHAND_CONFIG_FILE,
    ENVIRONMENTS_FILE,
};

// ============================================================================
// Storage (저장소)
// ============================================================================
pub use storage::JsonStore;

// ============================================================================
// Process (외부 명령)
// ============================================================================
pub use process::{CommandOutput, CommandRunner, CommandSpec, LocalCommandRunner, LocalRunnerConfig};

// ============================================================================
// Credential (자격 증명)
// ============================================================================
pub use credential::{
    CredentialStore, JsonCredentialStore, MemoryCredentialStore, Secret, CREDENTIALS_FILE,
};

// ============================================================================
// Node
// ============================================================================
pub use node::Node;
