//! dockhand-pool: 외부 리소스 풀
//!
//! Layer2 - 참조 카운트 기반 리소스 수명 관리
//!
//! # 주요 모듈
//!
//! - `pool`: 범용 참조 카운트 풀 (`ResourcePool` + `ResourceLifecycle`)
//! - `container`: 장기 실행 Docker 컨테이너
//! - `ssh_agent`: 노드별 ssh-agent 싱글톤과 키 참조 카운트
//! - `labels`: 관리 태그 스키마 (discovery와의 계약)
//! - `commands`: docker / ssh-agent / 프로세스 명령 직렬화
//! - `discovery`: 재시작 후 고아 리소스 회수
//! - `manager`: 프로세스 단위 풀 관리자
//! - `simulate`: 테스트 및 `--simulate`용 가상 호스트
//!
//! # 사용 예시
//!
//! ```ignore
//! use dockhand_pool::{ContainerOptions, PoolManager};
//!
//! let manager = Arc::new(PoolManager::new(DockhandConfig::load()?));
//! let node = Node::local("node1");
//!
//! let container = manager
//!     .acquire_container(&node, "ubuntu:22.04", ContainerOptions::new())
//!     .await?;
//! container.execute(&["uname".into(), "-a".into()], &ExecOptions::new()).await?;
//! manager.release_container(&container, false).await;
//! ```

pub mod commands;
pub mod container;
pub mod discovery;
pub mod key;
pub mod labels;
pub mod manager;
pub mod pool;
pub mod simulate;
pub mod ssh_agent;

// Re-exports: Pool
pub use key::ResourceKey;
pub use pool::{Adoption, Lease, LeaseGuard, PoolEntrySummary, Pooled, ResourceLifecycle, ResourcePool};

// Re-exports: Resources
pub use container::{
    Container, ContainerLifecycle, ContainerOptions, ContainerSpec, ExecOptions, KILLED_EXIT_CODE,
};
pub use ssh_agent::{agent_key, AgentSpec, SshAgent, SshAgentLifecycle, AGENT_IDENTITY};

// Re-exports: Commands / Labels
pub use commands::{AgentCommands, BindMount, DockerCommands, ProcessCommands};
pub use labels::{
    ManagementTags, LABEL_CREATED, LABEL_IMAGE, LABEL_MANAGED, LABEL_NODE, MANAGED_VALUE,
};

// Re-exports: Discovery / Manager
pub use discovery::{DiscoveryReport, NodeConnectListener, OrphanDiscovery};
pub use manager::PoolManager;
pub use simulate::{test_private_key, SimulatedHost};
