//! Dockhand Config - 통합 설정
//!
//! 글로벌 설정과 프로젝트 설정을 병합하여 사용

use crate::storage::JsonStore;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 설정 파일명
pub const DOCKHAND_CONFIG_FILE: &str = "config.json";

// ============================================================================
// Dockhand Config (통합)
// ============================================================================

/// dockhand 통합 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockhandConfig {
    /// 외부 명령 기본 타임아웃 (초)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Docker 설정
    #[serde(default)]
    pub docker: DockerSettings,

    /// ssh-agent 설정
    #[serde(default)]
    pub agent: AgentSettings,

    /// 실행 컨텍스트 설정
    #[serde(default)]
    pub context: ContextSettings,

    /// 고아 리소스 탐색 설정
    #[serde(default)]
    pub discovery: DiscoverySettings,
}

impl Default for DockhandConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout(),
            docker: DockerSettings::default(),
            agent: AgentSettings::default(),
            context: ContextSettings::default(),
            discovery: DiscoverySettings::default(),
        }
    }
}

impl DockhandConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Load / Save
    // ========================================================================

    /// 글로벌 + 프로젝트 병합 로드
    pub fn load() -> Result<Self> {
        let mut config = Self::new();

        // 1. 글로벌 설정
        if let Ok(global) = JsonStore::global() {
            if let Some(global_config) = global.load_optional::<DockhandConfig>(DOCKHAND_CONFIG_FILE)? {
                config.merge(global_config);
            }
        }

        // 2. 프로젝트 설정
        if let Ok(project) = JsonStore::current_project() {
            if let Some(project_config) =
                project.load_optional::<DockhandConfig>(DOCKHAND_CONFIG_FILE)?
            {
                config.merge(project_config);
            }
        }

        Ok(config)
    }

    /// 특정 저장소에서 로드
    pub fn load_from(store: &JsonStore) -> Result<Self> {
        let mut config = Self::new();
        if let Some(loaded) = store.load_optional::<DockhandConfig>(DOCKHAND_CONFIG_FILE)? {
            config.merge(loaded);
        }
        Ok(config)
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// 다른 설정과 병합 (other가 우선)
    pub fn merge(&mut self, other: DockhandConfig) {
        if other.command_timeout_secs != default_command_timeout() && other.command_timeout_secs != 0
        {
            self.command_timeout_secs = other.command_timeout_secs;
        }
        self.docker.merge(other.docker);
        self.agent.merge(other.agent);
        self.context.merge(other.context);
        self.discovery.merge(other.discovery);
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }
}

// ============================================================================
// Docker Settings
// ============================================================================

/// Docker 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerSettings {
    /// docker 실행 파일
    #[serde(default = "default_docker_binary")]
    pub binary: String,

    /// 기본 이미지
    #[serde(default = "default_image")]
    pub default_image: String,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            binary: default_docker_binary(),
            default_image: default_image(),
        }
    }
}

impl DockerSettings {
    fn merge(&mut self, other: DockerSettings) {
        if other.binary != default_docker_binary() {
            self.binary = other.binary;
        }
        if other.default_image != default_image() {
            self.default_image = other.default_image;
        }
    }
}

// ============================================================================
// Agent Settings
// ============================================================================

/// ssh-agent 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSettings {
    /// 노드별 소켓 디렉토리의 상위 경로
    #[serde(default = "default_agent_root")]
    pub root_dir: PathBuf,

    /// ssh-agent 실행 파일
    #[serde(default = "default_agent_binary")]
    pub agent_binary: String,

    /// ssh-add 실행 파일
    #[serde(default = "default_add_binary")]
    pub add_binary: String,

    /// 키 수명 (초)
    #[serde(default = "default_key_lifetime")]
    pub key_lifetime_secs: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            root_dir: default_agent_root(),
            agent_binary: default_agent_binary(),
            add_binary: default_add_binary(),
            key_lifetime_secs: default_key_lifetime(),
        }
    }
}

impl AgentSettings {
    fn merge(&mut self, other: AgentSettings) {
        if other.root_dir != default_agent_root() {
            self.root_dir = other.root_dir;
        }
        if other.agent_binary != default_agent_binary() {
            self.agent_binary = other.agent_binary;
        }
        if other.add_binary != default_add_binary() {
            self.add_binary = other.add_binary;
        }
        if other.key_lifetime_secs != default_key_lifetime() {
            self.key_lifetime_secs = other.key_lifetime_secs;
        }
    }

    /// 노드 전용 소켓 디렉토리
    pub fn node_dir(&self, node: &str) -> PathBuf {
        self.root_dir.join(sanitize_component(node))
    }

    pub fn key_lifetime(&self) -> Duration {
        Duration::from_secs(self.key_lifetime_secs)
    }
}

// ============================================================================
// Context Settings
// ============================================================================

/// 실행 컨텍스트 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSettings {
    /// 컨테이너 내부 작업 디렉토리 루트
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,

    /// git 실행 파일 (컨테이너 내부)
    #[serde(default = "default_git_binary")]
    pub git_binary: String,

    /// 마지막 사용 후에도 리소스 유지
    #[serde(default)]
    pub keep_alive: bool,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            git_binary: default_git_binary(),
            keep_alive: false,
        }
    }
}

impl ContextSettings {
    fn merge(&mut self, other: ContextSettings) {
        if other.workspace_root != default_workspace_root() {
            self.workspace_root = other.workspace_root;
        }
        if other.git_binary != default_git_binary() {
            self.git_binary = other.git_binary;
        }
        self.keep_alive = self.keep_alive || other.keep_alive;
    }
}

// ============================================================================
// Discovery Settings
// ============================================================================

/// 고아 리소스 탐색 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverySettings {
    /// 노드 연결 후 대기 시간 (초)
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,

    /// 탐색 활성화
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            settle_delay_secs: default_settle_delay(),
            enabled: true,
        }
    }
}

impl DiscoverySettings {
    fn merge(&mut self, other: DiscoverySettings) {
        if other.settle_delay_secs != default_settle_delay() {
            self.settle_delay_secs = other.settle_delay_secs;
        }
        self.enabled = other.enabled;
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }
}

// ============================================================================
// Defaults
// ============================================================================

fn default_true() -> bool {
    true
}

fn default_command_timeout() -> u64 {
    120
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "ubuntu:22.04".to_string()
}

fn default_agent_root() -> PathBuf {
    std::env::temp_dir().join("dockhand-agents")
}

fn default_agent_binary() -> String {
    "ssh-agent".to_string()
}

fn default_add_binary() -> String {
    "ssh-add".to_string()
}

fn default_key_lifetime() -> u64 {
    3600
}

fn default_workspace_root() -> String {
    "/var/lib/dockhand/workspace".to_string()
}

fn default_git_binary() -> String {
    "git".to_string()
}

fn default_settle_delay() -> u64 {
    5
}

/// 경로 구성 요소로 안전한 문자열로 변환
///
/// 결과는 항상 단일 구성 요소이며 `.` / `..` 이 될 수 없다.
pub fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        "_".repeat(cleaned.len().max(1))
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = DockhandConfig::new();
        assert_eq!(config.command_timeout_secs, 120);
        assert_eq!(config.docker.binary, "docker");
        assert_eq!(config.agent.key_lifetime(), Duration::from_secs(3600));
        assert!(config.discovery.enabled);
        assert!(!config.context.keep_alive);
    }

    #[test]
    fn test_merge_prefers_explicit_values() {
        let mut base = DockhandConfig::new();
        base.docker.default_image = "alpine:3.19".to_string();

        let mut other = DockhandConfig::new();
        other.agent.key_lifetime_secs = 600;
        other.command_timeout_secs = 30;

        base.merge(other);

        // other의 image가 기본값이므로 base 유지
        assert_eq!(base.docker.default_image, "alpine:3.19");
        assert_eq!(base.agent.key_lifetime_secs, 600);
        assert_eq!(base.command_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_from_partial_file() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(DOCKHAND_CONFIG_FILE),
            r#"{ "docker": { "defaultImage": "willhallonline/ansible:latest" }, "discovery": { "settleDelaySecs": 1 } }"#,
        )
        .unwrap();

        let config = DockhandConfig::load_from(&JsonStore::new(dir.path())).unwrap();
        assert_eq!(config.docker.default_image, "willhallonline/ansible:latest");
        assert_eq!(config.docker.binary, "docker");
        assert_eq!(config.discovery.settle_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_node_dir_is_sanitized() {
        let settings = AgentSettings {
            root_dir: PathBuf::from("/tmp/agents"),
            ..Default::default()
        };
        assert_eq!(settings.node_dir("build node/1"), PathBuf::from("/tmp/agents/build_node_1"));
    }

    #[test]
    fn test_sanitize_component_rejects_dot_names() {
        assert_eq!(sanitize_component(".."), "__");
        assert_eq!(sanitize_component(""), "_");
        assert_eq!(sanitize_component("v1.2"), "v1.2");
        assert_eq!(sanitize_component("../etc"), ".._etc");
    }
}
