//! Target environments - 플레이북 실행 대상 환경 카탈로그
//!
//! 환경마다 인벤토리와 필요한 자격 증명(SSH 키, vault 비밀번호)이 다르다.
//! 접근 제어 규칙은 이 카탈로그 밖에서 평가된다.

use crate::storage::JsonStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 설정 파일명
pub const ENVIRONMENTS_FILE: &str = "environments.json";

/// A named deployment target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetEnvironment {
    /// Environment name referenced by pipeline steps
    pub name: String,

    /// Inventory path, relative to the checkout
    pub inventory: String,

    /// SSH private key credentials loaded into the agent
    #[serde(default)]
    pub ssh_credentials: Vec<String>,

    /// Vault password credentials written as secret files
    #[serde(default)]
    pub vault_credentials: Vec<String>,

    /// Extra variables passed to every command
    #[serde(default)]
    pub extra_vars: BTreeMap<String, String>,

    /// Remote user override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_user: Option<String>,
}

impl TargetEnvironment {
    pub fn new(name: impl Into<String>, inventory: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inventory: inventory.into(),
            ssh_credentials: Vec::new(),
            vault_credentials: Vec::new(),
            extra_vars: BTreeMap::new(),
            remote_user: None,
        }
    }

    pub fn with_ssh_credential(mut self, id: impl Into<String>) -> Self {
        self.ssh_credentials.push(id.into());
        self
    }

    pub fn with_vault_credential(mut self, id: impl Into<String>) -> Self {
        self.vault_credentials.push(id.into());
        self
    }

    pub fn with_extra_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_vars.insert(key.into(), value.into());
        self
    }
}

/// Catalog of target environments
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentCatalog {
    #[serde(default)]
    pub environments: Vec<TargetEnvironment>,
}

impl EnvironmentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 글로벌 + 프로젝트 병합 로드 (프로젝트가 같은 이름을 덮어씀)
    pub fn load() -> Result<Self> {
        let mut catalog = Self::new();
        if let Ok(global) = JsonStore::global() {
            catalog.extend(Self::load_from(&global)?);
        }
        if let Ok(project) = JsonStore::current_project() {
            catalog.extend(Self::load_from(&project)?);
        }
        Ok(catalog)
    }

    pub fn load_from(store: &JsonStore) -> Result<Self> {
        Ok(store
            .load_optional::<EnvironmentCatalog>(ENVIRONMENTS_FILE)?
            .unwrap_or_default())
    }

    /// 환경 추가 (같은 이름은 교체)
    pub fn insert(&mut self, environment: TargetEnvironment) {
        self.environments.retain(|e| e.name != environment.name);
        self.environments.push(environment);
    }

    pub fn extend(&mut self, other: EnvironmentCatalog) {
        for environment in other.environments {
            self.insert(environment);
        }
    }

    /// 이름으로 조회
    pub fn get(&self, name: &str) -> Result<&TargetEnvironment> {
        self.environments
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| Error::NotFound(format!("target environment '{}'", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        self.environments.iter().map(|e| e.name.as_str()).collect()
    }
}
