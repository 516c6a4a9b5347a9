//! Credential stores

use super::{CredentialStore, Secret};
use crate::storage::JsonStore;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// 설정 파일명
pub const CREDENTIALS_FILE: &str = "credentials.json";

/// In-memory credential store
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    secrets: RwLock<HashMap<String, Secret>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(self, id: impl Into<String>, secret: Secret) -> Self {
        self.insert(id, secret);
        self
    }

    pub fn insert(&self, id: impl Into<String>, secret: Secret) {
        self.secrets.write().insert(id.into(), secret);
    }

    pub fn remove(&self, id: &str) -> Option<Secret> {
        self.secrets.write().remove(id)
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn fetch(&self, id: &str) -> Result<Secret> {
        self.secrets
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::credential(id, "not found"))
    }
}

/// Credential store backed by `credentials.json` in a `JsonStore`
#[derive(Debug)]
pub struct JsonCredentialStore {
    inner: MemoryCredentialStore,
}

impl JsonCredentialStore {
    /// 파일에서 로드 (파일이 없으면 빈 저장소)
    pub fn load(store: &JsonStore) -> Result<Self> {
        let secrets: HashMap<String, Secret> =
            store.load_optional(CREDENTIALS_FILE)?.unwrap_or_default();
        let inner = MemoryCredentialStore::new();
        for (id, secret) in secrets {
            inner.insert(id, secret);
        }
        Ok(Self { inner })
    }

    pub fn len(&self) -> usize {
        self.inner.secrets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CredentialStore for JsonCredentialStore {
    async fn fetch(&self, id: &str) -> Result<Secret> {
        self.inner.fetch(id).await
    }
}
