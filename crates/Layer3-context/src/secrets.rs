//! Per-operation secret files
//!
//! Vault passwords and similar file credentials are written into a fresh
//! directory under the working tree for one operation and removed when the
//! operation ends.

use dockhand_foundation::{sanitize_component, CredentialStore, Error, Result, Secret};
use dockhand_pool::{Container, Lease};
use std::collections::HashSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::files::{make_dir, remove_path, write_file};

/// Directory under the working tree holding per-operation secret dirs
pub const SECRETS_DIR: &str = ".dockhand-secrets";

/// One written secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretFile {
    pub credential_id: String,
    pub path: String,
}

/// Secret files of one operation
#[derive(Debug, Default)]
pub struct SecretFiles {
    dir: Option<String>,
    files: Vec<SecretFile>,
}

fn file_material(id: &str, secret: &Secret) -> Result<(String, Vec<u8>)> {
    match secret {
        Secret::File { file_name, content } => Ok((file_name.clone(), content.as_bytes().to_vec())),
        Secret::Text { value } => Ok((format!("{}.txt", id), value.as_bytes().to_vec())),
        Secret::SshKey { .. } => Err(Error::credential(
            id,
            "ssh keys are loaded into the agent, not written as files",
        )),
    }
}

impl SecretFiles {
    /// Fetch every credential first, then write them all. Nothing is left
    /// behind when any step fails.
    pub async fn write(
        container: &Lease<Container>,
        workdir: &str,
        store: &dyn CredentialStore,
        credential_ids: &[String],
    ) -> Result<Self> {
        if credential_ids.is_empty() {
            return Ok(Self::default());
        }

        let mut materials = Vec::with_capacity(credential_ids.len());
        for id in credential_ids {
            let secret = store.fetch(id).await?;
            materials.push((id.clone(), file_material(id, &secret)?));
        }

        let dir = format!("{}/{}/{}", workdir, SECRETS_DIR, Uuid::new_v4().simple());
        make_dir(container, &dir, true).await?;
        let mut written = Self {
            dir: Some(dir.clone()),
            files: Vec::with_capacity(materials.len()),
        };

        let mut names = HashSet::new();
        for (index, (id, (name, content))) in materials.into_iter().enumerate() {
            let mut name = sanitize_component(&name);
            if !names.insert(name.clone()) {
                name = format!("{}-{}", index, name);
                names.insert(name.clone());
            }
            let path = format!("{}/{}", dir, name);
            if let Err(e) = write_file(container, &path, &content, true).await {
                written.remove(container).await;
                return Err(Error::credential(id, format!("cannot write secret file: {}", e)));
            }
            debug!("Wrote secret {} to {}", id, path);
            written.files.push(SecretFile {
                credential_id: id,
                path,
            });
        }

        Ok(written)
    }

    pub fn dir(&self) -> Option<&str> {
        self.dir.as_deref()
    }

    pub fn files(&self) -> &[SecretFile] {
        &self.files
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Delete the directory; failures are logged
    pub async fn remove(&mut self, container: &Lease<Container>) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = remove_path(container, &dir).await {
                warn!("Failed to remove secret directory {}: {}", dir, e);
            }
        }
        self.files.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockhand_foundation::{DockhandConfig, MemoryCredentialStore};
    use dockhand_pool::{ContainerOptions, PoolManager, SimulatedHost};
    use std::sync::Arc;

    async fn container() -> (Arc<SimulatedHost>, Lease<Container>) {
        let host = Arc::new(SimulatedHost::new());
        let manager = PoolManager::new(DockhandConfig::default());
        let lease = manager
            .acquire_container(&host.node("node1"), "ansible:latest", ContainerOptions::new())
            .await
            .unwrap();
        (host, lease)
    }

    fn store() -> MemoryCredentialStore {
        MemoryCredentialStore::new()
            .with_secret("vault-prod", Secret::file("prod.vault", "s3cret"))
            .with_secret("vault-text", Secret::text("hunter2"))
            .with_secret("deploy-key", Secret::ssh_key("KEY"))
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_write_and_remove() {
        let (host, lease) = container().await;
        let mut files = SecretFiles::write(&lease, "/ws/infra/v1", &store(), &ids(&["vault-prod", "vault-text"]))
            .await
            .unwrap();

        let paths = files.paths();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].starts_with("/ws/infra/v1/.dockhand-secrets/"));
        assert!(paths[0].ends_with("/prod.vault"));
        assert_eq!(host.container_file(lease.id(), &paths[0]).as_deref(), Some("s3cret"));
        assert_eq!(host.container_file(lease.id(), &paths[1]).as_deref(), Some("hunter2"));

        // content went through stdin under umask 077
        let write = host.last_call_matching("cat >").unwrap();
        assert!(write.contains("umask 077"));
        assert!(!write.contains("hunter2"));

        files.remove(&lease).await;
        assert!(host
            .container_files_under(lease.id(), "/ws/infra/v1/.dockhand-secrets")
            .is_empty());
    }

    #[tokio::test]
    async fn test_ssh_key_or_unknown_id_writes_nothing() {
        let (host, lease) = container().await;

        let err = SecretFiles::write(&lease, "/ws", &store(), &ids(&["vault-prod", "deploy-key"]))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Credential { .. }));

        let err = SecretFiles::write(&lease, "/ws", &store(), &ids(&["nope"]))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Credential { .. }));

        assert_eq!(host.count_calls("cat >"), 0);
    }

    #[tokio::test]
    async fn test_failed_write_cleans_up() {
        let (host, lease) = container().await;
        host.fail_next("cat >");

        let err = SecretFiles::write(&lease, "/ws", &store(), &ids(&["vault-prod"]))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Credential { .. }));
        assert!(host.last_call_matching("rm -rf /ws/.dockhand-secrets/").is_some());
    }
}
