//! Credential source
//!
//! Secrets are fetched on demand by id. The material is handed to external
//! commands through stdin only and is redacted from every `Debug` output.

mod store;

pub use store::{JsonCredentialStore, MemoryCredentialStore, CREDENTIALS_FILE};

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Secret material behind a credential id
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Secret {
    /// SSH private key
    #[serde(rename_all = "camelCase")]
    SshKey {
        #[serde(default)]
        username: Option<String>,
        private_key: String,
        #[serde(default)]
        passphrase: Option<String>,
    },

    /// Opaque secret file (vault password file, etc.)
    #[serde(rename_all = "camelCase")]
    File { file_name: String, content: String },

    /// Secret text
    Text { value: String },
}

impl Secret {
    pub fn ssh_key(private_key: impl Into<String>) -> Self {
        Self::SshKey {
            username: None,
            private_key: private_key.into(),
            passphrase: None,
        }
    }

    pub fn file(file_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::File {
            file_name: file_name.into(),
            content: content.into(),
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::Text {
            value: value.into(),
        }
    }

    /// Kind name for logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SshKey { .. } => "ssh-key",
            Self::File { .. } => "file",
            Self::Text { .. } => "text",
        }
    }

    /// Raw bytes to pipe into the consuming command
    pub fn material(&self) -> &[u8] {
        match self {
            Self::SshKey { private_key, .. } => private_key.as_bytes(),
            Self::File { content, .. } => content.as_bytes(),
            Self::Text { value } => value.as_bytes(),
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SshKey { username, .. } => f
                .debug_struct("SshKey")
                .field("username", username)
                .field("private_key", &"<redacted>")
                .finish(),
            Self::File { file_name, .. } => f
                .debug_struct("File")
                .field("file_name", file_name)
                .field("content", &"<redacted>")
                .finish(),
            Self::Text { .. } => f.debug_struct("Text").field("value", &"<redacted>").finish(),
        }
    }
}

/// Credential source trait
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fetch the secret for `id`; unknown ids are a credential error
    async fn fetch(&self, id: &str) -> Result<Secret>;
}
