//! Pool keys

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a pooled resource: the node it lives on plus a
/// resource-type-specific identity (image name, `ssh-agent`, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    node: String,
    identity: String,
}

impl ResourceKey {
    pub fn new(node: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            identity: identity.into(),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_equal_keys_hash_together() {
        let mut keys = HashSet::new();
        keys.insert(ResourceKey::new("node1", "ubuntu:22.04"));
        keys.insert(ResourceKey::new("node1", "ubuntu:22.04"));
        keys.insert(ResourceKey::new("node2", "ubuntu:22.04"));
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ResourceKey::new("node1", "ubuntu:22.04").to_string(),
            "node1/ubuntu:22.04"
        );
    }
}
