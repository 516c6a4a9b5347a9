//! Management tag schema
//!
//! Every container a pool creates carries these four labels. Orphan
//! discovery filters on the exact keys and values, so changing any of them
//! breaks recovery of resources created by an older process.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Marks a resource as created by dockhand
pub const LABEL_MANAGED: &str = "io.dockhand.managed";

/// Resource identity (the image name for containers)
pub const LABEL_IMAGE: &str = "io.dockhand.image";

/// Node the resource belongs to
pub const LABEL_NODE: &str = "io.dockhand.node";

/// RFC 3339 creation timestamp
pub const LABEL_CREATED: &str = "io.dockhand.created";

/// Value of [`LABEL_MANAGED`]
pub const MANAGED_VALUE: &str = "true";

/// Parsed management tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagementTags {
    pub identity: String,
    pub node: String,
    pub created_at: DateTime<Utc>,
}

impl ManagementTags {
    pub fn new(identity: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            node: node.into(),
            created_at: Utc::now(),
        }
    }

    pub fn to_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED.to_string(), MANAGED_VALUE.to_string());
        labels.insert(LABEL_IMAGE.to_string(), self.identity.clone());
        labels.insert(LABEL_NODE.to_string(), self.node.clone());
        labels.insert(LABEL_CREATED.to_string(), self.created_at.to_rfc3339());
        labels
    }

    /// `None` unless the managed marker, identity and node are all present.
    /// A missing or unparsable timestamp falls back to the epoch.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Option<Self> {
        if labels.get(LABEL_MANAGED).map(String::as_str) != Some(MANAGED_VALUE) {
            return None;
        }
        let identity = labels.get(LABEL_IMAGE)?.clone();
        let node = labels.get(LABEL_NODE)?.clone();
        let created_at = labels
            .get(LABEL_CREATED)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Some(Self {
            identity,
            node,
            created_at,
        })
    }
}

/// Parse docker's `{{.Labels}}` rendering: `k1=v1,k2=v2`
pub fn parse_label_list(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                None
            } else {
                Some((key.to_string(), value.trim().to_string()))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_roundtrip_through_docker_rendering() {
        let tags = ManagementTags::new("registry.local/ansible:2.16", "node1");
        let rendered = tags
            .to_labels()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");

        let parsed = ManagementTags::from_labels(&parse_label_list(&rendered)).unwrap();
        assert_eq!(parsed.identity, "registry.local/ansible:2.16");
        assert_eq!(parsed.node, "node1");
    }

    #[test]
    fn test_unmanaged_labels_are_rejected() {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_IMAGE.to_string(), "ubuntu".to_string());
        labels.insert(LABEL_NODE.to_string(), "node1".to_string());
        assert!(ManagementTags::from_labels(&labels).is_none());

        labels.insert(LABEL_MANAGED.to_string(), "false".to_string());
        assert!(ManagementTags::from_labels(&labels).is_none());
    }

    #[test]
    fn test_missing_timestamp_falls_back_to_epoch() {
        let labels = parse_label_list(&format!(
            "{}=true,{}=ubuntu,{}=node1",
            LABEL_MANAGED, LABEL_IMAGE, LABEL_NODE
        ));
        let tags = ManagementTags::from_labels(&labels).unwrap();
        assert_eq!(tags.created_at, DateTime::<Utc>::UNIX_EPOCH);
    }
}
