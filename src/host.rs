//! Host metadata attached to envelopes and shipments

use crate::config::Tags;
use serde::{Deserialize, Serialize};

/// Host identity as it appears in every envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Host {
    pub name: String,
    pub tags: Tags,
}

/// Supplies host metadata
pub trait HostInfo: Send + Sync {
    fn host(&self) -> Host;
}

/// Host info read from the OS hostname
#[derive(Debug, Clone, Default)]
pub struct SystemHost {
    tags: Tags,
}

impl SystemHost {
    pub fn new(tags: Tags) -> Self {
        Self { tags }
    }
}

impl HostInfo for SystemHost {
    fn host(&self) -> Host {
        let name = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        Host {
            name,
            tags: self.tags.clone(),
        }
    }
}

/// Fixed host info, used when the hostname must not depend on the machine
#[derive(Debug, Clone)]
pub struct StaticHost(pub Host);

impl StaticHost {
    pub fn new(name: &str, tags: Tags) -> Self {
        Self(Host {
            name: name.to_string(),
            tags,
        })
    }
}

impl HostInfo for StaticHost {
    fn host(&self) -> Host {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_serializes_pascal_case() {
        let mut tags = Tags::new();
        tags.insert("env".to_string(), "prod".to_string());
        let host = StaticHost::new("h1", tags).host();

        let json = serde_json::to_value(&host).unwrap();
        assert_eq!(json, serde_json::json!({"Name": "h1", "Tags": {"env": "prod"}}));
    }

    #[test]
    fn test_system_host_has_name() {
        let host = SystemHost::default().host();
        assert!(!host.name.is_empty());
    }
}
