//! Process role, read once at startup from the marker the master leaves in
//! each child's environment.

use serde::{Deserialize, Serialize};

use crate::bridge::transport::IpcAddress;
use crate::config::{GroupId, MasterConfig};

/// Environment variable carrying the JSON [`ChildMarker`].
pub const CHILD_ENV: &str = "BOXLET_CHILD";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessRole {
    Master,
    Proxy,
    Worker { group: GroupId, index: usize },
}

impl ProcessRole {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Proxy => "proxy",
            Self::Worker { .. } => "worker",
        }
    }
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Worker { group, index } => write!(f, "worker[{}#{}]", group, index),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed BOXLET_CHILD marker: {0}")]
pub struct MarkerError(#[from] serde_json::Error);

/// Everything a child needs to know about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildMarker {
    pub role: ProcessRole,
    pub transport: IpcAddress,
    pub config: MasterConfig,
}

impl ChildMarker {
    pub fn encode(&self) -> Result<String, MarkerError> {
        Ok(serde_json::to_string(self)?)
    }

    /// `None` when the marker is absent, which makes this process the master.
    pub fn from_env() -> Result<Option<Self>, MarkerError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>, MarkerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup(CHILD_ENV) {
            Some(raw) if !raw.trim().is_empty() => Ok(Some(serde_json::from_str(&raw)?)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_marker_means_master() {
        assert_eq!(ChildMarker::from_lookup(|_| None).unwrap(), None);
        assert_eq!(
            ChildMarker::from_lookup(|_| Some(String::new())).unwrap(),
            None
        );
    }

    #[test]
    fn marker_roundtrips_through_env_value() {
        let marker = ChildMarker {
            role: ProcessRole::Worker {
                group: GroupId::from("b"),
                index: 0,
            },
            transport: IpcAddress::named("/tmp/boxlet-1/workers.sock"),
            config: MasterConfig::default(),
        };
        let raw = marker.encode().unwrap();
        let parsed = ChildMarker::from_lookup(|name| (name == CHILD_ENV).then(|| raw.clone()))
            .unwrap()
            .unwrap();
        assert_eq!(parsed, marker);
        assert_eq!(parsed.role.to_string(), "worker[b#0]");
    }

    #[test]
    fn role_serializes() {
        insta::assert_json_snapshot!(ProcessRole::Worker { group: GroupId::from("a"), index: 2 }, @r#"
        {
          "kind": "worker",
          "group": "a",
          "index": 2
        }
        "#);
    }

    #[test]
    fn garbage_marker_is_an_error() {
        let err = ChildMarker::from_lookup(|_| Some("{not json".to_string())).unwrap_err();
        assert!(err.to_string().starts_with("malformed BOXLET_CHILD marker"));
    }
}
