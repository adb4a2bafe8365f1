//! Master configuration.
//!
//! Built in code with `with_*` methods or read from `BOXLET_*` environment
//! variables. The master serializes the validated config into each child's
//! role marker, so every process sees the same values.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::envelope::DEFAULT_MAX_FRAME;

/// Name of a worker group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for GroupId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for GroupId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerGroup {
    pub id: GroupId,
    pub workers: usize,
}

impl WorkerGroup {
    pub fn new(id: impl Into<GroupId>, workers: usize) -> Self {
        Self {
            id: id.into(),
            workers,
        }
    }
}

/// What the master does when a child exits without being asked to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RespawnPolicy {
    Never,
    #[default]
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    /// Tasks allowed to wait for a worker, per group.
    pub backlog: usize,
    pub drain_timeout: Duration,
    pub max_frame: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7700,
            backlog: 64,
            drain_timeout: Duration::from_secs(10),
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// `None` lets a handler run as long as it needs.
    pub task_timeout: Option<Duration>,
    pub connect_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            task_timeout: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminConfig {
    pub host: String,
    pub port: u16,
    pub token: String,
}

impl AdminConfig {
    pub fn new(port: u16, token: impl Into<String>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            token: token.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one worker group is required")]
    NoGroups,
    #[error("worker group '{0}' has no workers")]
    EmptyGroup(GroupId),
    #[error("worker group '{0}' is configured twice")]
    DuplicateGroup(GroupId),
    #[error("admin channel enabled without a token")]
    MissingAdminToken,
    #[error("invalid {name}={value:?}: {reason}")]
    InvalidVar {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterConfig {
    pub groups: Vec<WorkerGroup>,
    pub proxy: ProxyConfig,
    pub worker: WorkerConfig,
    pub admin: Option<AdminConfig>,
    pub stop_timeout: Duration,
    pub respawn: RespawnPolicy,
    pub respawn_delay: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            groups: vec![WorkerGroup::new("default", 1)],
            proxy: ProxyConfig::default(),
            worker: WorkerConfig::default(),
            admin: None,
            stop_timeout: Duration::from_secs(10),
            respawn: RespawnPolicy::default(),
            respawn_delay: Duration::from_secs(1),
        }
    }
}

impl MasterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_groups(mut self, groups: Vec<WorkerGroup>) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_listen(mut self, host: impl Into<String>, port: u16) -> Self {
        self.proxy.host = host.into();
        self.proxy.port = port;
        self
    }

    pub fn with_backlog(mut self, backlog: usize) -> Self {
        self.proxy.backlog = backlog;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.proxy.drain_timeout = timeout;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.worker.task_timeout = timeout;
        self
    }

    pub fn with_admin(mut self, admin: AdminConfig) -> Self {
        self.admin = Some(admin);
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_respawn(mut self, policy: RespawnPolicy) -> Self {
        self.respawn = policy;
        self
    }

    pub fn with_respawn_delay(mut self, delay: Duration) -> Self {
        self.respawn_delay = delay;
        self
    }

    pub fn group(&self, id: &GroupId) -> Option<&WorkerGroup> {
        self.groups.iter().find(|g| &g.id == id)
    }

    pub fn total_workers(&self) -> usize {
        self.groups.iter().map(|g| g.workers).sum()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.groups.is_empty() {
            return Err(ConfigError::NoGroups);
        }
        let mut seen = HashSet::new();
        for group in &self.groups {
            if group.workers == 0 {
                return Err(ConfigError::EmptyGroup(group.id.clone()));
            }
            if !seen.insert(&group.id) {
                return Err(ConfigError::DuplicateGroup(group.id.clone()));
            }
        }
        if let Some(admin) = &self.admin
            && admin.token.trim().is_empty()
        {
            return Err(ConfigError::MissingAdminToken);
        }
        Ok(())
    }

    /// Defaults overridden by `BOXLET_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("BOXLET_HOST") {
            config.proxy.host = host;
        }
        if let Some(port) = parse_var(&lookup, "BOXLET_PORT")? {
            config.proxy.port = port;
        }
        if let Some(groups) = lookup("BOXLET_GROUPS") {
            config.groups = parse_groups(&groups).map_err(|reason| ConfigError::InvalidVar {
                name: "BOXLET_GROUPS",
                value: groups.clone(),
                reason,
            })?;
        }
        if let Some(backlog) = parse_var(&lookup, "BOXLET_BACKLOG")? {
            config.proxy.backlog = backlog;
        }
        if let Some(secs) = parse_var::<f64, _>(&lookup, "BOXLET_STOP_TIMEOUT")? {
            config.stop_timeout = seconds("BOXLET_STOP_TIMEOUT", secs)?;
        }
        if let Some(secs) = parse_var::<f64, _>(&lookup, "BOXLET_TASK_TIMEOUT")? {
            config.worker.task_timeout = Some(seconds("BOXLET_TASK_TIMEOUT", secs)?);
        }
        if let Some(policy) = lookup("BOXLET_RESPAWN") {
            config.respawn = match policy.to_ascii_lowercase().as_str() {
                "always" => RespawnPolicy::Always,
                "never" => RespawnPolicy::Never,
                _ => {
                    return Err(ConfigError::InvalidVar {
                        name: "BOXLET_RESPAWN",
                        value: policy,
                        reason: "expected 'always' or 'never'".to_string(),
                    });
                }
            };
        }
        if let Some(port) = parse_var(&lookup, "BOXLET_ADMIN_PORT")? {
            let token = lookup("BOXLET_ADMIN_TOKEN").unwrap_or_default();
            config.admin = Some(AdminConfig::new(port, token));
        }

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(name) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::InvalidVar {
            name,
            value,
            reason: e.to_string(),
        })
}

fn seconds(name: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidVar {
        name,
        value: secs.to_string(),
        reason: e.to_string(),
    })
}

/// Parse `"a:2,b:1"`. A bare name means one worker.
pub fn parse_groups(spec: &str) -> Result<Vec<WorkerGroup>, String> {
    spec.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once(':') {
            Some((name, count)) => {
                let name = name.trim();
                if name.is_empty() {
                    return Err(format!("missing group name in '{}'", part));
                }
                let workers = count
                    .trim()
                    .parse::<usize>()
                    .map_err(|e| format!("bad worker count in '{}': {}", part, e))?;
                Ok(WorkerGroup::new(name, workers))
            }
            None => Ok(WorkerGroup::new(part, 1)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = MasterConfig::default();
        config.validate().unwrap();
        assert_eq!(config.respawn, RespawnPolicy::Always);
        assert_eq!(config.respawn_delay, Duration::from_secs(1));
        assert_eq!(config.stop_timeout, Duration::from_secs(10));
        assert_eq!(config.worker.task_timeout, None);
    }

    #[test]
    fn parse_groups_accepts_counts_and_bare_names() {
        assert_eq!(
            parse_groups("a:2, b:1,c").unwrap(),
            vec![
                WorkerGroup::new("a", 2),
                WorkerGroup::new("b", 1),
                WorkerGroup::new("c", 1)
            ]
        );
        assert!(parse_groups("a:two").is_err());
        assert!(parse_groups(":3").is_err());
    }

    #[test]
    fn from_lookup_reads_every_variable() {
        let config = MasterConfig::from_lookup(lookup(&[
            ("BOXLET_HOST", "0.0.0.0"),
            ("BOXLET_PORT", "9000"),
            ("BOXLET_GROUPS", "fast:3,slow:1"),
            ("BOXLET_BACKLOG", "5"),
            ("BOXLET_STOP_TIMEOUT", "2.5"),
            ("BOXLET_TASK_TIMEOUT", "30"),
            ("BOXLET_RESPAWN", "never"),
            ("BOXLET_ADMIN_PORT", "9001"),
            ("BOXLET_ADMIN_TOKEN", "s3cret"),
        ]))
        .unwrap();

        assert_eq!(config.proxy.host, "0.0.0.0");
        assert_eq!(config.proxy.port, 9000);
        assert_eq!(config.total_workers(), 4);
        assert_eq!(config.proxy.backlog, 5);
        assert_eq!(config.stop_timeout, Duration::from_millis(2500));
        assert_eq!(config.worker.task_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.respawn, RespawnPolicy::Never);
        assert_eq!(config.admin, Some(AdminConfig::new(9001, "s3cret")));
        config.validate().unwrap();
    }

    #[test]
    fn from_lookup_reports_bad_values() {
        let err = MasterConfig::from_lookup(lookup(&[("BOXLET_PORT", "http")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { name: "BOXLET_PORT", .. }));

        let err = MasterConfig::from_lookup(lookup(&[("BOXLET_RESPAWN", "sometimes")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { name: "BOXLET_RESPAWN", .. }));

        let err = MasterConfig::from_lookup(lookup(&[("BOXLET_STOP_TIMEOUT", "-1")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { name: "BOXLET_STOP_TIMEOUT", .. }));
    }

    #[test]
    fn validate_rejects_bad_groups() {
        let none = MasterConfig::new().with_groups(vec![]);
        assert_eq!(none.validate(), Err(ConfigError::NoGroups));

        let empty = MasterConfig::new().with_groups(vec![WorkerGroup::new("a", 0)]);
        assert_eq!(empty.validate(), Err(ConfigError::EmptyGroup(GroupId::from("a"))));

        let dup = MasterConfig::new()
            .with_groups(vec![WorkerGroup::new("a", 1), WorkerGroup::new("a", 2)]);
        assert_eq!(dup.validate(), Err(ConfigError::DuplicateGroup(GroupId::from("a"))));
    }

    #[test]
    fn admin_without_token_is_rejected() {
        let config = MasterConfig::from_lookup(lookup(&[("BOXLET_ADMIN_PORT", "9001")])).unwrap();
        assert_eq!(config.validate(), Err(ConfigError::MissingAdminToken));
    }

    #[test]
    fn config_survives_json() {
        let config = MasterConfig::new()
            .with_groups(vec![WorkerGroup::new("a", 2)])
            .with_task_timeout(Some(Duration::from_millis(1500)))
            .with_admin(AdminConfig::new(1, "t"));
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<MasterConfig>(&json).unwrap(), config);
    }
}
