//! Wire protocol types for proxy-worker and master-child communication.
//!
//! Two channels:
//! - **Worker socket** (one per worker, to the proxy): Task, Ready, Reply, Idle
//! - **Control channel** (child stdin, from the master): Shutdown

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio_util::bytes::Bytes;

use crate::config::GroupId;

/// Proxy-assigned id of one dispatched envelope.
pub type TaskId = u64;

/// Unique identifier for a connected worker.
///
/// Outlives the worker's (group, index) position: a respawned worker at the
/// same position gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(uuid::Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which client connection a task came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub conn_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<SocketAddr>,
}

impl ClientInfo {
    pub fn new(conn_id: u64, addr: Option<SocketAddr>) -> Self {
        Self { conn_id, addr }
    }
}

/// Messages from proxy to worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyMessage {
    /// One raw envelope, exactly as read from the client.
    Task {
        task_id: TaskId,
        client: ClientInfo,
        #[serde(with = "base64_bytes")]
        payload: Bytes,
    },
}

/// Messages from worker to proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// First message on a new connection.
    Ready {
        worker: WorkerId,
        group: GroupId,
        index: usize,
        pid: u32,
    },

    /// One packed envelope for the task's client. Zero or more per task.
    Reply {
        task_id: TaskId,
        #[serde(with = "base64_bytes")]
        payload: Bytes,
    },

    /// Task finished; the worker can take the next one.
    Idle { task_id: TaskId },
}

/// Messages from master to a child process on its stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Stop taking new work, finish what is in flight, then exit.
    Shutdown,
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};
    use tokio_util::bytes::Bytes;

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
