//! Worker permit pool with typestate for compile-time state transition safety.
//!
//! One pool per worker group. Holding a permit means owning the only write
//! half to that worker, so a worker can never have two tasks outstanding.
//! Poisoning is a pool-level property: a poisoned worker is permanently
//! removed regardless of whether a task was active on it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::SinkExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::FramedWrite;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ProxyMessage, WorkerId};
use crate::config::GroupId;

pub type TaskWriter = FramedWrite<OwnedWriteHalf, JsonCodec<ProxyMessage>>;

struct PermitInner {
    worker: WorkerId,
    writer: TaskWriter,
    idle_flag: Arc<AtomicBool>,
    poisoned: Arc<AtomicBool>,
}

/// A permit with a task outstanding on its worker.
pub struct PermitInUse {
    worker: WorkerId,
    writer: Option<TaskWriter>,
    idle_flag: Arc<AtomicBool>,
    poisoned: Arc<AtomicBool>,
    pool_tx: mpsc::UnboundedSender<PermitInner>,
}

impl PermitInUse {
    fn new(inner: PermitInner, pool_tx: mpsc::UnboundedSender<PermitInner>) -> Self {
        inner.idle_flag.store(false, Ordering::Release);

        Self {
            worker: inner.worker,
            writer: Some(inner.writer),
            idle_flag: inner.idle_flag,
            poisoned: inner.poisoned,
            pool_tx,
        }
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Worker reported `Idle`: the permit returns to the pool on drop
    /// (unless the worker has been poisoned at the pool level).
    pub fn into_idle(mut self) -> PermitIdle {
        PermitIdle {
            worker: self.worker,
            writer: self.writer.take(),
            idle_flag: Arc::clone(&self.idle_flag),
            poisoned: Arc::clone(&self.poisoned),
            pool_tx: self.pool_tx.clone(),
        }
    }

    /// Worker is gone. The permit will NOT return to the pool, and the
    /// pool-level flag makes sure it is never handed out again.
    pub fn into_poisoned(mut self) -> PermitPoisoned {
        self.poisoned.store(true, Ordering::Release);
        PermitPoisoned {
            worker: self.worker,
            _writer: self.writer.take(),
        }
    }

    pub async fn send(&mut self, message: ProxyMessage) -> Result<(), PermitError> {
        let writer = self.writer.as_mut().ok_or(PermitError::Consumed)?;
        writer
            .send(message)
            .await
            .map_err(|e| PermitError::Send(e.to_string()))
    }
}

impl Drop for PermitInUse {
    fn drop(&mut self) {
        if self.writer.is_some() && !self.poisoned.load(Ordering::Acquire) {
            // Dispatch was abandoned mid-task; the worker's state is unknown.
            self.poisoned.store(true, Ordering::Release);
            tracing::error!(worker = %self.worker, "Permit dropped while in use, worker retired");
        }
    }
}

/// A permit whose worker finished its task. Returns to the pool on drop.
pub struct PermitIdle {
    worker: WorkerId,
    writer: Option<TaskWriter>,
    idle_flag: Arc<AtomicBool>,
    poisoned: Arc<AtomicBool>,
    pool_tx: mpsc::UnboundedSender<PermitInner>,
}

impl PermitIdle {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }
}

impl Drop for PermitIdle {
    fn drop(&mut self) {
        if self.poisoned.load(Ordering::Acquire) {
            tracing::warn!(worker = %self.worker, "Worker poisoned - not returning to pool");
            return;
        }

        if let Some(writer) = self.writer.take() {
            self.idle_flag.store(true, Ordering::Release);
            let inner = PermitInner {
                worker: self.worker,
                writer,
                idle_flag: Arc::clone(&self.idle_flag),
                poisoned: Arc::clone(&self.poisoned),
            };
            if self.pool_tx.send(inner).is_err() {
                tracing::debug!(worker = %self.worker, "Pool closed, dropping permit");
            }
        }
    }
}

/// Permit of a lost worker. Dropping it closes the write half.
pub struct PermitPoisoned {
    worker: WorkerId,
    _writer: Option<TaskWriter>,
}

impl PermitPoisoned {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }
}

impl Drop for PermitPoisoned {
    fn drop(&mut self) {
        tracing::warn!(worker = %self.worker, "Worker poisoned - group capacity reduced");
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PermitError {
    #[error("Permit already consumed")]
    Consumed,
    #[error("Failed to send on worker socket: {0}")]
    Send(String),
}

struct WorkerFlags {
    index: usize,
    idle: Arc<AtomicBool>,
    poisoned: Arc<AtomicBool>,
}

/// Snapshot of a pool for the admin channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct PoolOccupancy {
    pub workers: usize,
    pub idle: usize,
}

/// Pool of worker permits for one group.
///
/// Waiters are served in FIFO order: the receiver sits behind a fair
/// async mutex.
pub struct PermitPool {
    group: GroupId,
    available_rx: Mutex<mpsc::UnboundedReceiver<PermitInner>>,
    available_tx: mpsc::UnboundedSender<PermitInner>,
    workers: StdMutex<HashMap<WorkerId, WorkerFlags>>,
}

impl PermitPool {
    pub fn new(group: GroupId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        Self {
            group,
            available_rx: Mutex::new(rx),
            available_tx: tx,
            workers: StdMutex::new(HashMap::new()),
        }
    }

    pub fn group(&self) -> &GroupId {
        &self.group
    }

    /// Register a freshly connected worker as idle.
    pub fn add_permit(&self, worker: WorkerId, index: usize, writer: TaskWriter) {
        let idle = Arc::new(AtomicBool::new(true));
        let poisoned = Arc::new(AtomicBool::new(false));

        if let Ok(mut workers) = self.workers.lock() {
            // A respawned worker replaces whatever still sits at its index.
            workers.retain(|_, flags| {
                if flags.index == index {
                    flags.poisoned.store(true, Ordering::Release);
                    return false;
                }
                true
            });
            workers.insert(
                worker,
                WorkerFlags {
                    index,
                    idle: Arc::clone(&idle),
                    poisoned: Arc::clone(&poisoned),
                },
            );
        }

        let inner = PermitInner {
            worker,
            writer,
            idle_flag: idle,
            poisoned,
        };
        if self.available_tx.send(inner).is_err() {
            tracing::error!(group = %self.group, worker = %worker, "Failed to add permit to pool");
        }
    }

    /// Poison a worker. Its permit will never be handed out again.
    ///
    /// Works whether the worker is idle (in the pool) or busy:
    /// - Idle: the permit is discarded on the next `acquire`/`try_acquire`.
    /// - Busy: `PermitIdle::drop` sees the flag and does not return it.
    pub fn poison(&self, worker: WorkerId) {
        if let Ok(mut workers) = self.workers.lock()
            && let Some(flags) = workers.remove(&worker)
        {
            if !flags.poisoned.swap(true, Ordering::AcqRel) {
                tracing::warn!(group = %self.group, worker = %worker, index = flags.index, "Worker poisoned");
            }
            return;
        }
        tracing::debug!(group = %self.group, worker = %worker, "Poison for unknown or retired worker");
    }

    pub fn is_poisoned(&self, worker: WorkerId) -> bool {
        match self.workers.lock() {
            Ok(workers) => workers
                .get(&worker)
                .is_none_or(|flags| flags.poisoned.load(Ordering::Acquire)),
            Err(_) => true,
        }
    }

    fn take_live(&self, inner: PermitInner) -> Option<PermitInUse> {
        if inner.poisoned.load(Ordering::Acquire) {
            tracing::debug!(group = %self.group, worker = %inner.worker, "Discarding poisoned permit from pool");
            return None;
        }
        Some(PermitInUse::new(inner, self.available_tx.clone()))
    }

    pub fn try_acquire(&self) -> Option<PermitInUse> {
        let mut rx = self.available_rx.try_lock().ok()?;
        loop {
            let inner = rx.try_recv().ok()?;
            if let Some(permit) = self.take_live(inner) {
                return Some(permit);
            }
        }
    }

    /// Wait for an idle worker.
    pub async fn acquire(&self) -> Option<PermitInUse> {
        let mut rx = self.available_rx.lock().await;
        loop {
            let inner = rx.recv().await?;
            if let Some(permit) = self.take_live(inner) {
                return Some(permit);
            }
        }
    }

    pub fn occupancy(&self) -> PoolOccupancy {
        let Ok(workers) = self.workers.lock() else {
            return PoolOccupancy::default();
        };
        let live = workers
            .values()
            .filter(|flags| !flags.poisoned.load(Ordering::Acquire));
        let mut occupancy = PoolOccupancy::default();
        for flags in live {
            occupancy.workers += 1;
            if flags.idle.load(Ordering::Acquire) {
                occupancy.idle += 1;
            }
        }
        occupancy
    }
}
