//! Proxy process - terminates client connections and relays envelopes to
//! worker groups.
//!
//! ```text
//! client ──TCP──▶ connection reader ──▶ dispatch (one task per envelope)
//!                                          │ group router → permit pool
//!                                          ▼
//!                                 worker socket (Task)
//!                                          │
//! client ◀──TCP── connection writer ◀── worker reader (Reply, Idle)
//! ```
//!
//! A worker receives a new task only after it reported `Idle` for the
//! previous one. Tasks waiting for a worker count against the group's
//! backlog.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::app::Application;
use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ClientInfo, ProxyMessage, TaskId, WorkerId, WorkerMessage};
use crate::bridge::transport::{IpcAddress, WorkerListener};
use crate::config::{GroupId, MasterConfig, ProxyConfig};
use crate::envelope::{self, Envelope, EnvelopeCodec, ErrorCode};
use crate::group::{GroupDispatcher, GroupOccupancy, GroupTable};
use crate::health::Health;
use crate::permit::PermitInUse;
use crate::stats::StatsRegistry;
use crate::version::VersionInfo;

/// How long a new worker connection gets to send `Ready`.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to bind {what} on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

#[derive(Debug)]
enum TaskOutcome {
    Completed { failed: bool },
    WorkerLost,
}

struct PendingTask {
    worker: WorkerId,
    reply_tx: mpsc::UnboundedSender<Bytes>,
    failed: bool,
    done: Option<oneshot::Sender<TaskOutcome>>,
}

/// Counts dispatches in flight so shutdown can wait for them.
struct InflightGuard<'a>(&'a watch::Sender<usize>);

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n -= 1);
    }
}

/// Shared proxy state.
pub struct Proxy {
    app: Arc<Application>,
    config: ProxyConfig,
    groups: GroupTable,
    pending: DashMap<TaskId, PendingTask>,
    stats: StatsRegistry,
    next_task: AtomicU64,
    next_conn: AtomicU64,
    inflight: watch::Sender<usize>,
    shutdown: CancellationToken,
    started_at: DateTime<Utc>,
}

impl Proxy {
    pub fn new(app: Arc<Application>, config: &MasterConfig, shutdown: CancellationToken) -> Self {
        Self {
            app,
            config: config.proxy.clone(),
            groups: GroupTable::new(&config.groups, config.proxy.backlog),
            pending: DashMap::new(),
            stats: StatsRegistry::new(),
            next_task: AtomicU64::new(1),
            next_conn: AtomicU64::new(1),
            inflight: watch::channel(0).0,
            shutdown,
            started_at: Utc::now(),
        }
    }

    pub fn stats(&self) -> &StatsRegistry {
        &self.stats
    }

    pub fn groups(&self) -> &GroupTable {
        &self.groups
    }

    pub fn occupancy(&self) -> Vec<(String, GroupOccupancy)> {
        self.groups
            .iter()
            .map(|g| (g.id().to_string(), g.occupancy()))
            .collect()
    }

    pub fn health(&self) -> Health {
        let occupancy: Vec<_> = self.groups.iter().map(|g| g.occupancy()).collect();
        Health::assess(self.shutdown.is_cancelled(), &occupancy)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn version(&self) -> VersionInfo {
        VersionInfo::new().with_app(self.app.name())
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    fn enter(&self) -> InflightGuard<'_> {
        self.inflight.send_modify(|n| *n += 1);
        InflightGuard(&self.inflight)
    }

    /// Wait until no dispatch is in flight, up to `drain_timeout`.
    async fn drain(&self) {
        let mut rx = self.inflight.subscribe();
        let remaining = *rx.borrow();
        if remaining == 0 {
            return;
        }
        tracing::info!(inflight = remaining, "Draining in-flight tasks");
        match tokio::time::timeout(self.config.drain_timeout, rx.wait_for(|n| *n == 0)).await {
            Ok(_) => tracing::info!("All in-flight tasks drained"),
            Err(_) => tracing::warn!(
                inflight = *self.inflight.borrow(),
                timeout = ?self.config.drain_timeout,
                "Drain timed out, abandoning in-flight tasks"
            ),
        }
    }

    // ---- client side -------------------------------------------------

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let client = ClientInfo::new(conn_id, Some(addr));
        tracing::debug!(conn_id, %addr, "Client connected");

        let (read_half, write_half) = stream.into_split();
        let codec = EnvelopeCodec::new().with_max_frame(self.config.max_frame);
        let mut frames = FramedRead::new(read_half, codec.clone());
        let mut sink = FramedWrite::new(write_half, codec);

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Bytes>();
        let writer = tokio::spawn(async move {
            while let Some(bytes) = reply_rx.recv().await {
                if let Err(e) = sink.send(bytes).await {
                    tracing::debug!(conn_id, error = %e, "Client write failed, dropping replies");
                    break;
                }
            }
        });

        // Cancelled when the client goes away or is cut off for overload.
        let closed = CancellationToken::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = closed.cancelled() => break,
                frame = frames.next() => match frame {
                    Some(Ok(env)) => {
                        let proxy = Arc::clone(&self);
                        let client = client.clone();
                        let reply_tx = reply_tx.clone();
                        let closed = closed.clone();
                        tokio::spawn(async move {
                            proxy.dispatch(env, client, reply_tx, closed).await;
                        });
                    }
                    Some(Err(e)) => {
                        tracing::warn!(conn_id, error = %e, "Undecodable client stream, closing connection");
                        let _ = reply_tx.send(error_reply(&Envelope::default(), ErrorCode::DecodeError, e.to_string()));
                        closed.cancel();
                        break;
                    }
                    None => {
                        tracing::debug!(conn_id, "Client disconnected");
                        closed.cancel();
                        break;
                    }
                },
            }
        }

        // The writer ends once every dispatch of this connection let go.
        drop(reply_tx);
        let _ = writer.await;
        tracing::trace!(conn_id, "Connection closed");
    }

    /// Route one envelope to a worker and wait for it to finish.
    async fn dispatch(
        self: Arc<Self>,
        env: Envelope,
        client: ClientInfo,
        reply_tx: mpsc::UnboundedSender<Bytes>,
        closed: CancellationToken,
    ) {
        let _inflight = self.enter();

        let group = match self.app.route_group(&env) {
            Some(id) => self.groups.get(&id).cloned().ok_or(id),
            None => self
                .groups
                .default_group()
                .cloned()
                .ok_or_else(|| GroupId::from("<none>")),
        };
        let group = match group {
            Ok(group) => group,
            Err(id) => {
                tracing::warn!(cmd = env.cmd, group = %id, "Router picked an unknown group");
                let _ = reply_tx.send(error_reply(&env, ErrorCode::NoSuchGroup, format!("no worker group '{}'", id)));
                self.stats.record(env.cmd, Duration::ZERO, true);
                return;
            }
        };

        let Some(mut permit) = self.acquire(&group, &env, &reply_tx, &closed).await else {
            return;
        };
        let worker = permit.worker();

        let task_id = self.next_task.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel();
        self.pending.insert(
            task_id,
            PendingTask {
                worker,
                reply_tx: reply_tx.clone(),
                failed: false,
                done: Some(done_tx),
            },
        );

        let started = Instant::now();
        tracing::trace!(task_id, cmd = env.cmd, group = %group.id(), %worker, "Dispatching task");
        let sent = permit
            .send(ProxyMessage::Task {
                task_id,
                client,
                payload: envelope::pack(&env),
            })
            .await;

        // The worker reader poisons before it sweeps pending tasks, so a
        // task inserted after the sweep is caught here.
        let outcome = if sent.is_err() || group.pool().is_poisoned(worker) {
            match self.pending.remove(&task_id) {
                Some(_) => TaskOutcome::WorkerLost,
                None => done_rx.await.unwrap_or(TaskOutcome::WorkerLost),
            }
        } else {
            done_rx.await.unwrap_or(TaskOutcome::WorkerLost)
        };

        let elapsed = started.elapsed();
        match outcome {
            TaskOutcome::Completed { failed } => {
                self.stats.record(env.cmd, elapsed, failed);
                drop(permit.into_idle());
                tracing::trace!(task_id, ?elapsed, failed, "Task completed");
            }
            TaskOutcome::WorkerLost => {
                drop(permit.into_poisoned());
                self.stats.record(env.cmd, elapsed, true);
                tracing::error!(task_id, cmd = env.cmd, %worker, "Worker lost mid-task");
                let _ = reply_tx.send(error_reply(&env, ErrorCode::WorkerLost, "worker exited while handling the request"));
            }
        }
    }

    /// An idle worker of `group`, queueing in its backlog if none is free.
    /// `None` means the task was answered or discarded here.
    async fn acquire(
        &self,
        group: &GroupDispatcher,
        env: &Envelope,
        reply_tx: &mpsc::UnboundedSender<Bytes>,
        closed: &CancellationToken,
    ) -> Option<PermitInUse> {
        if let Some(permit) = group.try_acquire() {
            return Some(permit);
        }

        let Ok(_waiting) = group.enqueue() else {
            tracing::warn!(cmd = env.cmd, group = %group.id(), "Backlog full, closing client connection");
            let _ = reply_tx.send(error_reply(env, ErrorCode::BacklogFull, format!("group '{}' is overloaded", group.id())));
            self.stats.record(env.cmd, Duration::ZERO, true);
            closed.cancel();
            return None;
        };

        tokio::select! {
            permit = group.pool().acquire() => permit,
            _ = closed.cancelled() => {
                tracing::debug!(cmd = env.cmd, "Client gone, discarding queued task");
                None
            }
            _ = self.shutdown.cancelled() => {
                let _ = reply_tx.send(error_reply(env, ErrorCode::ShuttingDown, "proxy is shutting down"));
                None
            }
        }
    }

    // ---- worker side -------------------------------------------------

    async fn serve_worker(self: Arc<Self>, stream: UnixStream) {
        let (read_half, write_half) = stream.into_split();
        let mut messages = FramedRead::new(read_half, JsonCodec::<WorkerMessage>::new());

        let hello = tokio::time::timeout(READY_TIMEOUT, messages.next()).await;
        let Ok(Some(Ok(WorkerMessage::Ready { worker, group: group_id, index, pid }))) = hello else {
            tracing::warn!("Worker connection did not start with Ready, dropping it");
            return;
        };
        let Some(group) = self.groups.get(&group_id).map(Arc::clone) else {
            tracing::error!(group = %group_id, index, pid, "Worker announced an unknown group");
            return;
        };

        group
            .pool()
            .add_permit(worker, index, FramedWrite::new(write_half, JsonCodec::new()));
        tracing::info!(group = %group_id, index, pid, %worker, "Worker joined");

        loop {
            match messages.next().await {
                Some(Ok(WorkerMessage::Reply { task_id, payload })) => {
                    match self.pending.get_mut(&task_id) {
                        Some(mut task) => {
                            if envelope::peek_ret(&payload).is_some_and(|ret| ret < 0) {
                                task.failed = true;
                            }
                            // Client may be gone; its replies are dropped.
                            let _ = task.reply_tx.send(payload);
                        }
                        None => tracing::debug!(task_id, "Reply for unknown task"),
                    }
                }
                Some(Ok(WorkerMessage::Idle { task_id })) => {
                    if let Some((_, mut task)) = self.pending.remove(&task_id)
                        && let Some(done) = task.done.take()
                    {
                        let _ = done.send(TaskOutcome::Completed {
                            failed: task.failed,
                        });
                    }
                }
                Some(Ok(WorkerMessage::Ready { .. })) => {
                    tracing::warn!(%worker, "Duplicate Ready from worker, ignoring");
                }
                Some(Err(e)) => {
                    tracing::error!(%worker, error = %e, "Worker socket error");
                    break;
                }
                None => {
                    tracing::warn!(group = %group_id, index, pid, %worker, "Worker disconnected");
                    break;
                }
            }
        }

        group.pool().poison(worker);
        let orphaned: Vec<TaskId> = self
            .pending
            .iter()
            .filter(|entry| entry.worker == worker)
            .map(|entry| *entry.key())
            .collect();
        for task_id in orphaned {
            if let Some((_, mut task)) = self.pending.remove(&task_id)
                && let Some(done) = task.done.take()
            {
                let _ = done.send(TaskOutcome::WorkerLost);
            }
        }
    }
}

fn error_reply(env: &Envelope, code: ErrorCode, message: impl Into<String>) -> Bytes {
    envelope::pack(&env.error_reply(code, message))
}

/// A proxy with its listeners bound, ready to serve.
pub struct ProxyServer {
    proxy: Arc<Proxy>,
    clients: TcpListener,
    workers: WorkerListener,
    admin: Option<(TcpListener, String)>,
}

impl ProxyServer {
    pub async fn bind(
        app: Arc<Application>,
        config: &MasterConfig,
        ipc: &IpcAddress,
        shutdown: CancellationToken,
    ) -> Result<Self, ProxyError> {
        let client_addr = format!("{}:{}", config.proxy.host, config.proxy.port);
        let clients = TcpListener::bind(&client_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                what: "client listener",
                addr: client_addr.clone(),
                source,
            })?;

        let workers = WorkerListener::bind(ipc).map_err(|source| ProxyError::Bind {
            what: "worker socket",
            addr: ipc.to_string(),
            source,
        })?;

        let admin = match &config.admin {
            Some(admin) => {
                let admin_addr = format!("{}:{}", admin.host, admin.port);
                let listener = TcpListener::bind(&admin_addr)
                    .await
                    .map_err(|source| ProxyError::Bind {
                        what: "admin listener",
                        addr: admin_addr,
                        source,
                    })?;
                Some((listener, admin.token.clone()))
            }
            None => None,
        };

        Ok(Self {
            proxy: Arc::new(Proxy::new(app, config, shutdown)),
            clients,
            workers,
            admin,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.clients.local_addr()
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin
            .as_ref()
            .and_then(|(listener, _)| listener.local_addr().ok())
    }

    pub fn proxy(&self) -> Arc<Proxy> {
        Arc::clone(&self.proxy)
    }

    /// Serve until the shutdown token fires, then drain.
    pub async fn serve(self) -> Result<(), ProxyError> {
        let Self {
            proxy,
            clients,
            workers,
            admin,
        } = self;
        let shutdown = proxy.shutdown.clone();

        tracing::info!(
            address = %clients.local_addr().map_err(ProxyError::Accept)?,
            groups = proxy.groups.iter().count(),
            "Proxy listening"
        );

        let admin_task = admin.map(|(listener, token)| {
            let proxy = Arc::clone(&proxy);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = crate::admin::serve(listener, proxy, token, shutdown).await {
                    tracing::error!(error = %e, "Admin server failed");
                }
            })
        });

        let worker_proxy = Arc::clone(&proxy);
        let worker_shutdown = shutdown.clone();
        let worker_accept = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = worker_shutdown.cancelled() => break,
                    accepted = workers.accept() => match accepted {
                        Ok(stream) => {
                            tokio::spawn(Arc::clone(&worker_proxy).serve_worker(stream));
                        }
                        Err(e) => tracing::error!(error = %e, "Worker accept failed"),
                    },
                }
            }
        });

        // Connection tasks own the client writers; joined before returning
        // so drained replies reach the socket before the runtime goes away.
        let connections = TaskTracker::new();
        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                accepted = clients.accept() => match accepted {
                    Ok((stream, addr)) => {
                        connections.spawn(Arc::clone(&proxy).serve_connection(stream, addr));
                    }
                    Err(e) if is_transient(&e) => {
                        tracing::warn!(error = %e, "Client accept failed, continuing");
                    }
                    Err(e) => break Err(ProxyError::Accept(e)),
                },
            }
        };

        tracing::info!("Proxy stopped accepting clients");
        drop(clients);
        let deadline = tokio::time::Instant::now() + proxy.config.drain_timeout;
        proxy.drain().await;

        connections.close();
        if tokio::time::timeout_at(deadline, connections.wait()).await.is_err() {
            tracing::warn!(
                open = connections.len(),
                "Client connections still flushing at the drain deadline"
            );
        }

        let _ = worker_accept.await;
        if let Some(task) = admin_task {
            let _ = task.await;
        }
        tracing::info!("Proxy shutdown complete");
        result
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) || e.raw_os_error() == Some(24) // EMFILE
}
