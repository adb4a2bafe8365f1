//! Master process: validates configuration and routes, spawns the proxy
//! and the worker groups, supervises them and runs the ordered shutdown.
//!
//! ```text
//! Configuring → Validating → Spawning → Running → ShuttingDown → Stopped
//! ```
//!
//! Children learn their role from the [`CHILD_ENV`] marker and listen for
//! [`ControlRequest::Shutdown`] on stdin. Shutdown stops the proxy first so
//! it can drain against live workers, then stops every worker.

use std::future::Future;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use futures::future::join_all;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;

use crate::app::{ApplicationBuilder, BuildError};
use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::ControlRequest;
use crate::bridge::transport::IpcAddress;
use crate::config::{ConfigError, MasterConfig, RespawnPolicy};
use crate::role::{CHILD_ENV, ChildMarker, MarkerError, ProcessRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Configuring,
    Validating,
    Spawning,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error(transparent)]
    Marker(#[from] MarkerError),
}

#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid application: {0}")]
    Build(#[from] BuildError),
    #[error("failed to start {role}: {source}")]
    Spawn {
        role: ProcessRole,
        #[source]
        source: SpawnError,
    },
}

/// Extension point for how child processes are started.
pub trait ProcessSpawner: Send + Sync {
    /// Start a child for `marker.role`. The child's stdin should be piped;
    /// it carries the control channel.
    fn spawn(&self, marker: &ChildMarker) -> Result<Child, SpawnError>;
}

/// Re-executes the current binary with the same arguments; the role goes
/// in the environment only.
pub struct ExecSpawner;

impl ProcessSpawner for ExecSpawner {
    fn spawn(&self, marker: &ChildMarker) -> Result<Child, SpawnError> {
        let exe = std::env::current_exe()?;
        let child = Command::new(exe)
            .args(std::env::args_os().skip(1))
            .env(CHILD_ENV, marker.encode()?)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

type ControlWriter = FramedWrite<ChildStdin, JsonCodec<ControlRequest>>;

/// A supervised child. The process itself is owned by its watch task.
struct ChildHandle {
    role: ProcessRole,
    stop: Option<oneshot::Sender<Duration>>,
    task: JoinHandle<()>,
}

impl ChildHandle {
    /// Ask the child to stop and wait for it; a child that already exited
    /// returns at once.
    async fn stop(mut self, timeout: Duration) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(timeout);
        }
        if let Err(e) = self.task.await {
            tracing::error!(role = %self.role, error = %e, "Child watch task failed");
        }
    }
}

type ExitReport = (ProcessRole, io::Result<ExitStatus>);

async fn watch_child(
    role: ProcessRole,
    mut child: Child,
    stop: oneshot::Receiver<Duration>,
    exits: mpsc::UnboundedSender<ExitReport>,
) {
    let control = child
        .stdin
        .take()
        .map(|stdin| FramedWrite::new(stdin, JsonCodec::<ControlRequest>::new()));

    let timeout = tokio::select! {
        status = child.wait() => {
            let _ = exits.send((role, status));
            return;
        }
        Ok(timeout) = stop => timeout,
    };

    stop_child(&role, &mut child, control, timeout).await;
}

async fn stop_child(
    role: &ProcessRole,
    child: &mut Child,
    control: Option<ControlWriter>,
    timeout: Duration,
) {
    if let Some(mut control) = control {
        if let Err(e) = control.send(ControlRequest::Shutdown).await {
            tracing::debug!(%role, error = %e, "Could not deliver Shutdown");
        }
        // Closing stdin right after is read as shutdown too.
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => tracing::info!(%role, %status, "Child stopped"),
        Ok(Err(e)) => tracing::warn!(%role, error = %e, "Failed to reap child"),
        Err(_) => {
            tracing::warn!(%role, ?timeout, "Child did not stop in time, killing it");
            if let Err(e) = child.kill().await {
                tracing::error!(%role, error = %e, "Failed to kill child");
            }
        }
    }
}

pub struct Master {
    config: MasterConfig,
    spawner: Arc<dyn ProcessSpawner>,
    transport: IpcAddress,
    state: watch::Sender<MasterState>,
}

impl Master {
    pub fn new(config: MasterConfig) -> Self {
        Self {
            config,
            spawner: Arc::new(ExecSpawner),
            transport: IpcAddress::for_master(std::process::id()),
            state: watch::channel(MasterState::Configuring).0,
        }
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_transport(mut self, transport: IpcAddress) -> Self {
        self.transport = transport;
        self
    }

    pub fn state(&self) -> watch::Receiver<MasterState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: MasterState) {
        tracing::debug!(?state, "Master state");
        self.state.send_replace(state);
    }

    /// Validate, spawn and supervise until `shutdown` resolves (or the
    /// children can no longer serve), then stop everything in order.
    pub async fn run<F>(self, builder: ApplicationBuilder, shutdown: F) -> Result<(), MasterError>
    where
        F: Future<Output = ()>,
    {
        self.set_state(MasterState::Configuring);
        self.config.validate()?;

        // The master never serves; building only proves the routes are sound.
        self.set_state(MasterState::Validating);
        let app = builder.build()?;
        tracing::info!(
            app = app.name(),
            routes = app.routes().len(),
            groups = self.config.groups.len(),
            workers = self.config.total_workers(),
            "Application validated"
        );
        drop(app);

        self.set_state(MasterState::Spawning);
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<ExitReport>();
        let (respawn_tx, mut respawn_rx) = mpsc::unbounded_channel::<ProcessRole>();
        let mut children = Vec::with_capacity(self.config.total_workers() + 1);

        for role in self.roles() {
            match self.spawn_child(role.clone(), &exit_tx) {
                Ok(handle) => children.push(handle),
                Err(source) => {
                    tracing::error!(%role, error = %source, "Spawn failed, stopping started children");
                    self.stop_all(children).await;
                    return Err(MasterError::Spawn { role, source });
                }
            }
        }

        self.set_state(MasterState::Running);
        tracing::info!(children = children.len(), transport = %self.transport, "Master running");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                Some((role, status)) = exit_rx.recv() => {
                    children.retain(|c| c.role != role);
                    match status {
                        Ok(status) => tracing::warn!(%role, %status, "Child exited unexpectedly"),
                        Err(e) => tracing::warn!(%role, error = %e, "Lost track of child"),
                    }
                    match self.config.respawn {
                        RespawnPolicy::Always => self.schedule_respawn(role, &respawn_tx),
                        RespawnPolicy::Never if role == ProcessRole::Proxy => {
                            tracing::error!("Proxy is gone and respawn is disabled, shutting down");
                            break;
                        }
                        RespawnPolicy::Never if children.is_empty() => {
                            tracing::error!("No children left, shutting down");
                            break;
                        }
                        RespawnPolicy::Never => {}
                    }
                }
                Some(role) = respawn_rx.recv() => {
                    match self.spawn_child(role.clone(), &exit_tx) {
                        Ok(handle) => {
                            tracing::info!(%role, "Child respawned");
                            children.push(handle);
                        }
                        Err(e) => {
                            tracing::error!(%role, error = %e, "Respawn failed, retrying");
                            self.schedule_respawn(role, &respawn_tx);
                        }
                    }
                }
            }
        }

        self.set_state(MasterState::ShuttingDown);
        self.stop_all(children).await;
        self.set_state(MasterState::Stopped);
        tracing::info!("Master stopped");
        Ok(())
    }

    /// Proxy first, then every worker of every group.
    fn roles(&self) -> Vec<ProcessRole> {
        let workers = self.config.groups.iter().flat_map(|group| {
            (0..group.workers).map(|index| ProcessRole::Worker {
                group: group.id.clone(),
                index,
            })
        });
        std::iter::once(ProcessRole::Proxy).chain(workers).collect()
    }

    fn spawn_child(
        &self,
        role: ProcessRole,
        exits: &mpsc::UnboundedSender<ExitReport>,
    ) -> Result<ChildHandle, SpawnError> {
        let marker = ChildMarker {
            role: role.clone(),
            transport: self.transport.clone(),
            config: self.config.clone(),
        };
        let child = self.spawner.spawn(&marker)?;
        tracing::info!(%role, pid = child.id(), "Child spawned");

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(watch_child(role.clone(), child, stop_rx, exits.clone()));
        Ok(ChildHandle {
            role,
            stop: Some(stop_tx),
            task,
        })
    }

    fn schedule_respawn(&self, role: ProcessRole, respawn: &mpsc::UnboundedSender<ProcessRole>) {
        let delay = self.config.respawn_delay;
        tracing::info!(%role, ?delay, "Respawn scheduled");
        let respawn = respawn.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = respawn.send(role);
        });
    }

    async fn stop_all(&self, children: Vec<ChildHandle>) {
        let timeout = self.config.stop_timeout;
        let (proxy, workers): (Vec<_>, Vec<_>) =
            children.into_iter().partition(|c| c.role == ProcessRole::Proxy);

        for child in proxy {
            tracing::info!("Stopping proxy");
            child.stop(timeout).await;
        }
        if !workers.is_empty() {
            tracing::info!(workers = workers.len(), "Stopping workers");
            join_all(workers.into_iter().map(|c| c.stop(timeout))).await;
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
