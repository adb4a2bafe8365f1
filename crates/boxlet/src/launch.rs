//! Process entry point: one binary, three roles.
//!
//! The master runs [`run`] without a role marker and re-executes the same
//! binary for the proxy and every worker; each child calls [`run`] again
//! and lands in its own role.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::app::ApplicationBuilder;
use crate::bridge::control::spawn_stdin_watcher;
use crate::config::{GroupId, MasterConfig};
use crate::logging::init_tracing;
use crate::master::{Master, shutdown_signal};
use crate::proxy::ProxyServer;
use crate::role::{ChildMarker, ProcessRole};
use crate::worker::{self, WorkerContext};

/// Run this process in whatever role its environment assigns.
///
/// `config` is used by the master only; children receive the master's
/// configuration through their role marker.
pub fn run(builder: ApplicationBuilder, config: MasterConfig) -> anyhow::Result<()> {
    init_tracing();

    let marker = ChildMarker::from_env()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    let Some(marker) = marker else {
        return runtime.block_on(run_master(builder, config).instrument(tracing::info_span!("master")));
    };

    match marker.role.clone() {
        ProcessRole::Master => anyhow::bail!("role marker names the master, refusing to start"),
        ProcessRole::Proxy => {
            runtime.block_on(run_proxy(builder, marker).instrument(tracing::info_span!("proxy")))
        }
        ProcessRole::Worker { group, index } => {
            let span = tracing::info_span!("worker", group = %group, index);
            runtime.block_on(run_worker(builder, marker, group, index).instrument(span))
        }
    }
}

async fn run_master(builder: ApplicationBuilder, config: MasterConfig) -> anyhow::Result<()> {
    tracing::info!(pid = std::process::id(), "Starting master");
    Master::new(config).run(builder, shutdown_signal()).await?;
    Ok(())
}

async fn run_proxy(builder: ApplicationBuilder, marker: ChildMarker) -> anyhow::Result<()> {
    let app = Arc::new(builder.build()?);
    let shutdown = CancellationToken::new();
    let control = spawn_stdin_watcher(shutdown.clone());
    ignore_interrupts();

    let server = ProxyServer::bind(app, &marker.config, &marker.transport, shutdown).await?;
    server.serve().await?;
    control.abort();
    Ok(())
}

async fn run_worker(
    builder: ApplicationBuilder,
    marker: ChildMarker,
    group: GroupId,
    index: usize,
) -> anyhow::Result<()> {
    let app = Arc::new(builder.build()?);
    let shutdown = CancellationToken::new();
    let control = spawn_stdin_watcher(shutdown.clone());
    ignore_interrupts();

    let config = &marker.config.worker;
    let stream = tokio::select! {
        stream = worker::connect(&marker.transport, config) => stream?,
        _ = shutdown.cancelled() => return Ok(()),
    };
    worker::run_worker(app, WorkerContext::new(group, index), config, stream, shutdown).await?;
    control.abort();
    Ok(())
}

/// Children leave SIGINT to the master, which stops them in order.
fn ignore_interrupts() {
    tokio::spawn(async {
        while tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("SIGINT ignored, waiting for the master");
        }
    });
}
