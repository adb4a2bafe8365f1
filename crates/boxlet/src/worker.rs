//! Worker process - pulls tasks from the proxy and runs them through the
//! application's route table.
//!
//! Architecture:
//! - Worker socket (to the proxy): Task in; Ready, Reply, Idle out
//! - Control channel (stdin, from the master): Shutdown
//!
//! A worker runs one task at a time, in the order the proxy sent them.
//! Handler failures end in an error reply and the worker keeps serving;
//! losing the worker socket is fatal and the master decides what follows.

use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::app::Application;
use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ProxyMessage, WorkerId, WorkerMessage};
use crate::bridge::transport::{self, IpcAddress};
use crate::config::{GroupId, WorkerConfig};
use crate::request::{ReplySender, Request};

/// Identity of a running worker, handed to start/stop hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerContext {
    pub id: WorkerId,
    pub group: GroupId,
    pub index: usize,
    pub pid: u32,
}

impl WorkerContext {
    pub fn new(group: GroupId, index: usize) -> Self {
        Self {
            id: WorkerId::new(),
            group,
            index,
            pid: std::process::id(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cannot reach proxy: {0}")]
    Connect(#[source] io::Error),
    #[error("worker socket read failed: {0}")]
    Read(#[source] io::Error),
    #[error("worker socket write failed: {0}")]
    Write(#[source] io::Error),
    #[error("proxy closed the worker socket")]
    Closed,
}

/// Connect to the proxy, waiting up to `connect_timeout` for it to bind.
pub async fn connect(addr: &IpcAddress, config: &WorkerConfig) -> Result<UnixStream, TransportError> {
    let stream = transport::connect_with_retry(addr, config.connect_timeout)
        .await
        .map_err(TransportError::Connect)?;
    tracing::info!(address = %addr, "Connected to proxy");
    Ok(stream)
}

/// Run the worker event loop on an established worker socket.
///
/// Returns `Ok` after a requested shutdown (the in-flight task, if any, is
/// finished first) and an error when the socket is lost.
pub async fn run_worker(
    app: Arc<Application>,
    ctx: WorkerContext,
    config: &WorkerConfig,
    stream: UnixStream,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    let (read_half, write_half) = stream.into_split();
    let mut tasks = FramedRead::new(read_half, JsonCodec::<ProxyMessage>::new());
    let mut writer = FramedWrite::new(write_half, JsonCodec::<WorkerMessage>::new());

    // Replies are queued so hooks and sync handlers never await the socket.
    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let forwarder = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            writer.send(msg).await?;
        }
        Ok::<_, io::Error>(())
    });
    let sender = ReplySender::new(tx.clone());

    app.worker_started(&ctx);

    tracing::trace!(worker = %ctx.id, "Sending Ready to proxy");
    tx.send(WorkerMessage::Ready {
        worker: ctx.id,
        group: ctx.group.clone(),
        index: ctx.index,
        pid: ctx.pid,
    })
    .map_err(|_| TransportError::Closed)?;
    drop(tx);
    tracing::info!(group = %ctx.group, index = ctx.index, "Worker ready");

    let outcome = loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::info!("Shutdown requested, worker stopping");
                break Ok(());
            }

            frame = tasks.next() => match frame {
                Some(Ok(ProxyMessage::Task { task_id, client, payload })) => {
                    tracing::trace!(task_id, conn_id = client.conn_id, "Task received");
                    let mut request = Request::new(task_id, client, payload, sender.clone());
                    if request.process(&app, config.task_timeout).await.is_err() {
                        break Err(TransportError::Closed);
                    }
                }
                Some(Err(e)) => break Err(TransportError::Read(e)),
                None => break Err(TransportError::Closed),
            },
        }
    };

    app.worker_stopped(&ctx);

    drop(sender);
    let flushed = match forwarder.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(TransportError::Write(e)),
        Err(e) => Err(TransportError::Write(io::Error::other(e))),
    };

    match outcome {
        Ok(()) => flushed,
        Err(e) => {
            tracing::error!(error = %e, "Worker lost its proxy");
            Err(e)
        }
    }
}
