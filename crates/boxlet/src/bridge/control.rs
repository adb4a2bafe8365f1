//! Child side of the control channel.
//!
//! The master keeps every child's stdin open and writes framed
//! [`ControlRequest`]s to it. Shutdown, EOF, or a broken channel all mean
//! the same thing to the child: stop taking work and wind down.

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use super::codec::JsonCodec;
use super::protocol::ControlRequest;

/// Why the control channel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlExit {
    ShutdownRequested,
    MasterGone,
}

/// Read control requests until shutdown, then cancel `shutdown`.
pub async fn watch_control<R>(reader: R, shutdown: CancellationToken) -> ControlExit
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, JsonCodec::<ControlRequest>::new());
    let exit = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break ControlExit::ShutdownRequested,
            frame = frames.next() => match frame {
                Some(Ok(ControlRequest::Shutdown)) => {
                    tracing::info!("Shutdown requested by master");
                    break ControlExit::ShutdownRequested;
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Control channel broken");
                    break ControlExit::MasterGone;
                }
                None => {
                    tracing::warn!("Control channel closed, master is gone");
                    break ControlExit::MasterGone;
                }
            },
        }
    };
    shutdown.cancel();
    exit
}

/// Spawn [`watch_control`] on this process's stdin.
pub fn spawn_stdin_watcher(shutdown: CancellationToken) -> tokio::task::JoinHandle<ControlExit> {
    tokio::spawn(watch_control(tokio::io::stdin(), shutdown))
}
