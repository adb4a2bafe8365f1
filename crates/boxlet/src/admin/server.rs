//! Admin HTTP server.

use std::io;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::routes::{AdminState, routes};
use crate::proxy::Proxy;

/// Serve the admin routes on an already bound listener until `shutdown`.
pub async fn serve(
    listener: TcpListener,
    proxy: Arc<Proxy>,
    token: String,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let app = routes(AdminState::new(proxy, token));

    tracing::info!(address = %listener.local_addr()?, "Admin channel listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("Admin channel stopped");
    Ok(())
}
