/// Listener and accept loop.
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{field, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::mastodon::Backend;

use super::session::{serve_connection, SessionError};

/// Bind the configured address and serve clients until the process exits.
pub async fn run(
    config: Arc<Config>,
    backend: Arc<dyn Backend>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(&config.server_addr).await?;
    info!(addr = %config.server_addr, server = %config.server_name, "tootbridge listening");
    accept_loop(listener, config, backend).await;
    Ok(())
}

/// Accept connections forever, one task per client.
///
/// A failed accept is logged and skipped; it never stops the listener.
pub async fn accept_loop(listener: TcpListener, config: Arc<Config>, backend: Arc<dyn Backend>) {
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        info!(%addr, "new connection");

        let span = info_span!("conn", %addr, nick = field::Empty, registered = false);
        let config = Arc::clone(&config);
        let backend = Arc::clone(&backend);
        tokio::spawn(
            async move {
                match serve_connection(socket, addr, config, backend).await {
                    Ok(()) => {}
                    Err(SessionError::Handshake(e)) => info!("rejected: {e}"),
                    Err(e) => warn!("client error: {e}"),
                }
                info!("disconnected");
            }
            .instrument(span),
        );
    }
}
