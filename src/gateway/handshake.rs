/// Password gate run once per connection before a session exists.
///
/// `CAP` lines are skipped. The first other line must be `PASS <secret>`
/// matching the configured password; then the backend client is built and
/// the account profile fetched. Any failure sends one `ERROR` line and
/// closes the connection.
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::{debug, info};

use crate::config::Config;
use crate::irc::codec::{CodecError, IrcCodec};
use crate::irc::message::Message;
use crate::mastodon::{Account, AccountClient, Backend, BackendError};

use super::outbound::Outbound;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("connection closed before PASS")]
    Disconnected,
    #[error("read failed: {0}")]
    Read(#[from] CodecError),
    #[error("expected PASS, got {0}")]
    NotPass(String),
    #[error("wrong password")]
    WrongPassword,
    #[error("backend authentication failed: {0}")]
    Backend(#[source] BackendError),
    #[error("could not fetch current account: {0}")]
    Profile(#[source] BackendError),
}

impl HandshakeError {
    /// Text of the `ERROR` line sent to the client.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Profile(_) => "could not get current Mastodon account",
            _ => "authentication failed",
        }
    }
}

/// A connection that passed the gate.
pub struct Authenticated {
    pub client: Arc<dyn AccountClient>,
    pub account: Account,
}

/// Run the gate. On failure the client has already been sent `ERROR` and
/// the write side is closed.
pub async fn handshake<R, W>(
    lines: &mut FramedRead<R, IrcCodec>,
    out: &Outbound<W>,
    config: &Config,
    backend: &dyn Backend,
) -> Result<Authenticated, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    let result = authenticate(lines, config, backend).await;
    if let Err(ref e) = result {
        info!(reason = %e, "handshake rejected");
        let error = Message::new(Some(&config.server_name), "ERROR", [e.reason()]);
        if let Err(send_err) = out.send(error).await {
            debug!("could not deliver ERROR: {send_err}");
        }
        out.close().await;
    }
    result
}

async fn authenticate<R>(
    lines: &mut FramedRead<R, IrcCodec>,
    config: &Config,
    backend: &dyn Backend,
) -> Result<Authenticated, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let msg = loop {
        match lines.next().await {
            None => return Err(HandshakeError::Disconnected),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(msg)) if msg.verb() == "CAP" => continue,
            Some(Ok(msg)) => break msg,
        }
    };

    if msg.verb() != "PASS" {
        return Err(HandshakeError::NotPass(msg.command));
    }
    if msg.param(0) != Some(config.user_password.as_str()) {
        return Err(HandshakeError::WrongPassword);
    }

    let client = backend
        .authenticate(&config.credentials)
        .await
        .map_err(HandshakeError::Backend)?;
    let account = client
        .current_account()
        .await
        .map_err(HandshakeError::Profile)?;

    Ok(Authenticated { client, account })
}
