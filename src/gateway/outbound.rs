/// The write side of a client connection, shared by the dispatcher and
/// every pump of that connection.
///
/// Each line is written under the lock, so lines from different tasks never
/// interleave. Once closed (explicitly, or after a write error) every later
/// send fails with [`SendError::Closed`] and nothing more reaches the socket.
use std::time::Duration;

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use tracing::debug;

use crate::irc::codec::{CodecError, IrcCodec};
use crate::irc::message::Message;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// How long `close` waits to flush output a peer is not reading.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct Outbound<W> {
    sink: Mutex<Option<FramedWrite<W, IrcCodec>>>,
}

impl<W> Outbound<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            sink: Mutex::new(Some(FramedWrite::new(writer, IrcCodec::default()))),
        }
    }

    /// Write and flush one line.
    pub async fn send(&self, msg: Message) -> Result<(), SendError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(SendError::Closed)?;
        match sink.send(msg).await {
            Ok(()) => Ok(()),
            // Refused before anything was buffered; the connection is fine.
            Err(e @ CodecError::LineBreak) => Err(e.into()),
            Err(e) => {
                debug!("outbound write failed, closing: {e}");
                *guard = None;
                Err(e.into())
            }
        }
    }

    /// Write lines in order, taking the lock once per line.
    pub async fn send_all<I>(&self, msgs: I) -> Result<(), SendError>
    where
        I: IntoIterator<Item = Message>,
    {
        for msg in msgs {
            self.send(msg).await?;
        }
        Ok(())
    }

    /// Flush and shut the writer. Idempotent.
    ///
    /// Output still unflushed after [`CLOSE_TIMEOUT`] is dropped with the
    /// writer.
    pub async fn close(&self) {
        let mut guard = self.sink.lock().await;
        if let Some(mut sink) = guard.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("outbound close failed: {e}"),
                Err(_) => debug!("peer is not reading, dropping unflushed output"),
            }
        }
    }
}
