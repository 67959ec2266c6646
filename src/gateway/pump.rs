/// Stream pump: one task per joined channel, forwarding that channel's
/// feed to the client until the session is cancelled or the feed ends.
use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::irc::codec::CodecError;
use crate::mastodon::Subscription;

use super::channel::Channel;
use super::outbound::{Outbound, SendError};
use super::translate::translate;

pub struct Pump<W> {
    pub channel: Channel,
    pub subscription: Subscription,
    pub out: Arc<Outbound<W>>,
    pub cancel: CancellationToken,
}

impl<W> Pump<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Run the pump on its own task, inside the caller's span.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run().in_current_span())
    }

    /// Forward events until one of:
    /// - the session cancels: ask the backend to stop and return at once,
    /// - the backend reports it stopped, or its queue closes,
    /// - the client socket is gone.
    ///
    /// Events already queued are forwarded before a backend stop is noticed.
    pub async fn run(self) {
        let Pump {
            channel,
            mut subscription,
            out,
            cancel,
        } = self;

        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    subscription.stop.cancel();
                    debug!(channel = %channel.name, "pump cancelled");
                    return;
                }
                event = subscription.events.recv() => event,
                () = subscription.stopped.cancelled() => None,
            };

            let Some(event) = event else {
                info!(channel = %channel.name, feed = %channel.feed, "feed stopped");
                return;
            };
            debug!(channel = %channel.name, kind = event.kind(), "stream event");

            let lines = match translate(&event, &channel) {
                Ok(lines) => lines,
                Err(e) => {
                    warn!(channel = %channel.name, "dropping event: {e}");
                    continue;
                }
            };
            match out.send_all(lines).await {
                Ok(()) => {}
                Err(SendError::Codec(CodecError::LineBreak)) => {
                    warn!(channel = %channel.name, "dropping event that would split a line");
                }
                Err(e) => {
                    debug!(channel = %channel.name, "client gone: {e}");
                    subscription.stop.cancel();
                    return;
                }
            }
        }
    }
}
