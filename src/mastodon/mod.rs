/// Mastodon backend boundary.
///
/// The gateway only sees the two traits below: a [`Backend`] that turns the
/// fixed service credentials into an [`AccountClient`], and the client's
/// profile fetch and feed subscriptions. [`client`] holds the HTTP
/// implementation; tests plug in their own.
pub mod client;
pub mod html;
pub mod model;
pub mod sse;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

pub use model::{Account, Status, StreamEvent};

/// Capacity of the per-subscription event queue. A slow pump blocks the
/// feeder once this many events are waiting.
pub const EVENT_QUEUE_CAPACITY: usize = 10;

/// A named backend event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feed {
    /// The authenticated account's home timeline.
    User,
    /// The federated public timeline.
    Public,
    /// The instance-local public timeline.
    Local,
    /// Public posts carrying one hashtag.
    Hashtag,
}

impl Feed {
    /// Feed identifier, also used as the source of relayed chat lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Public => "public",
            Self::Local => "local",
            Self::Hashtag => "hashtag",
        }
    }
}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed service credentials the gateway authenticates with.
#[derive(Clone)]
pub struct Credentials {
    pub instance: Url,
    pub client_id: String,
    pub client_secret: String,
    pub token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("instance", &self.instance.as_str())
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("missing credential: {0}")]
    MissingCredential(&'static str),
    #[error("invalid backend URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{endpoint} returned HTTP {status}")]
    Status {
        endpoint: String,
        status: reqwest::StatusCode,
    },
    #[error("hashtag feed needs a tag")]
    MissingHashtag,
}

/// A live feed subscription.
///
/// `events` yields decoded events in the order the backend produced them.
/// Cancelling `stop` asks the backend to stop sending; the backend cancels
/// `stopped` once it has fully stopped (including on its own errors).
#[derive(Debug)]
pub struct Subscription {
    pub events: mpsc::Receiver<StreamEvent>,
    pub stop: CancellationToken,
    pub stopped: CancellationToken,
}

impl Subscription {
    /// Create a subscription plus the feeder-side handles: the sender for
    /// events and clones of the two signals.
    pub fn channel() -> (Self, Feeder) {
        let (tx, events) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let stop = CancellationToken::new();
        let stopped = CancellationToken::new();
        let feeder = Feeder {
            tx,
            stop: stop.clone(),
            stopped: stopped.clone(),
        };
        (
            Self {
                events,
                stop,
                stopped,
            },
            feeder,
        )
    }
}

/// A subscriber that goes away, even by being aborted, stops the feed.
impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// The producing end of a [`Subscription`].
#[derive(Debug)]
pub struct Feeder {
    pub tx: mpsc::Sender<StreamEvent>,
    pub stop: CancellationToken,
    pub stopped: CancellationToken,
}

impl Feeder {
    /// Queue one event, waiting for room. Returns `false` once the consumer
    /// is gone or a stop was requested.
    pub async fn push(&self, event: StreamEvent) -> bool {
        tokio::select! {
            biased;
            () = self.stop.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }
}

impl Drop for Feeder {
    fn drop(&mut self) {
        self.stopped.cancel();
    }
}

/// Authenticates against a backend instance.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> Result<Arc<dyn AccountClient>, BackendError>;
}

/// A backend client bound to one account.
#[async_trait]
pub trait AccountClient: Send + Sync {
    /// Fetch the profile of the account the credentials belong to.
    async fn current_account(&self) -> Result<Account, BackendError>;

    /// Open a feed subscription. `hashtag` is only used by [`Feed::Hashtag`].
    async fn subscribe(
        &self,
        feed: Feed,
        hashtag: Option<&str>,
    ) -> Result<Subscription, BackendError>;
}
