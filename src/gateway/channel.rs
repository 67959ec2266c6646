/// IRC channel names and the feeds behind them.
///
/// `&user`, `&public` and `&local` map to the fixed timelines; any `#tag`
/// maps to the hashtag feed for `tag`. A session joins each name at most once.
use std::collections::HashMap;

use tokio::task::JoinHandle;

use crate::mastodon::Feed;

/// A joinable channel: its IRC name and the feed that backs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub name: String,
    pub feed: Feed,
    pub hashtag: Option<String>,
}

/// Why a single JOIN target was not joined.
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("unknown target {0}")]
    UnknownTarget(String),
    #[error("channel already joined")]
    AlreadyJoined,
    #[error("subscription failed: {0}")]
    Subscribe(#[from] crate::mastodon::BackendError),
    #[error("could not confirm join: {0}")]
    Send(#[from] super::outbound::SendError),
}

impl Channel {
    /// The personal timeline every session starts with.
    pub fn user() -> Self {
        Self::fixed("&user", Feed::User)
    }

    /// The federated timeline every session starts with.
    pub fn public() -> Self {
        Self::fixed("&public", Feed::Public)
    }

    fn fixed(name: &str, feed: Feed) -> Self {
        Self {
            name: name.to_owned(),
            feed,
            hashtag: None,
        }
    }

    /// Classify a JOIN target by its prefix.
    pub fn parse(target: &str) -> Result<Self, JoinError> {
        match target.chars().next() {
            Some('&') => match target {
                "&user" => Ok(Self::user()),
                "&public" => Ok(Self::public()),
                "&local" => Ok(Self::fixed("&local", Feed::Local)),
                _ => Err(JoinError::UnknownTarget(target.to_owned())),
            },
            Some('#') => Ok(Self {
                name: target.to_owned(),
                feed: Feed::Hashtag,
                hashtag: Some(target[1..].to_owned()),
            }),
            _ => Err(JoinError::UnknownTarget(target.to_owned())),
        }
    }
}

/// Channels one session has joined, each with its pump task.
///
/// Entries are only removed at teardown, when every pump is drained.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    pumps: HashMap<String, JoinHandle<()>>,
}

impl ChannelRegistry {
    pub fn contains(&self, name: &str) -> bool {
        self.pumps.contains_key(name)
    }

    /// Fail with [`JoinError::AlreadyJoined`] if `name` is taken.
    pub fn check_free(&self, name: &str) -> Result<(), JoinError> {
        if self.contains(name) {
            return Err(JoinError::AlreadyJoined);
        }
        Ok(())
    }

    /// Record a joined channel and the task pumping it.
    pub fn insert(&mut self, name: &str, pump: JoinHandle<()>) -> Result<(), JoinError> {
        self.check_free(name)?;
        self.pumps.insert(name.to_owned(), pump);
        Ok(())
    }

    /// Hand over every pump task, emptying the registry.
    pub fn drain(&mut self) -> Vec<JoinHandle<()>> {
        self.pumps.drain().map(|(_, pump)| pump).collect()
    }
}
