/// Mastodon API entities the gateway reads, and the streaming event type.
use serde::Deserialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub id: String,
    pub username: String,
    /// `user` for local accounts, `user@domain` for remote ones.
    #[serde(default)]
    pub acct: String,
    #[serde(default)]
    pub display_name: String,
}

impl Account {
    /// Name shown in relayed chat lines.
    pub fn display(&self) -> &str {
        if self.display_name.trim().is_empty() {
            &self.username
        } else {
            &self.display_name
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Status {
    #[serde(default)]
    pub id: String,
    /// Post body as HTML.
    #[serde(default)]
    pub content: String,
    /// Content warning; empty when there is none.
    #[serde(default)]
    pub spoiler_text: String,
    pub account: Account,
}

impl Status {
    pub fn content_warning(&self) -> Option<&str> {
        Some(self.spoiler_text.as_str()).filter(|cw| !cw.is_empty())
    }
}

/// One item from a streaming subscription.
///
/// Only `update` carries anything the gateway shows. Every other kind
/// (`delete`, `notification`, `status.update`, ...) is kept as its tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Update(Box<Status>),
    Other(String),
}

impl StreamEvent {
    /// Decode an event from the streaming API's `event` name and `data` payload.
    pub fn decode(kind: &str, data: &str) -> Result<Self, serde_json::Error> {
        match kind {
            "update" => Ok(Self::Update(Box::new(serde_json::from_str(data)?))),
            other => Ok(Self::Other(other.to_owned())),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Update(_) => "update",
            Self::Other(kind) => kind,
        }
    }
}
