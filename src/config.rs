/// Gateway configuration, read once at start-up.
///
/// Every connection gets the same `Arc<Config>`; nothing here changes after
/// the listener is bound.
use std::fmt;

use tracing::{debug, warn};
use url::Url;

use crate::mastodon::Credentials;

pub const DEFAULT_SERVER_NAME: &str = "to.ot";
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:42069";
pub const DEFAULT_USER_PASSWORD: &str = "hunter2";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("MASTODON_INSTANCE is not a valid URL: {0}")]
    InvalidInstance(#[from] url::ParseError),
}

#[derive(Clone)]
pub struct Config {
    /// Name the gateway uses as the source of its own replies.
    pub server_name: String,
    /// Address the IRC listener binds to.
    pub server_addr: String,
    /// Shared secret every client must present with `PASS`.
    pub user_password: String,
    /// Fixed service credentials for the Mastodon account.
    pub credentials: Credentials,
}

impl Config {
    /// Fill unset variables from a `.env` file in the working directory, if
    /// there is one, then read the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => debug!(path = %path.display(), "loaded environment file"),
            Err(e) if e.not_found() => {}
            Err(e) => warn!("ignoring unreadable environment file: {e}"),
        }
        Self::from_env()
    }

    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let instance = Url::parse(&required("MASTODON_INSTANCE")?)?;

        Ok(Self {
            server_name: get("SERVER_NAME").unwrap_or_else(|| DEFAULT_SERVER_NAME.into()),
            server_addr: get("SERVER_ADDR").unwrap_or_else(|| DEFAULT_SERVER_ADDR.into()),
            user_password: get("USER_PASSWORD").unwrap_or_else(|| DEFAULT_USER_PASSWORD.into()),
            credentials: Credentials {
                instance,
                client_id: required("MASTODON_CLIENT_ID")?,
                client_secret: required("MASTODON_CLIENT_SECRET")?,
                token: required("MASTODON_TOKEN")?,
            },
        })
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("server_name", &self.server_name)
            .field("server_addr", &self.server_addr)
            .field("instance", &self.credentials.instance.as_str())
            .finish_non_exhaustive()
    }
}
