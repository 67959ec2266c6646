/// HTTP implementation of the backend traits against a Mastodon instance.
///
/// Profile lookups are plain REST calls. Feed subscriptions hold one
/// streaming request open per feed and decode it with [`SseCodec`]; a feeder
/// task pushes decoded events into the subscription's bounded queue until the
/// server closes the stream or the subscriber asks it to stop.
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::ACCEPT;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};
use url::Url;

use super::sse::SseCodec;
use super::{
    Account, AccountClient, Backend, BackendError, Credentials, Feed, Feeder, StreamEvent,
    Subscription,
};

/// Endpoint paths are relative so an instance served under a path prefix
/// (`https://host/masto/`) keeps it.
const VERIFY_CREDENTIALS: &str = "api/v1/accounts/verify_credentials";

/// Entry point: builds [`MastodonClient`]s from credentials.
#[derive(Debug, Clone)]
pub struct MastodonBackend {
    http: reqwest::Client,
}

impl MastodonBackend {
    pub fn new() -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("tootbridge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Backend for MastodonBackend {
    async fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> Result<Arc<dyn AccountClient>, BackendError> {
        let checks = [
            ("client id", &credentials.client_id),
            ("client secret", &credentials.client_secret),
            ("access token", &credentials.token),
        ];
        for (name, value) in checks {
            if value.is_empty() {
                return Err(BackendError::MissingCredential(name));
            }
        }

        Ok(Arc::new(MastodonClient {
            http: self.http.clone(),
            base: api_base(&credentials.instance),
            token: credentials.token.clone(),
        }))
    }
}

/// The instance URL as a directory, so relative joins append to its path.
fn api_base(instance: &Url) -> Url {
    let mut base = instance.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base
}

/// A client acting as the configured account.
pub struct MastodonClient {
    http: reqwest::Client,
    base: Url,
    token: String,
}

impl MastodonClient {
    fn streaming_url(&self, feed: Feed, hashtag: Option<&str>) -> Result<Url, BackendError> {
        let path = match feed {
            Feed::User => "api/v1/streaming/user",
            Feed::Public => "api/v1/streaming/public",
            Feed::Local => "api/v1/streaming/public/local",
            Feed::Hashtag => "api/v1/streaming/hashtag",
        };
        let mut url = self.base.join(path)?;
        if feed == Feed::Hashtag {
            let tag = hashtag
                .filter(|t| !t.is_empty())
                .ok_or(BackendError::MissingHashtag)?;
            url.query_pairs_mut().append_pair("tag", tag);
        }
        Ok(url)
    }

    async fn get(&self, url: Url, accept: &str) -> Result<reqwest::Response, BackendError> {
        let endpoint = url.path().to_owned();
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .header(ACCEPT, accept)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status { endpoint, status });
        }
        Ok(response)
    }
}

#[async_trait]
impl AccountClient for MastodonClient {
    async fn current_account(&self) -> Result<Account, BackendError> {
        let url = self.base.join(VERIFY_CREDENTIALS)?;
        let response = self.get(url, "application/json").await?;
        Ok(response.json::<Account>().await?)
    }

    async fn subscribe(
        &self,
        feed: Feed,
        hashtag: Option<&str>,
    ) -> Result<Subscription, BackendError> {
        let url = self.streaming_url(feed, hashtag)?;
        let response = self.get(url, "text/event-stream").await?;
        let (subscription, feeder) = Subscription::channel();
        tokio::spawn(feed_events(response, feeder, feed));
        Ok(subscription)
    }
}

/// Drain one streaming response into the subscription queue.
async fn feed_events(response: reqwest::Response, feeder: Feeder, feed: Feed) {
    let body = StreamReader::new(response.bytes_stream().map_err(std::io::Error::other));
    let frames = FramedRead::new(body, SseCodec::default());
    tokio::pin!(frames);

    loop {
        let frame = tokio::select! {
            biased;
            () = feeder.stop.cancelled() => break,
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(sse)) => match StreamEvent::decode(&sse.event, &sse.data) {
                Ok(event) => {
                    if !feeder.push(event).await {
                        break;
                    }
                }
                Err(e) => warn!(%feed, event = %sse.event, "undecodable stream event: {e}"),
            },
            Some(Err(e)) => {
                warn!(%feed, "stream read failed: {e}");
                break;
            }
            None => {
                info!(%feed, "stream closed by server");
                break;
            }
        }
    }

    // Dropping the feeder signals `stopped`.
    debug!(%feed, "feeder finished");
}
