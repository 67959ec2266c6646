use std::sync::Arc;

use tracing::info;

use tootbridge::config::Config;
use tootbridge::gateway::server;
use tootbridge::mastodon::client::MastodonBackend;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Config::load()?;
    info!(instance = %config.credentials.instance, "tootbridge: Mastodon timelines over IRC");

    let backend = MastodonBackend::new()?;
    server::run(Arc::new(config), Arc::new(backend)).await
}
