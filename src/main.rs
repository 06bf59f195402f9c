//! llm-relay - HTTP server entry point.

use llm_relay::{api, Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Fatal init failures (missing admin token, unreadable database) exit
    // non-zero through the error return.
    let config = Config::from_env()?;
    info!(
        db = %config.db_path.display(),
        channel = %config.pubsub_channel,
        "Loaded configuration"
    );

    api::serve(config).await?;

    Ok(())
}
