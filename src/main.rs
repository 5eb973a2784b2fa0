//! pagehist - historical web-page capture engine.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pagehist::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging based on verbosity; the progress line lives on
    // stderr too, so default to warnings only.
    let default_filter = if cli::is_verbose() {
        "pagehist=info"
    } else {
        "pagehist=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    cli::run().await
}
