use anyhow::Result;
use cachelock::cli::build_cli;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let matches = build_cli().get_matches();
    cachelock::cli::handlers::dispatch(&matches).await
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {e}"))
}
