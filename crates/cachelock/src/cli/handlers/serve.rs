use std::path::Path;

use anyhow::{Context, Result};
use cachelock_core::load_config;
use clap::ArgMatches;

use crate::server;

pub async fn handle(matches: &ArgMatches) -> Result<()> {
    let config_path = matches.get_one::<String>("config").map(Path::new);
    let mut config = load_config(config_path)
        .await
        .context("Failed to load configuration")?;

    if let Some(listen) = matches.get_one::<String>("listen") {
        config.server.listen.clone_from(listen);
        config.validate()?;
    }

    let (addr, _server, task) = server::spawn(&config).await?;
    println!("cachelock listening on {addr}");

    tokio::select! {
        result = task => {
            result.context("Lock server task failed")?;
            anyhow::bail!("Lock server stopped unexpectedly");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to wait for Ctrl-C")?;
            tracing::info!("shutting down");
        }
    }

    Ok(())
}
