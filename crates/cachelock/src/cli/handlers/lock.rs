use std::time::Duration;

use anyhow::{Context, Result};
use cachelock_core::{LockId, ServerReply, ServerRequest};
use clap::ArgMatches;

use crate::{client::LockClient, transport::RpcConnection};

fn server_addr(matches: &ArgMatches) -> Result<&str> {
    matches
        .get_one::<String>("server")
        .map(String::as_str)
        .context("Missing --server")
}

fn lock_id(matches: &ArgMatches) -> Result<LockId> {
    matches
        .get_one::<u64>("lock")
        .copied()
        .map(LockId::new)
        .context("Missing lock ID")
}

async fn call(matches: &ArgMatches, request: ServerRequest) -> Result<ServerReply> {
    let addr = server_addr(matches)?;
    let conn = RpcConnection::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {addr}"))?;
    Ok(conn.call::<_, ServerReply>(&request).await?)
}

pub async fn handle_stat(matches: &ArgMatches) -> Result<()> {
    let lock = lock_id(matches)?;
    match call(matches, ServerRequest::Stat { lock }).await? {
        ServerReply::Stat { grants } => {
            println!("{grants}");
            Ok(())
        }
        ServerReply::Error { message } => anyhow::bail!("Server error: {message}"),
        other => anyhow::bail!("Unexpected reply: {other:?}"),
    }
}

pub async fn handle_inspect(matches: &ArgMatches) -> Result<()> {
    let lock = lock_id(matches)?;
    let snapshot = match call(matches, ServerRequest::Inspect { lock }).await? {
        ServerReply::Inspect { snapshot } => snapshot,
        ServerReply::Error { message } => anyhow::bail!("Server error: {message}"),
        other => anyhow::bail!("Unexpected reply: {other:?}"),
    };

    if matches.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    match snapshot {
        None => println!("lock {lock}: never used"),
        Some(snap) => {
            println!("lock {lock}: {}", snap.state);
            if let Some(owner) = &snap.owner {
                println!("  owner:   {owner}");
            }
            for (pos, waiter) in snap.waiters.iter().enumerate() {
                println!("  waiter {}: {waiter}", pos + 1);
            }
        }
    }
    Ok(())
}

pub async fn handle_hold(matches: &ArgMatches) -> Result<()> {
    let lock = lock_id(matches)?;
    let secs = matches.get_one::<u64>("secs").copied().unwrap_or(1);
    let callback = matches
        .get_one::<String>("callback")
        .map_or("127.0.0.1:0", String::as_str);

    let client = LockClient::connect(server_addr(matches)?, callback).await?;

    client.acquire(lock).await?;
    println!("acquired lock {lock} as {}", client.id());
    tokio::time::sleep(Duration::from_secs(secs)).await;
    client.release(lock).await?;
    client.return_cached().await?;
    println!("released lock {lock}");

    client.shutdown();
    Ok(())
}
