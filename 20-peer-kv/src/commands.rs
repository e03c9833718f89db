//! The `client` and `demo` subcommands.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};

use crate::cli::{ClientAction, ClientArgs, DemoArgs};
use crate::client::RpcClient;

pub async fn run_client(args: ClientArgs) -> Result<()> {
    let mut client = RpcClient::connect(&args.server).await?;
    let token = Some(args.token.as_str());

    match args.action {
        ClientAction::Authenticate { api_key } => {
            let response = client.authenticate(&api_key).await?;
            if !response.success {
                bail!(response.error.unwrap_or_else(|| "authentication failed".into()));
            }
            println!("{}", response.token);
        }
        ClientAction::Get { key } => {
            let response = client.get(&key, token).await?;
            if !response.found {
                bail!(response.error.unwrap_or_else(|| format!("key not found: {key}")));
            }
            println!("{} (version {})", response.value, response.version);
        }
        ClientAction::Put { key, value, version } => {
            let response = client.put(&key, &value, token, version).await?;
            if !response.success {
                bail!(response.error.unwrap_or_else(|| "put failed".into()));
            }
            println!("OK version={}", response.new_version);
        }
        ClientAction::Delete { key } => {
            let response = client.delete(&key, token).await?;
            if !response.success {
                bail!(response.error.unwrap_or_else(|| "delete failed".into()));
            }
            println!("OK deleted {key}");
        }
        ClientAction::Health => {
            let response = client.health_check().await?;
            println!("healthy={} status={}", response.healthy, response.status);
        }
        ClientAction::Metadata => {
            let response = client.get_metadata().await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }

    client.shutdown().await
}

const DEMO_ENTRIES: [(&str, &str); 3] = [
    ("user:1", "alice"),
    ("user:2", "bob"),
    ("config:mode", "replicated"),
];

/// Writes through the first node, then checks every node sees the writes
/// and later the delete.
pub async fn run_demo(args: DemoArgs) -> Result<()> {
    let settle = Duration::from_millis(args.settle_ms);
    let token = Some(args.token.as_str());
    let (writer_addr, _) = args
        .nodes
        .split_first()
        .ok_or_else(|| anyhow!("demo needs at least one --node"))?;

    let mut writer = RpcClient::connect(writer_addr).await?;
    println!("== put via {writer_addr}");
    for (key, value) in DEMO_ENTRIES {
        let response = writer.put(key, value, token, 0).await?;
        if !response.success {
            bail!("put {key} failed: {}", response.error.unwrap_or_default());
        }
        println!("put {key}={value} version={}", response.new_version);
    }

    tokio::time::sleep(settle).await;

    let mut missing = 0;
    for addr in &args.nodes {
        let mut reader = RpcClient::connect(addr).await?;
        println!("== read from {addr}");
        for (key, expected) in DEMO_ENTRIES {
            let response = reader.get(key, token).await?;
            if response.found && response.value == expected {
                println!("{key}={} version={}", response.value, response.version);
            } else {
                missing += 1;
                println!("{key} missing");
            }
        }
        reader.shutdown().await?;
    }

    let (deleted, _) = DEMO_ENTRIES[0];
    println!("== delete {deleted} via {writer_addr}");
    let response = writer.delete(deleted, token).await?;
    if !response.success {
        bail!("delete {deleted} failed: {}", response.error.unwrap_or_default());
    }
    writer.shutdown().await?;

    tokio::time::sleep(settle).await;

    let mut lingering = 0;
    for addr in &args.nodes {
        let mut reader = RpcClient::connect(addr)
            .await
            .with_context(|| format!("reconnecting to {addr}"))?;
        let response = reader.get(deleted, token).await?;
        if response.found {
            lingering += 1;
            println!("{addr}: {deleted} still present");
        } else {
            println!("{addr}: {deleted} gone");
        }
        reader.shutdown().await?;
    }

    if missing > 0 || lingering > 0 {
        bail!("demo saw {missing} missing and {lingering} lingering entries");
    }
    println!("== all nodes agree");
    Ok(())
}
