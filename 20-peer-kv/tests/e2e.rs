use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const TOKEN: &str = "e2e-token";

#[tokio::test]
async fn cli_put_replicates_between_nodes() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("peer_kv");

    let (mut first, first_addr) = spawn_node(&binary, "first", None).await?;
    // The second node knows the first, so its writes flow one way.
    let (mut second, second_addr) = spawn_node(&binary, "second", Some(&first_addr)).await?;

    let put = run_client(&binary, &second_addr, &["put", "fruit", "apple"]).await?;
    assert_eq!(put, "OK version=1");

    let mut replicated = None;
    for _ in 0..50 {
        if let Ok(line) = run_client(&binary, &first_addr, &["get", "fruit"]).await {
            replicated = Some(line);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(replicated.as_deref(), Some("apple (version 1)"));

    let health = run_client(&binary, &first_addr, &["health"]).await?;
    assert_eq!(health, "healthy=true status=OK");

    let deleted = run_client(&binary, &second_addr, &["delete", "fruit"]).await?;
    assert_eq!(deleted, "OK deleted fruit");

    // A miss makes the client exit non-zero.
    assert!(run_client(&binary, &second_addr, &["get", "fruit"]).await.is_err());

    for child in [&mut first.child, &mut second.child] {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
    let _ = first.log_task.await;
    let _ = second.log_task.await;

    Ok(())
}

struct NodeProcess {
    child: Child,
    log_task: tokio::task::JoinHandle<()>,
}

async fn spawn_node(binary: &Path, node_id: &str, peer: Option<&str>) -> Result<(NodeProcess, String)> {
    let mut cmd = Command::new(binary);
    cmd.arg("node")
        .arg("--node-id")
        .arg(node_id)
        .arg("--listen")
        .arg("127.0.0.1:0")
        .env("PEER_KV_AUTH_TOKEN", TOKEN)
        .env("RUST_LOG_STYLE", "never")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if let Some(peer) = peer {
        cmd.arg("--peer").arg(peer);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn node {node_id}"))?;
    let stdout = child
        .stdout
        .take()
        .context("node stdout missing after spawn")?;
    let mut reader = BufReader::new(stdout);
    let addr = read_listen_addr(&mut reader).await?;

    // Drain additional node logs in the background so the pipe never fills.
    let log_task = tokio::spawn(drain_stdout(reader));

    Ok((NodeProcess { child, log_task }, addr))
}

async fn read_listen_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    let line = read_line(reader)
        .await?
        .context("node did not emit listening address")?;
    let trimmed = line.trim();
    if !trimmed.contains("rpc listening on") {
        return Err(anyhow!("unexpected node banner: {trimmed}"));
    }
    let addr = trimmed
        .split_whitespace()
        .last()
        .context("unexpected node banner format")?;
    Ok(addr.to_string())
}

/// Runs one `client` command and returns its single line of output.
async fn run_client(binary: &Path, server: &str, args: &[&str]) -> Result<String> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("--server")
        .arg(server)
        .args(args)
        .env("PEER_KV_AUTH_TOKEN", TOKEN)
        .env("RUST_LOG", "warn")
        .env("RUST_LOG_STYLE", "never")
        .stdin(Stdio::null())
        .stderr(Stdio::null());

    let output = timeout(READ_TIMEOUT, cmd.output())
        .await
        .map_err(|_| anyhow!("client {args:?} timed out"))??;
    if !output.status.success() {
        return Err(anyhow!("client {args:?} exited with {}", output.status));
    }
    let stdout = String::from_utf8(output.stdout)?;
    Ok(stdout.trim_end_matches(['\r', '\n']).to_string())
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let byte_count = match timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(result) => result?,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    if byte_count == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while let Ok(bytes) = reader.read_line(&mut buffer).await {
        if bytes == 0 {
            break;
        }
        buffer.clear();
    }
}
