use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use peer_kv::{
    cli::{Cli, Command, NodeArgs},
    commands, node,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Node(args) => run_node(args).await?,
        Command::Client(args) => commands::run_client(args).await?,
        Command::Demo(args) => commands::run_demo(args).await?,
    }

    Ok(())
}

async fn run_node(args: NodeArgs) -> Result<()> {
    let plan = args.resolve()?;
    let handle = node::bind_and_spawn(&plan.listen, plan.http.as_deref(), plan.config).await?;

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err:?}");
    }
    info!("shutting down");
    handle.shutdown().await
}
