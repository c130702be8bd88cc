use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use clustered_pipeline::{
    cli::{CheckConfigArgs, Cli, Command, ServeArgs},
    config::ClusterConfig,
    server::{Node, Server},
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await?,
        Command::CheckConfig(args) => check_config(args)?,
    }

    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ClusterConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ClusterConfig::development(),
    };
    if let Some(listen) = args.listen {
        config.server.listen = listen.to_string();
    }

    let raft_addr = match args.raft_listen {
        Some(addr) => addr.to_string(),
        None => config.node.address(),
    };
    let raft_listener = std::net::TcpListener::bind(&raft_addr)
        .with_context(|| format!("failed to bind raft transport on {raft_addr}"))?;
    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;

    let node = tokio::task::block_in_place(|| Node::start(&config, raft_listener))?;
    let server = Server::new(listener, node);
    info!(
        node_id = config.node.id,
        "listening on {}",
        server.local_addr()?
    );
    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("server exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}

fn check_config(args: CheckConfigArgs) -> Result<()> {
    let config = ClusterConfig::from_file(&args.config)
        .with_context(|| format!("invalid config {}", args.config.display()))?;
    let topology = config.topology()?;
    println!("node {} at {} ({})", config.node.id, config.node.address(), config.node.role);
    for node in topology.nodes() {
        println!("  {:>4}  {:<21}  {}", node.id, node.address(), node.role);
    }
    println!("congress: {:?}", topology.congress());
    println!("gateways: {:?}", topology.gateways());
    Ok(())
}
