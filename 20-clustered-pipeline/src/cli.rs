use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a node: client listener, pipeline stages and raft peer transport.
    Serve(ServeArgs),
    /// Validate a configuration file and print the resulting topology.
    CheckConfig(CheckConfigArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// JSON configuration file. A single-node development setup is used when omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the client-facing listen address from the configuration.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Override the raft peer listen address. Defaults to the node's host:port.
    #[arg(long)]
    pub raft_listen: Option<SocketAddr>,
}

#[derive(Args, Debug, Clone)]
pub struct CheckConfigArgs {
    #[arg(long)]
    pub config: PathBuf,
}
