//! Magnetite - a Raft-replicated in-memory key-value store
//!
//! This is the main entry point for the Magnetite server.
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use magnetite::config::{NodeAddress, NodeConfig};
use magnetite::{RaftNode, Server, Store};

/// Magnetite - a Raft-replicated in-memory key-value store
///
/// Writes go to the leader, replicate to a majority, and apply in log
/// order on every replica.
#[derive(Parser, Debug)]
#[command(name = "magnetite")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Unique node id (nonzero)
    #[arg(long = "id", value_name = "ID", env = "MAGNETITE_NODE_ID")]
    id: u32,

    /// Address to bind and advertise to peers
    #[arg(
        short = 'b',
        long = "bind",
        value_name = "ADDR",
        env = "MAGNETITE_BIND",
        default_value = "127.0.0.1"
    )]
    bind: String,

    /// Port to listen on
    #[arg(
        short = 'p',
        long = "port",
        value_name = "PORT",
        env = "MAGNETITE_PORT",
        default_value_t = 5250
    )]
    port: u16,

    /// Bootstrap a fresh single-node cluster and become leader
    #[arg(long = "init", conflicts_with = "join")]
    init: bool,

    /// Start with a fresh log and wait to be added to an existing cluster
    #[arg(long = "join")]
    join: bool,

    /// Raft log file path (defaults to magnetite-log-<id>.db)
    #[arg(long = "raft-log", value_name = "FILE", env = "MAGNETITE_RAFT_LOG")]
    raft_log: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error
    #[arg(
        short = 'l',
        long = "log-level",
        value_name = "LEVEL",
        env = "MAGNETITE_LOG_LEVEL",
        default_value = "info"
    )]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = NodeConfig::new(cli.id, NodeAddress::new(cli.bind.clone(), cli.port));
    config.init = cli.init;
    config.join = cli.join;
    config.raft_log_path = cli.raft_log.clone();

    if let Err(e) = run(config).await {
        error!(error = %e, "server failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(config: NodeConfig) -> magnetite::Result<()> {
    let store = Arc::new(Store::new());
    let node = RaftNode::new(&config, store)?;
    let mut handle = node.handle();
    let _raft_thread = node.start()?;

    let listener = TcpListener::bind((config.addr.host.as_str(), config.addr.port)).await?;
    info!(
        node_id = config.node_id,
        addr = %config.addr,
        "magnetite node started"
    );

    let server = Server::new(handle.clone());
    tokio::select! {
        result = server.run(listener) => result,
        _ = handle.wait_shutdown() => {
            info!("raft node stopped, exiting");
            Ok(())
        }
    }
}
