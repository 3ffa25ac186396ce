//! ringnode
//!
//! Runs one ring member. The node asks the tracker for its public address and
//! a live member, joins (or founds) the ring, and serves requests until
//! interrupted, at which point it hands its range to a neighbour and exits.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use ringnode::{NetTransport, Node, NodeConfig, TracingEmitter};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "ringnode")]
#[command(about = "Member node of a ring-structured key-value store")]
struct Cli {
    /// Tracker IPv4 address
    tracker_addr: Ipv4Addr,
    /// Tracker UDP port
    tracker_port: u16,
    /// Heartbeat interval in milliseconds
    #[arg(long, env = "RING_HEARTBEAT_MS")]
    heartbeat_ms: Option<u64>,
    /// Local address to bind every socket to
    #[arg(long, env = "RING_BIND_IP")]
    bind: Option<Ipv4Addr>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let mut config = NodeConfig::from_env();
    if let Some(ms) = cli.heartbeat_ms.filter(|ms| *ms > 0) {
        config.heartbeat_interval = Duration::from_millis(ms);
    }
    if let Some(ip) = cli.bind {
        config.bind_ip = ip;
    }

    let tracker = SocketAddrV4::new(cli.tracker_addr, cli.tracker_port);
    info!(%tracker, heartbeat = ?config.heartbeat_interval, "starting ringnode");

    let transport = NetTransport::new(config.clone());
    let interrupter = transport.interrupter();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, leaving the ring");
                interrupter.interrupt();
            }
            Err(e) => warn!(error = %e, "cannot listen for interrupts"),
        }
    });

    let mut node =
        Node::new(transport, tracker, config).with_debug_emitter(Box::new(TracingEmitter));
    node.run().await.context("node failed")?;

    Ok(())
}
