//! link-daemon: One process of a distributed system.
//!
//! Runs the Fair-Loss / Stubborn / Perfect link stack and a Perfect Failure
//! Detector, logs every delivery and crash notification, and optionally
//! sends demo messages to random peers.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, info_span, warn};
use tracing_subscriber::EnvFilter;

use link_core::{Link, LinkStack, spawn_dispatch};
use link_daemon::{Args, demo};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,link_core=debug,link_daemon=debug"
    } else {
        "info,link_core=info,link_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = args.link_config()?;
    let addresses = args.address_table()?;
    let peers: Vec<_> = addresses.ids().cloned().collect();

    info!("Starting link-daemon as process {}", args.id);
    info!("Listen address: {}", config.listen);
    for peer in &peers {
        if let Some(addr) = addresses.get(peer) {
            info!("Peer {} at {}", peer, addr);
        }
    }

    let mut stack = LinkStack::bind(args.id.clone(), addresses, config)
        .await
        .context("Failed to start link stack")?;
    let detector = stack.start_detector()?;
    let tasks = stack.tasks().clone();

    let deliveries = stack.perfect().deliver_events()?;
    spawn_dispatch(
        &tasks,
        info_span!("app", pid = %args.id, worker = "deliveries"),
        deliveries,
        |sender, message| {
            info!("Delivered {} from {}", message, sender);
            Ok::<_, std::convert::Infallible>(())
        },
    );

    let mut crashes = detector.crash_events()?;
    let token = tasks.token();
    tasks.spawn(
        info_span!("app", pid = %args.id, worker = "crashes"),
        async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    crashed = crashes.recv() => match crashed {
                        Some(peer) => warn!("Process {} crashed", peer),
                        None => break,
                    },
                }
            }
        },
    );

    if args.demo_messages > 0 {
        tasks.spawn(
            info_span!("app", pid = %args.id, worker = "demo"),
            demo::run(
                stack.perfect().clone(),
                peers,
                args.demo_messages,
                args.demo_interval(),
                tasks.token(),
            ),
        );
    }

    info!("Daemon running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutdown signal received");

    stack.shutdown().await;
    info!("Shut down");
    Ok(())
}
