//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p transport_server -- [--config server.json] [--bind 0.0.0.0]
//!       [--udp-port 40000] [--tcp-port 40001] [--threads 4]
//!
//! Flags override values loaded from `--config`. Every transport event is
//! logged; Ctrl-C stops the server.

use std::{env, sync::Arc};

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{debug, info};
use transport_server::Server;
use transport_shared::{config::TransportConfig, event::TransportEvent};

fn parse_args() -> anyhow::Result<TransportConfig> {
    let args: Vec<String> = env::args().collect();

    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => TransportConfig::from_json_file(&args[i + 1])?,
        _ => TransportConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" if i + 1 < args.len() => {
                cfg.bind_ip = args[i + 1].parse().context("--bind")?;
                i += 2;
            }
            "--udp-port" if i + 1 < args.len() => {
                cfg.udp_port = args[i + 1].parse().context("--udp-port")?;
                i += 2;
            }
            "--tcp-port" if i + 1 < args.len() => {
                cfg.tcp_port = args[i + 1].parse().context("--tcp-port")?;
                i += 2;
            }
            "--threads" if i + 1 < args.len() => {
                cfg.stable_threads = args[i + 1].parse().context("--threads")?;
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

fn log_event(event: &TransportEvent) {
    match event {
        TransportEvent::StableConnected { addr } => info!(%addr, "Client connected"),
        TransportEvent::StableDisconnected { addr } => info!(%addr, "Client disconnected"),
        TransportEvent::StableMessage { addr, payload } => {
            info!(%addr, len = payload.len(), "Stable message")
        }
        TransportEvent::UnstableMessage {
            addr,
            header,
            payload,
            lost_receive_packets,
            lost_sent_packets,
        } => debug!(
            %addr,
            packet_index = header.packet_index,
            len = payload.len(),
            lost_receive = lost_receive_packets,
            lost_sent = lost_sent_packets,
            "Unstable message"
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(
        bind = %cfg.bind_ip,
        udp_port = cfg.udp_port,
        tcp_port = cfg.tcp_port,
        threads = cfg.stable_threads,
        "Starting server"
    );

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut server = Server::new(cfg, Arc::new(events_tx));
    server.start_from_config().await.context("start server")?;

    let logger = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            log_event(&event);
        }
    });

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!(connections = server.connection_count(), "Shutting down");
    server.stop().await?;

    // The sender lives in the server; dropping it ends the logger.
    drop(server);
    let _ = logger.await;
    Ok(())
}
