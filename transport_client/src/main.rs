//! Standalone traffic generator.
//!
//! Usage:
//!   cargo run -p transport_client -- [--host 127.0.0.1] [--udp-port 40000]
//!       [--tcp-port 40001] [--count 100] [--interval-ms 10] [--drop-rate 0.1]
//!
//! Sends `count` stable frames and `count` datagrams. Each datagram is
//! skipped with probability `drop-rate` so the server's loss counters move.

use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::{bail, Context};
use rand::Rng;
use tracing::info;
use transport_client::{StableClient, UnstableClient};

struct Args {
    host: IpAddr,
    udp_port: u16,
    tcp_port: u16,
    count: u32,
    interval: Duration,
    drop_rate: f64,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            udp_port: 40000,
            tcp_port: 40001,
            count: 100,
            interval: Duration::from_millis(10),
            drop_rate: 0.0,
        }
    }
}

fn parse_args() -> anyhow::Result<Args> {
    let mut parsed = Args::default();
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--host" if i + 1 < args.len() => {
                parsed.host = args[i + 1].parse().context("--host")?;
                i += 2;
            }
            "--udp-port" if i + 1 < args.len() => {
                parsed.udp_port = args[i + 1].parse().context("--udp-port")?;
                i += 2;
            }
            "--tcp-port" if i + 1 < args.len() => {
                parsed.tcp_port = args[i + 1].parse().context("--tcp-port")?;
                i += 2;
            }
            "--count" if i + 1 < args.len() => {
                parsed.count = args[i + 1].parse().context("--count")?;
                i += 2;
            }
            "--interval-ms" if i + 1 < args.len() => {
                let millis = args[i + 1].parse().context("--interval-ms")?;
                parsed.interval = Duration::from_millis(millis);
                i += 2;
            }
            "--drop-rate" if i + 1 < args.len() => {
                parsed.drop_rate = args[i + 1].parse().context("--drop-rate")?;
                i += 2;
            }
            _ => i += 1,
        }
    }
    if !(0.0..=1.0).contains(&parsed.drop_rate) {
        bail!("--drop-rate must be within 0..=1");
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args()?;
    let stable_addr = SocketAddr::new(args.host, args.tcp_port);
    let unstable_addr = SocketAddr::new(args.host, args.udp_port);
    let bind = match args.host {
        IpAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        IpAddr::V6(_) => SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0)),
    };

    let mut stable = StableClient::connect(stable_addr)
        .await
        .context("connect stable channel")?;
    let mut unstable = UnstableClient::connect(bind, unstable_addr)
        .await
        .context("open unstable channel")?;
    info!(
        stable = %stable_addr,
        unstable = %unstable_addr,
        local = %unstable.local_addr()?,
        count = args.count,
        drop_rate = args.drop_rate,
        "Client connected"
    );

    let mut rng = rand::thread_rng();
    let mut dropped = 0u32;
    for seq in 0..args.count {
        stable
            .send(format!("stable {seq}").as_bytes())
            .await
            .context("send stable frame")?;

        if rng.gen_bool(args.drop_rate) {
            unstable.skip();
            dropped += 1;
        } else {
            unstable
                .send(format!("unstable {seq}").as_bytes())
                .await
                .context("send datagram")?;
        }
        tokio::time::sleep(args.interval).await;
    }

    stable.shutdown().await?;
    info!(sent = args.count, dropped, "Done");
    Ok(())
}
