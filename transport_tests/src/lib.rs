//! Helpers shared by the socket-level tests.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use transport_server::Server;
use transport_shared::{config::TransportConfig, event::TransportEvent};

/// Upper bound for any single expected event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Installs a test-writer subscriber once per binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

/// Starts a loopback server on ephemeral ports, wired to a channel.
pub async fn start_loopback(
    cfg: TransportConfig,
    stable_threads: usize,
) -> anyhow::Result<(Server, UnboundedReceiver<TransportEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut server = Server::new(cfg, Arc::new(tx));
    server.start(0, 0, stable_threads).await?;
    Ok((server, rx))
}

/// Next event, or an error after `EVENT_TIMEOUT`.
pub async fn next_event(
    rx: &mut UnboundedReceiver<TransportEvent>,
) -> anyhow::Result<TransportEvent> {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .context("timed out waiting for event")?
        .ok_or_else(|| anyhow!("event channel closed"))
}

/// Skips events until one matches.
pub async fn wait_for<F>(
    rx: &mut UnboundedReceiver<TransportEvent>,
    mut matches: F,
) -> anyhow::Result<TransportEvent>
where
    F: FnMut(&TransportEvent) -> bool,
{
    loop {
        let event = next_event(rx).await?;
        if matches(&event) {
            return Ok(event);
        }
    }
}

/// Polls `condition` until it holds or `EVENT_TIMEOUT` passes.
pub async fn wait_until<F>(mut condition: F) -> anyhow::Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("condition not reached in {EVENT_TIMEOUT:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}
