//! Worker pools keyed by role.
//!
//! A pool is a fixed-capacity group of long-running workers spawned on the
//! ambient tokio runtime. Workers are fire-and-forget: `push` returns
//! immediately and the pool is only observed again through `join_pool` (wait
//! for every worker to return) or `stop_pool` (abort them).

use std::{collections::HashMap, fmt, future::Future};

use anyhow::bail;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Role of the workers in a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Accepts stream connections and receives datagrams.
    Listener,
    /// Drives the read state machines of assigned stream connections.
    StableProcessor,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Listener => write!(f, "listener"),
            PoolKind::StableProcessor => write!(f, "stable-processor"),
        }
    }
}

struct Pool {
    capacity: usize,
    workers: JoinSet<()>,
}

/// Set of worker pools.
#[derive(Default)]
pub struct WorkerPool {
    pools: HashMap<PoolKind, Pool>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pool of `count` workers.
    pub fn start_pool(&mut self, kind: PoolKind, count: usize) -> anyhow::Result<()> {
        if count == 0 {
            bail!("{kind} pool needs at least one worker");
        }
        if self.pools.contains_key(&kind) {
            bail!("{kind} pool already started");
        }
        self.pools.insert(
            kind,
            Pool {
                capacity: count,
                workers: JoinSet::new(),
            },
        );
        debug!(%kind, count, "Worker pool started");
        Ok(())
    }

    /// Spawns `job` as one worker of the `kind` pool.
    ///
    /// Must be called from within a tokio runtime.
    pub fn push<F>(&mut self, kind: PoolKind, job: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(pool) = self.pools.get_mut(&kind) else {
            bail!("{kind} pool not started");
        };
        if pool.workers.len() >= pool.capacity {
            bail!("{kind} pool is full ({} workers)", pool.capacity);
        }
        pool.workers.spawn(job);
        Ok(())
    }

    /// Waits for every worker of the pool to return, then removes the pool.
    pub async fn join_pool(&mut self, kind: PoolKind) -> anyhow::Result<()> {
        let Some(mut pool) = self.pools.remove(&kind) else {
            bail!("{kind} pool not started");
        };
        while let Some(joined) = pool.workers.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    warn!(%kind, error = %e, "Worker panicked");
                }
            }
        }
        debug!(%kind, "Worker pool joined");
        Ok(())
    }

    /// Aborts every worker of the pool and removes it.
    pub async fn stop_pool(&mut self, kind: PoolKind) -> anyhow::Result<()> {
        let Some(mut pool) = self.pools.remove(&kind) else {
            bail!("{kind} pool not started");
        };
        pool.workers.shutdown().await;
        debug!(%kind, "Worker pool stopped");
        Ok(())
    }

    /// Number of live workers in the pool, `None` if it is not started.
    pub fn worker_count(&self, kind: PoolKind) -> Option<usize> {
        self.pools.get(&kind).map(|pool| pool.workers.len())
    }

    /// Total live workers across all pools.
    pub fn total_workers(&self) -> usize {
        self.pools.values().map(|pool| pool.workers.len()).sum()
    }
}
