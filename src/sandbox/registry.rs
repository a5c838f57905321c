//! Registry of live sandboxed process groups.
//!
//! The registry is owned by whoever drives the sandbox (a shard run, a test)
//! and handed to [`ProcessSandbox`](super::ProcessSandbox) explicitly. It
//! carries the cancellation token for that owner and tracks which process
//! groups are currently running, so independent registries never interfere.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::terminate::kill_group_now;

#[derive(Debug, Default)]
struct RegistryInner {
    token: CancellationToken,
    live: Mutex<HashMap<i32, String>>,
}

/// Cancellation scope plus the set of process groups running under it.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<RegistryInner>,
}

impl ProcessRegistry {
    /// Creates a registry with a fresh cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry whose cancellation follows `token`.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                token,
                live: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Requests cancellation of every in-flight and future run.
    pub fn cancel(&self) {
        self.inner.token.cancel();
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Completes when cancellation is requested.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// Returns a clone of the underlying token.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Process groups currently registered, sorted.
    pub fn live_groups(&self) -> Vec<i32> {
        let mut groups: Vec<i32> = self.inner.live.lock().keys().copied().collect();
        groups.sort_unstable();
        groups
    }

    /// Registers a running process group for the lifetime of the lease.
    pub fn register(&self, pgid: i32, label: impl Into<String>) -> GroupLease {
        self.inner.live.lock().insert(pgid, label.into());
        GroupLease {
            registry: self.clone(),
            pgid,
            armed: true,
        }
    }

    /// SIGKILLs every registered group. Last-resort cleanup for shutdown;
    /// returns how many groups were still present.
    pub fn terminate_all(&self) -> usize {
        let groups: Vec<(i32, String)> = self.inner.live.lock().drain().collect();
        let mut hit = 0;
        for (pgid, label) in groups {
            if kill_group_now(pgid) {
                info!(pgid, label = %label, "Killed process group during shutdown");
                hit += 1;
            }
        }
        hit
    }

    fn deregister(&self, pgid: i32) {
        self.inner.live.lock().remove(&pgid);
    }
}

/// Scoped registration of one process group.
///
/// Dropping an armed lease (the run future was dropped mid-wait, or an error
/// path returned early) SIGKILLs the group before deregistering it.
#[derive(Debug)]
pub struct GroupLease {
    registry: ProcessRegistry,
    pgid: i32,
    armed: bool,
}

impl GroupLease {
    /// The registered process group id.
    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    /// Marks the group as already torn down and deregisters it.
    pub fn release(mut self) {
        self.armed = false;
    }
}

impl Drop for GroupLease {
    fn drop(&mut self) {
        if self.armed {
            warn!(pgid = self.pgid, "Sandbox run abandoned, killing process group");
            kill_group_now(self.pgid);
        }
        self.registry.deregister(self.pgid);
    }
}
