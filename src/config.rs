//! Overlay configuration.
//!
//! The routing table *shape* (identifier width and digit base) is fixed
//! at compile time in [`crate::id`]; everything temporal or capacity-
//! related is tunable here. Defaults are production values; tests dial
//! the timings down.

use std::time::Duration;

/// Default leaf-set size.
const DEFAULT_LEAVES: usize = 32;

/// Default heartbeat period.
const DEFAULT_BEAT_PERIOD: Duration = Duration::from_secs(1);

/// Default missed heartbeats before a peer is declared dead.
const DEFAULT_KILL_TICKS: u64 = 3;

/// Default quiet period before the overlay first reports stable.
const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default quiet period before later stability reports.
const DEFAULT_CONV_TIMEOUT: Duration = Duration::from_secs(1);

/// Default worker count for state broadcasts.
const DEFAULT_EXCH_WORKERS: usize = 16;

/// Default bound on a single dial attempt.
const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default capacity of the manager's inbound queues and of per-peer
/// outbound queues.
const DEFAULT_QUEUE: usize = 64;

/// Tunable overlay parameters.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Leaf-set size `L`. Must be even and positive: the window keeps
    /// `L/2` neighbors on each side of the local id.
    pub leaves: usize,
    /// Interval between heartbeats to every pooled peer.
    pub beat_period: Duration,
    /// Heartbeats a peer may miss before being declared dead.
    pub kill_ticks: u64,
    /// Quiet time after boot before the stability latch first releases.
    pub boot_timeout: Duration,
    /// Quiet time after convergence before the latch releases again.
    pub conv_timeout: Duration,
    /// Concurrent workers broadcasting state after a commit.
    pub exch_workers: usize,
    /// Upper bound on a single dial/authentication attempt.
    pub auth_timeout: Duration,
    /// Capacity of the state-update queue.
    pub update_queue: usize,
    /// Capacity of the drop queue.
    pub drop_queue: usize,
    /// Capacity of each peer's outbound queue.
    pub peer_queue: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            leaves: DEFAULT_LEAVES,
            beat_period: DEFAULT_BEAT_PERIOD,
            kill_ticks: DEFAULT_KILL_TICKS,
            boot_timeout: DEFAULT_BOOT_TIMEOUT,
            conv_timeout: DEFAULT_CONV_TIMEOUT,
            exch_workers: DEFAULT_EXCH_WORKERS,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            update_queue: DEFAULT_QUEUE,
            drop_queue: DEFAULT_QUEUE,
            peer_queue: DEFAULT_QUEUE,
        }
    }
}

impl OverlayConfig {
    /// Check structural constraints the maintenance loops rely on.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.leaves == 0 || self.leaves % 2 != 0 {
            anyhow::bail!("leaf-set size must be even and positive, got {}", self.leaves);
        }
        if self.kill_ticks == 0 {
            anyhow::bail!("kill_ticks must be positive");
        }
        if self.exch_workers == 0 {
            anyhow::bail!("exch_workers must be positive");
        }
        if self.update_queue == 0 || self.drop_queue == 0 || self.peer_queue == 0 {
            anyhow::bail!("queue capacities must be positive");
        }
        Ok(())
    }
}
