//! Centralized timeout and retry bounds for the coordination loops.
//!
//! Every loop that can suspend the calling thread (joining, verification,
//! store copy, waiting for a role transition) takes its ceiling from here.

use std::time::Duration;

/// Transport-layer read timeout used when `ha.read_timeout` is not configured.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(20);
/// How long an empty node keeps trying to join or found a cluster.
pub const JOIN_DEADLINE: Duration = Duration::from_secs(60);
/// Pause between join attempts while waiting for other machines.
pub const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(300);
/// Backoff between authorship queries while the new master comes up.
pub const VERIFY_BACKOFF: Duration = Duration::from_millis(500);
/// Attempts made to copy a fresh store from the master before giving up.
pub const STORE_COPY_ATTEMPTS: usize = 60;
/// Pause between store copy attempts.
pub const STORE_COPY_DELAY: Duration = Duration::from_secs(1);
/// Subtracted from the read timeout to bound waits for a role transition.
pub const GRAPH_WAIT_SLACK: Duration = Duration::from_secs(5);
/// Lower bound for waits on a role transition.
pub const GRAPH_WAIT_FLOOR: Duration = Duration::from_secs(1);

/// Overridable bounds for the node's suspension points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaTimeouts {
    pub join_deadline: Duration,
    pub join_poll: Duration,
    pub verify_backoff: Duration,
    pub copy_attempts: usize,
    pub copy_delay: Duration,
    /// Explicit bound for the wait-for-graph accessor; derived from the read timeout when unset.
    pub graph_wait: Option<Duration>,
}

impl Default for HaTimeouts {
    fn default() -> Self {
        Self {
            join_deadline: JOIN_DEADLINE,
            join_poll: JOIN_POLL_INTERVAL,
            verify_backoff: VERIFY_BACKOFF,
            copy_attempts: STORE_COPY_ATTEMPTS,
            copy_delay: STORE_COPY_DELAY,
            graph_wait: None,
        }
    }
}

impl HaTimeouts {
    pub fn graph_wait_for(&self, read_timeout: Duration) -> Duration {
        self.graph_wait.unwrap_or_else(|| {
            read_timeout
                .saturating_sub(GRAPH_WAIT_SLACK)
                .max(GRAPH_WAIT_FLOOR)
        })
    }
}
