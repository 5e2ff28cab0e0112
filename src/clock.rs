use std::cmp::Ordering;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Remote timestamps further ahead of the local wall clock than this are
/// clamped before they are merged, so a skewed peer cannot drag the local
/// clock arbitrarily far into the future.
pub const DEFAULT_MAX_DRIFT: Duration = Duration::from_secs(60);

/// Hybrid logical clock timestamp: wall-clock milliseconds plus a logical
/// counter that disambiguates events within the same millisecond, plus the
/// originating node id as the final tie-breaker.
///
/// The total order is `(physical, logical, node_id)`; two distinct nodes can
/// never produce equal timestamps.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HlcTimestamp {
    pub physical: i64,
    pub logical: i32,
    pub node_id: String,
}

impl HlcTimestamp {
    pub fn new(physical: i64, logical: i32, node_id: impl Into<String>) -> Self {
        Self {
            physical,
            logical,
            node_id: node_id.into(),
        }
    }

    /// Byte rendering folded into the oplog hash chain: physical LE, logical
    /// LE, then the raw node id bytes.
    pub fn to_chain_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(12 + self.node_id.len());
        bytes.extend_from_slice(&self.physical.to_le_bytes());
        bytes.extend_from_slice(&self.logical.to_le_bytes());
        bytes.extend_from_slice(self.node_id.as_bytes());
        bytes
    }
}

impl PartialOrd for HlcTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HlcTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.physical
            .cmp(&other.physical)
            .then_with(|| self.logical.cmp(&other.logical))
            .then_with(|| self.node_id.as_bytes().cmp(other.node_id.as_bytes()))
    }
}

impl fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.physical, self.logical, self.node_id)
    }
}

fn wall_clock_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as i64
}

struct HlcState {
    physical: i64,
    logical: i32,
}

/// Process-local hybrid logical clock.
///
/// Every timestamp handed out by [`HlcClock::tick`] is strictly greater than
/// the previous one, and [`HlcClock::observe`] merges remote timestamps so
/// causality is preserved across nodes.
pub struct HlcClock {
    node_id: String,
    max_drift: Duration,
    state: Mutex<HlcState>,
}

impl HlcClock {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self::with_max_drift(node_id, DEFAULT_MAX_DRIFT)
    }

    pub fn with_max_drift(node_id: impl Into<String>, max_drift: Duration) -> Self {
        Self {
            node_id: node_id.into(),
            max_drift,
            state: Mutex::new(HlcState {
                physical: 0,
                logical: 0,
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Emits the timestamp for a local event.
    pub fn tick(&self) -> HlcTimestamp {
        let now = wall_clock_millis();
        let mut state = self.state.lock().unwrap();
        if now > state.physical {
            state.physical = now;
            state.logical = 0;
        } else {
            state.logical += 1;
        }
        HlcTimestamp::new(state.physical, state.logical, self.node_id.clone())
    }

    /// Merges a remote timestamp and emits the timestamp acknowledging it.
    ///
    /// A remote physical component more than `max_drift` ahead of the local
    /// wall clock is clamped before the merge rule runs.
    pub fn observe(&self, remote: &HlcTimestamp) -> HlcTimestamp {
        let now = wall_clock_millis();
        let ceiling = now + self.max_drift.as_millis() as i64;
        let remote_physical = if remote.physical > ceiling {
            log::warn!(
                "clamping remote clock from {} ({}ms ahead of local wall clock)",
                remote.node_id,
                remote.physical - now
            );
            ceiling
        } else {
            remote.physical
        };

        let mut state = self.state.lock().unwrap();
        let physical = now.max(state.physical).max(remote_physical);
        let logical = if physical == state.physical && physical == remote_physical {
            state.logical.max(remote.logical) + 1
        } else if physical == state.physical {
            state.logical + 1
        } else if physical == remote_physical {
            remote.logical + 1
        } else {
            0
        };

        state.physical = physical;
        state.logical = logical;
        HlcTimestamp::new(physical, logical, self.node_id.clone())
    }

    /// Restores clock state from durable storage so restarts never reissue
    /// timestamps at or below the persisted head.
    pub fn restore(&self, head: &HlcTimestamp) {
        let mut state = self.state.lock().unwrap();
        if head.physical > state.physical
            || (head.physical == state.physical && head.logical > state.logical)
        {
            state.physical = head.physical;
            state.logical = head.logical;
        }
    }

    /// Current head without advancing the clock.
    pub fn head(&self) -> HlcTimestamp {
        let state = self.state.lock().unwrap();
        HlcTimestamp::new(state.physical, state.logical, self.node_id.clone())
    }
}
