//! Logical op times for ordering transaction events.
//!
//! An [`OpTime`] is a hybrid timestamp: microseconds of wall-clock time plus a
//! logical counter that keeps values unique when the wall clock stalls. Start
//! times, prepare timestamps, commit timestamps and garbage-collection deadlines
//! are all expressed as op times so they share a single total order.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Hybrid logical timestamp.
///
/// Ordering is by physical time first, then by the logical counter.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct OpTime {
    /// Microseconds since the Unix epoch
    pub physical: u64,
    /// Tie breaker within one physical tick
    pub logical: u32,
}

impl OpTime {
    /// The null op time, earlier than every op time a clock hands out.
    pub const NULL: OpTime = OpTime::new(0, 0);

    pub const fn new(physical: u64, logical: u32) -> Self {
        Self { physical, logical }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Op time `duration` later, with the logical counter reset.
    pub fn add(&self, duration: Duration) -> Self {
        Self::new(
            self.physical.saturating_add(duration.as_micros() as u64),
            0,
        )
    }

    /// Elapsed wall time between two op times (zero if `earlier` is later).
    pub fn since(&self, earlier: &OpTime) -> Duration {
        Duration::from_micros(self.physical.saturating_sub(earlier.physical))
    }

    /// Parse the `physical.logical` display form.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (physical, logical) = s
            .split_once('.')
            .ok_or_else(|| format!("Invalid op time: {} (expected physical.logical)", s))?;

        let physical = physical
            .parse()
            .map_err(|_| format!("Invalid physical component: {}", physical))?;
        let logical = logical
            .parse()
            .map_err(|_| format!("Invalid logical component: {}", logical))?;

        Ok(Self::new(physical, logical))
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.physical, self.logical)
    }
}

/// Source of strictly increasing op times for one node.
pub struct OpTimeClock {
    last: Mutex<OpTime>,
}

impl OpTimeClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(OpTime::NULL),
        }
    }

    /// Clock whose first reading is no earlier than `floor`.
    pub fn starting_at(floor: OpTime) -> Self {
        Self {
            last: Mutex::new(floor),
        }
    }

    /// Hand out the next op time.
    pub fn now(&self) -> OpTime {
        let physical = wall_micros();
        let mut last = self.last.lock();

        let next = if physical > last.physical {
            OpTime::new(physical, 0)
        } else {
            OpTime::new(last.physical, last.logical + 1)
        };

        *last = next;
        next
    }

    /// Merge an op time observed from another node, so later readings order
    /// after it.
    pub fn advance(&self, received: OpTime) -> OpTime {
        let mut last = self.last.lock();
        if received > *last {
            *last = received;
        }
        *last
    }

    /// Most recent op time handed out or observed.
    pub fn last(&self) -> OpTime {
        *self.last.lock()
    }
}

impl Default for OpTimeClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Clock shared between the services of one node.
pub type SharedClock = Arc<OpTimeClock>;

fn wall_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
