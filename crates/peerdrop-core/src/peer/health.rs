//! Keepalive accounting for connected sessions.

/// Outcome of a keepalive tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveVerdict {
    /// Link considered alive
    Healthy,
    /// Missed-keepalive threshold reached
    Dead,
}

/// Counts consecutive missed keepalives.
///
/// A tick counts as missed when the keepalive could not be sent or when
/// nothing at all arrived from the peer since the previous tick. Any inbound
/// traffic resets the count.
#[derive(Debug, Clone)]
pub struct KeepaliveMonitor {
    missed: u32,
    max_missed: u32,
    inbound_since_tick: bool,
}

impl KeepaliveMonitor {
    /// Create a monitor; the first tick is not penalized.
    #[must_use]
    pub fn new(max_missed: u32) -> Self {
        Self {
            missed: 0,
            max_missed,
            inbound_since_tick: true,
        }
    }

    /// Record any inbound frame
    pub fn record_inbound(&mut self) {
        self.missed = 0;
        self.inbound_since_tick = true;
    }

    /// Account for one keepalive interval
    pub fn tick(&mut self, send_ok: bool) -> KeepaliveVerdict {
        if !send_ok || !self.inbound_since_tick {
            self.missed += 1;
        }
        self.inbound_since_tick = false;

        if self.missed >= self.max_missed {
            KeepaliveVerdict::Dead
        } else {
            KeepaliveVerdict::Healthy
        }
    }

    /// Consecutive misses so far
    #[must_use]
    pub fn missed(&self) -> u32 {
        self.missed
    }
}
