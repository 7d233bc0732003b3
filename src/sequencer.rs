//! Output pulse sequencers.
//!
//! Each of the four output channels is pulsed high between two values of the
//! shared cycle cursor `m`. The edge registers are written through the
//! register interface as 14-bit fields and truncated to the cursor width.

use crate::M_MASK;

/// Pulses `output` between the given edge times.
///
/// `m_start`/`m_stop` give the values of the (monotonically increasing)
/// cycle cursor at which the output rises and falls. `clear` deasserts the
/// output irrespective of the configured times.
///
/// Priority per clock is clear, then start, then stop. A stop that collides
/// with the start yields to it and lands one clock later, so equal edges
/// produce a single-clock pulse. `m_stop < m_start` leaves the output high
/// until the next clear, and `m_start` past the end of the cycle never
/// rises.
#[derive(Default)]
pub struct ChannelSequencer {
    pub m_start: u16,
    pub m_stop: u16,
    /// Registered output level, updated each clock.
    pub output: bool,
    stop_pending: bool,
}

impl ChannelSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the rise and fall edges. Values are truncated to the cursor width.
    pub fn set_timing(&mut self, m_start: u16, m_stop: u16) {
        self.m_start = m_start & M_MASK;
        self.m_stop = m_stop & M_MASK;
    }

    /// Start strobe: the cursor sits on the rise edge this clock.
    pub fn stb_start(&self, m: u16) -> bool {
        m == self.m_start
    }

    /// Stop strobe: the cursor sits on the fall edge this clock.
    pub fn stb_stop(&self, m: u16) -> bool {
        m == self.m_stop
    }

    /// Advance one clock. `m` is the cursor value during this clock; the
    /// new output level is visible from the next clock on.
    pub fn tick(&mut self, m: u16, clear: bool) {
        let stb_start = self.stb_start(m);
        let stb_stop = self.stb_stop(m);
        let deferred_stop = self.stop_pending;
        self.stop_pending = stb_start && stb_stop;
        if clear {
            self.output = false;
            self.stop_pending = false;
        } else if stb_start {
            self.output = true;
        } else if stb_stop || deferred_stop {
            self.output = false;
        }
    }
}
