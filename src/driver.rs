//! Host-side driver: register encodings and a blocking call facade.
//!
//! The device only understands single-word events, so everything the host
//! configures is packed: herald patterns four nibbles at a time, timing as
//! two 14-bit fields per word. Sequencer channels take their times in
//! machine units and are right-shifted to coarse clocks here; gate channels
//! keep fine resolution. Both get the +1 offset that lines host times up
//! with the registered outputs.
//!
//! [`Driver`] wraps a device and advances its clock behind every call, the
//! way the host's calls each consume a slot on the real timeline. Photon
//! activity comes from an [`EdgeSource`] so the same facade runs against
//! fixed schedules in tests and simulated arrivals in the demo.

use thiserror::Error;

use crate::bus::{
    ADDR_R_COUNTER_BASE, ADDR_R_NCYCLES, ADDR_R_NTRIGGERS, ADDR_R_STATUS, ADDR_R_TIMEREMAINING,
    ADDR_R_TIMESTAMP_BASE, ADDR_R_TIMESTAMP_REF, ADDR_W_CONFIG, ADDR_W_HERALD,
    ADDR_W_PATTERN_BASE, ADDR_W_RUN, ADDR_W_TCYCLE, ADDR_W_TIMING_BASE, OutputEvent, RegisterBus,
};
use crate::core::core::{EntanglerCore, NUM_CHANNELS, PhyInputs};
use crate::msm::LinkIn;

/// Timing channels 0–3 are the output sequencers; 4–7 are the input gates.
pub const GATE_CHANNEL_BASE: usize = 4;

/// Host-boundary failures. The clocked core itself cannot fail; these
/// surface where the host packs parameters or waits on the event stream.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("no input event within {0} clocks")]
    EventTimeout(u64),
    #[error("at most four herald patterns can be set, got {0}")]
    TooManyPatterns(usize),
    #[error("a pattern counter needs at least one pattern")]
    NoPatterns,
    #[error("counter index {0} out of range")]
    CounterIndex(usize),
}

/// Pack up to four 4-bit patterns into a herald word, enabling each slot
/// that is filled.
pub fn patterns_to_reg(patterns: &[u8]) -> Result<u32, DriverError> {
    if patterns.len() > 4 {
        return Err(DriverError::TooManyPatterns(patterns.len()));
    }
    let mut data = 0;
    for (i, p) in patterns.iter().enumerate() {
        data |= u32::from(p & 0xF) << (4 * i);
        data |= 1 << (16 + i);
    }
    Ok(data)
}

/// Pack patterns for a pattern counter, padding unused slots with the first
/// pattern; the counter's OR-reduction makes the duplicates harmless.
pub fn counter_patterns_to_reg(patterns: &[u8]) -> Result<u32, DriverError> {
    if patterns.is_empty() {
        return Err(DriverError::NoPatterns);
    }
    if patterns.len() > 4 {
        return Err(DriverError::TooManyPatterns(patterns.len()));
    }
    let mut full = [patterns[0]; 4];
    full[..patterns.len()].copy_from_slice(patterns);
    let mut data = 0;
    for (i, p) in full.iter().enumerate() {
        data |= u32::from(p & 0xF) << (4 * i);
    }
    Ok(data)
}

/// Encode one timing word. Sequencer channels get coarse resolution, gates
/// keep fine resolution; both take the +1 registration offset and truncate
/// to 14 bits.
pub fn timing_word(channel: usize, t_start_mu: u32, t_stop_mu: u32) -> u32 {
    let (mut start, mut stop) = if channel < GATE_CHANNEL_BASE {
        (t_start_mu >> 3, t_stop_mu >> 3)
    } else {
        (t_start_mu, t_stop_mu)
    };
    start = (start + 1) & 0x3FFF;
    stop = (stop + 1) & 0x3FFF;
    stop << 16 | start
}

/// Per-clock photon stimulus seen by the device. Implementations may key
/// off the cycle cursor to place edges inside the attempt.
pub trait EdgeSource {
    fn edges(&mut self, clock: u64, core: &EntanglerCore) -> PhyInputs;
}

/// A dark bench: no reference pulse and no detector activity.
impl EdgeSource for () {
    fn edges(&mut self, _clock: u64, _core: &EntanglerCore) -> PhyInputs {
        PhyInputs::default()
    }
}

/// Blocking host facade over one standalone or master device.
pub struct Driver<S> {
    pub bus: RegisterBus,
    pub source: S,
    pub is_master: bool,
    /// Clocks a blocking call may wait for its input event beyond any
    /// explicit run duration.
    pub event_budget: u64,
    clock: u64,
}

impl<S: EdgeSource> Driver<S> {
    pub fn new(is_master: bool, source: S) -> Self {
        Self {
            bus: RegisterBus::new(),
            source,
            is_master,
            event_budget: 4096,
            clock: 0,
        }
    }

    /// Clocks elapsed on the device since construction.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    fn step(&mut self, out: Option<OutputEvent>) -> Option<u32> {
        let phys = self.source.edges(self.clock, &self.bus.core);
        self.clock += 1;
        self.bus.tick(out, LinkIn::default(), &phys)
    }

    /// Write one register. Advances the device by one clock.
    pub fn write(&mut self, addr: u8, data: u32) {
        self.step(Some(OutputEvent { addr, data }));
    }

    /// Read one register, blocking until the reply event arrives.
    pub fn read(&mut self, addr: u8) -> Result<u32, DriverError> {
        self.step(Some(OutputEvent { addr, data: 0 }));
        self.await_event(self.event_budget).map(|(_, data)| data)
    }

    fn await_event(&mut self, budget: u64) -> Result<(u64, u32), DriverError> {
        for _ in 0..budget {
            if let Some(data) = self.step(None) {
                return Ok((self.clock, data));
            }
        }
        Err(DriverError::EventTimeout(budget))
    }

    /// Configure the core. `enable` hands the output pads to the
    /// sequencers and arms the completion event; do not enable before the
    /// cycle length and timings are set. `standalone` ignores the partner.
    pub fn set_config(&mut self, enable: bool, standalone: bool) {
        let mut data = 0;
        if enable {
            data |= 1;
        }
        if self.is_master {
            data |= 1 << 1;
        }
        if standalone {
            data |= 1 << 2;
        }
        self.write(ADDR_W_CONFIG, data);
    }

    /// Set the start/stop times of one timing channel, in machine units.
    /// Sequencer channels are relative to the attempt start at coarse
    /// resolution; gate channels are relative to the reference pulse at
    /// fine resolution.
    pub fn set_timing_mu(&mut self, channel: usize, t_start_mu: u32, t_stop_mu: u32) {
        self.write(
            ADDR_W_TIMING_BASE + channel as u8,
            timing_word(channel, t_start_mu, t_stop_mu),
        );
    }

    /// Set the attempt length. Resolution is the coarse clock.
    pub fn set_cycle_length_mu(&mut self, t_cycle_mu: u32) {
        self.write(ADDR_W_TCYCLE, t_cycle_mu >> 3);
    }

    /// Set the patterns that end a run with success.
    pub fn set_heralds(&mut self, heralds: &[u8]) -> Result<(), DriverError> {
        let data = patterns_to_reg(heralds)?;
        self.write(ADDR_W_HERALD, data);
        Ok(())
    }

    /// Configure the patterns matched by one pattern counter.
    pub fn set_counter_patterns(
        &mut self,
        idx: usize,
        patterns: &[u8],
    ) -> Result<(), DriverError> {
        if idx >= NUM_CHANNELS {
            return Err(DriverError::CounterIndex(idx));
        }
        let data = counter_patterns_to_reg(patterns)?;
        self.write(ADDR_W_PATTERN_BASE + idx as u8, data);
        Ok(())
    }

    /// Run until success or until `duration_mu` machine units elapse.
    /// Returns the clock of the completion event and its payload: the
    /// herald match bitmap, or the timeout sentinel.
    pub fn run_mu(&mut self, duration_mu: u32) -> Result<(u64, u32), DriverError> {
        let clocks = duration_mu >> 3;
        self.write(ADDR_W_RUN, clocks);
        self.await_event(u64::from(clocks) + self.event_budget)
    }

    pub fn get_status(&mut self) -> Result<u32, DriverError> {
        self.read(ADDR_R_STATUS)
    }

    /// Attempts completed since the last run started.
    pub fn get_ncycles(&mut self) -> Result<u32, DriverError> {
        self.read(ADDR_R_NCYCLES)
    }

    /// Reference pulses received since the last run started.
    pub fn get_ntriggers(&mut self) -> Result<u32, DriverError> {
        self.read(ADDR_R_NTRIGGERS)
    }

    /// Clocks left before the current run times out.
    pub fn get_time_remaining(&mut self) -> Result<u32, DriverError> {
        self.read(ADDR_R_TIMEREMAINING)
    }

    /// Latched timestamp of the given detector channel, fine resolution.
    pub fn get_signal_timestamp_mu(&mut self, channel: usize) -> Result<u32, DriverError> {
        if channel >= NUM_CHANNELS {
            return Err(DriverError::CounterIndex(channel));
        }
        self.read(ADDR_R_TIMESTAMP_BASE + channel as u8)
    }

    /// Latched timestamp of the reference pulse, fine resolution.
    pub fn get_reference_timestamp_mu(&mut self) -> Result<u32, DriverError> {
        self.read(ADDR_R_TIMESTAMP_REF)
    }

    /// Hits on the given single-channel counter since the last run started.
    pub fn get_input_count(&mut self, idx: usize) -> Result<u32, DriverError> {
        if idx >= NUM_CHANNELS {
            return Err(DriverError::CounterIndex(idx));
        }
        self.read(ADDR_R_COUNTER_BASE + idx as u8)
    }

    /// Hits on the given pattern counter since the last run started.
    pub fn get_pattern_count(&mut self, idx: usize) -> Result<u32, DriverError> {
        if idx >= NUM_CHANNELS {
            return Err(DriverError::CounterIndex(idx));
        }
        self.read(ADDR_R_COUNTER_BASE + 4 + idx as u8)
    }
}
