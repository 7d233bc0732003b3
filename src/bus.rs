//! Register interface and event protocol.
//!
//! The host drives the core through a 6-bit address space of single-word
//! events. The top address bit selects direction: an output event on a read
//! address writes nothing and schedules exactly one input event carrying the
//! selected datum on the following clock; an output event on a write address
//! strobes the corresponding register, taking effect on the following clock.
//!
//! | Range       | Dir   | Group |
//! |-------------|-------|-------|
//! | 0x00–0x03   | write | config, run, cycle length, heralds |
//! | 0x08–0x0F   | write | timing: 4 sequencers then 4 gates, `(stop<<16) | start` |
//! | 0x10–0x13   | write | pattern-counter pattern sets |
//! | 0x20–0x23   | read  | status, cycles, time remaining, trigger tally |
//! | 0x28–0x2C   | read  | input timestamps (4 signals + reference) |
//! | 0x30–0x37   | read  | counter results (4 single + 4 pattern) |
//!
//! While the core is enabled, completing a run emits one unsolicited input
//! event on the `done` strobe: the herald match bitmap on success, or the
//! `0x3FFF` sentinel on timeout. A read reply scheduled for the same clock
//! is lost to the completion payload; the host must not provoke that
//! coincidence.

use tracing::debug;

use crate::M_MASK;
use crate::core::core::{EntanglerCore, PhyInputs};
use crate::msm::LinkIn;

pub const ADDR_W_CONFIG: u8 = 0x00;
pub const ADDR_W_RUN: u8 = 0x01;
pub const ADDR_W_TCYCLE: u8 = 0x02;
pub const ADDR_W_HERALD: u8 = 0x03;
/// Base of the eight timing channels: sequencers 0–3, then gates 0–3.
pub const ADDR_W_TIMING_BASE: u8 = 0x08;
pub const ADDR_W_PATTERN_BASE: u8 = 0x10;

pub const ADDR_R_STATUS: u8 = 0x20;
pub const ADDR_R_NCYCLES: u8 = 0x21;
pub const ADDR_R_TIMEREMAINING: u8 = 0x22;
pub const ADDR_R_NTRIGGERS: u8 = 0x23;
pub const ADDR_R_TIMESTAMP_BASE: u8 = 0x28;
pub const ADDR_R_TIMESTAMP_REF: u8 = 0x2C;
pub const ADDR_R_COUNTER_BASE: u8 = 0x30;

/// Completion payload for a run that timed out; herald bitmaps only occupy
/// the low four bits, so the host compares against this directly.
pub const TIMEOUT_SENTINEL: u32 = 0x3FFF;

/// One host→device event: a register write, or a read request.
#[derive(Clone, Copy, Debug)]
pub struct OutputEvent {
    pub addr: u8,
    pub data: u32,
}

/// The register file wrapped around the core. Owns the one-clock pipeline
/// state of the interface: the pending run strobe and the pending read
/// reply.
pub struct RegisterBus {
    pub core: EntanglerCore,
    run_pending: bool,
    read_pending: Option<u8>,
}

impl Default for RegisterBus {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterBus {
    pub fn new() -> Self {
        Self {
            core: EntanglerCore::new(),
            run_pending: false,
            read_pending: None,
        }
    }

    /// Advance the device by one clock, optionally consuming one output
    /// event, and return the input event for this clock if one fires.
    pub fn tick(
        &mut self,
        out: Option<OutputEvent>,
        link: LinkIn,
        phys: &PhyInputs,
    ) -> Option<u32> {
        let run_stb = std::mem::take(&mut self.run_pending);
        // Read replies sample the registers as they stand on this clock,
        // before the edge commits anything.
        let reply = self.read_pending.take().map(|addr| self.read_value(addr));
        let enabled = self.core.enable;

        let t = self.core.tick(run_stb, link, phys);

        let event = if enabled && t.done_stb {
            Some(if t.success {
                u32::from(t.matches)
            } else {
                TIMEOUT_SENTINEL
            })
        } else {
            reply
        };

        if let Some(ev) = out {
            self.handle_output(ev);
        }
        event
    }

    /// Decode one output event. Writes land in the registers now and are
    /// seen by the core from the next clock; reads only schedule a reply.
    fn handle_output(&mut self, ev: OutputEvent) {
        if ev.addr & 0x20 != 0 {
            self.read_pending = Some(ev.addr);
            return;
        }
        debug!(addr = ev.addr, data = ev.data, "register write");
        match ev.addr {
            ADDR_W_CONFIG => {
                self.core.enable = ev.data & 1 != 0;
                self.core.msm.is_master = ev.data & 2 != 0;
                self.core.msm.standalone = ev.data & 4 != 0;
            }
            ADDR_W_RUN => {
                self.core.msm.time_remaining_buf = ev.data;
                self.run_pending = true;
            }
            ADDR_W_TCYCLE => {
                self.core.msm.m_end = (ev.data as u16) & M_MASK;
            }
            ADDR_W_HERALD => {
                for (i, p) in self.core.heralder.patterns.iter_mut().enumerate() {
                    *p = (ev.data >> (4 * i)) as u8 & 0xF;
                }
                self.core.heralder.pattern_ens = (ev.data >> 16) as u8 & 0xF;
            }
            0x08..=0x0B => {
                let idx = usize::from(ev.addr - ADDR_W_TIMING_BASE);
                let (start, stop) = unpack_timing(ev.data);
                self.core.sequencers[idx].set_timing(start, stop);
            }
            0x0C..=0x0F => {
                let idx = usize::from(ev.addr - ADDR_W_TIMING_BASE) - 4;
                let (start, stop) = unpack_timing(ev.data);
                self.core.gaters[idx].set_gate(start, stop);
            }
            0x10..=0x13 => {
                let idx = usize::from(ev.addr - ADDR_W_PATTERN_BASE);
                let counter = &mut self.core.pattern_counters[idx];
                for (i, p) in counter.patterns.iter_mut().enumerate() {
                    *p = (ev.data >> (4 * i)) as u8 & 0xF;
                }
            }
            _ => {} // Unmapped write: dropped.
        }
    }

    /// Value returned for a read address. Unmapped addresses read as zero.
    fn read_value(&self, addr: u8) -> u32 {
        let msm = &self.core.msm;
        match addr {
            ADDR_R_STATUS => {
                u32::from(msm.ready)
                    | u32::from(msm.success) << 1
                    | u32::from(msm.timeout()) << 2
            }
            ADDR_R_NCYCLES => u32::from(msm.cycles_completed),
            ADDR_R_TIMEREMAINING => msm.time_remaining,
            ADDR_R_NTRIGGERS => u32::from(self.core.triggers_received),
            0x28..=0x2B => {
                u32::from(self.core.gaters[usize::from(addr - ADDR_R_TIMESTAMP_BASE)].sig_ts)
            }
            ADDR_R_TIMESTAMP_REF => u32::from(self.core.gaters[0].ref_ts),
            0x30..=0x33 => {
                self.core.single_counters[usize::from(addr - ADDR_R_COUNTER_BASE)].counter
            }
            0x34..=0x37 => {
                self.core.pattern_counters[usize::from(addr - ADDR_R_COUNTER_BASE) - 4].counter
            }
            _ => 0,
        }
    }
}

/// Split a timing word into its 14-bit start (low half) and stop (high
/// half) fields.
fn unpack_timing(data: u32) -> (u16, u16) {
    ((data & 0x3FFF) as u16, (data >> 16) as u16 & 0x3FFF)
}

#[cfg(test)]
mod tests {
    use super::{
        ADDR_R_NCYCLES, ADDR_R_NTRIGGERS, ADDR_R_STATUS, ADDR_R_TIMEREMAINING,
        ADDR_R_TIMESTAMP_BASE, ADDR_R_TIMESTAMP_REF, ADDR_W_CONFIG, ADDR_W_HERALD, ADDR_W_RUN,
        ADDR_W_TCYCLE, ADDR_W_TIMING_BASE, OutputEvent, RegisterBus, TIMEOUT_SENTINEL,
    };
    use crate::FINE_BITS;
    use crate::core::core::PhyInputs;
    use crate::gater::InputEdge;
    use crate::msm::LinkIn;

    struct MockPhy {
        t_event: u32,
        pending: Option<u8>,
    }

    impl MockPhy {
        fn new(t_event: u32) -> Self {
            Self {
                t_event,
                pending: None,
            }
        }

        fn tick(&mut self, m: u16) -> InputEdge {
            let edge = match self.pending.take() {
                Some(fine) => InputEdge::rising(fine),
                None => InputEdge::default(),
            };
            if u32::from(m) == self.t_event >> FINE_BITS {
                self.pending = Some((self.t_event & 0x7) as u8);
            }
            edge
        }
    }

    const PARKED: u32 = 1_000_000;

    struct BusHarness {
        bus: RegisterBus,
        phy_ref: MockPhy,
        phy_det: [MockPhy; 4],
    }

    impl BusHarness {
        fn new(t_ref: u32, t_det: [u32; 4]) -> Self {
            Self {
                bus: RegisterBus::new(),
                phy_ref: MockPhy::new(t_ref),
                phy_det: t_det.map(MockPhy::new),
            }
        }

        fn tick(&mut self, out: Option<OutputEvent>) -> Option<u32> {
            let m = self.bus.core.msm.m;
            let phys = PhyInputs {
                reference: self.phy_ref.tick(m),
                detectors: [
                    self.phy_det[0].tick(m),
                    self.phy_det[1].tick(m),
                    self.phy_det[2].tick(m),
                    self.phy_det[3].tick(m),
                ],
            };
            self.bus.tick(out, LinkIn::default(), &phys)
        }

        fn write(&mut self, addr: u8, data: u32) {
            assert!(self.tick(Some(OutputEvent { addr, data })).is_none());
        }

        fn read(&mut self, addr: u8, budget: usize) -> u32 {
            self.tick(Some(OutputEvent { addr, data: 0 }));
            for _ in 0..budget {
                if let Some(data) = self.tick(None) {
                    return data;
                }
            }
            panic!("no input event within {budget} clocks");
        }

        fn await_event(&mut self, budget: usize) -> (usize, u32) {
            for i in 0..budget {
                if let Some(data) = self.tick(None) {
                    return (i, data);
                }
            }
            panic!("no input event within {budget} clocks");
        }
    }

    fn heralds_to_reg(heralds: &[u8]) -> u32 {
        let mut data = 0;
        for (i, h) in heralds.iter().enumerate() {
            data |= u32::from(h & 0xF) << (4 * i);
            data |= 1 << (16 + i);
        }
        data
    }

    #[test]
    fn configured_run_succeeds_and_reads_back() {
        let (t_ref, t_det0, t_det1) = (800, 820, 825);
        let mut h = BusHarness::new(t_ref, [t_det0, t_det1, PARKED, PARKED]);

        h.write(ADDR_W_CONFIG, 0b110); // master + standalone, still disabled
        h.write(
            ADDR_W_HERALD,
            heralds_to_reg(&[0b0101, 0b1010, 0b1100, 0b0011]),
        );
        for i in 0..4u32 {
            h.write(
                ADDR_W_TIMING_BASE + i as u8,
                (2 * i + 2) << 16 | (2 * i + 1),
            );
        }
        for i in [4u8, 5] {
            h.write(ADDR_W_TIMING_BASE + i, 30 << 16 | 18);
        }
        for i in [6u8, 7] {
            h.write(ADDR_W_TIMING_BASE + i, 1000 << 16 | 1000);
        }
        h.write(ADDR_W_TCYCLE, 1000 / 8);
        h.write(ADDR_W_CONFIG, 0b111); // enable

        h.write(ADDR_W_RUN, 2000 / 8);
        let (_, data) = h.await_event(300);
        // Detectors 0 and 1 fire: vector 0b0011 matches herald slot 3.
        assert_eq!(data, 0b1000, "unexpected herald bitmap");

        let status = h.read(ADDR_R_STATUS, 4);
        assert_ne!(status & 0x2, 0, "core not successful");
        assert_eq!(h.read(ADDR_R_NCYCLES, 4), 1, "wrong number of cycles");
        assert_eq!(h.read(ADDR_R_NTRIGGERS, 4), 1);
        let remaining = h.read(ADDR_R_TIMEREMAINING, 4);
        assert!(remaining > 0 && remaining < 250, "remaining {remaining}");

        let expected = [t_det0 + 8, t_det1 + 8, 0, 0];
        for (i, exp) in expected.iter().enumerate() {
            assert_eq!(h.read(ADDR_R_TIMESTAMP_BASE + i as u8, 4), *exp);
        }
        assert_eq!(h.read(ADDR_R_TIMESTAMP_REF, 4), t_ref + 8);
    }

    #[test]
    fn timeout_sweep_reports_exactly_once_and_promptly() {
        let mut h = BusHarness::new(PARKED, [PARKED; 4]);
        let n_cycles = 10;

        for timeout in 1..20usize {
            h.write(ADDR_W_CONFIG, 0b110);
            h.write(ADDR_W_TCYCLE, n_cycles as u32);
            h.write(ADDR_W_CONFIG, 0b111);
            h.write(ADDR_W_RUN, timeout as u32);

            let mut timedout = false;
            for i in 0..timeout + n_cycles + 50 {
                if let Some(data) = h.tick(None) {
                    assert_eq!(data, TIMEOUT_SENTINEL);
                    assert!(!timedout, "done event must fire exactly once");
                    assert!(i <= timeout + n_cycles + 5, "late timeout at {i}");
                    timedout = true;
                }
            }
            assert!(timedout, "no timeout event for timeout={timeout}");
        }
    }

    #[test]
    fn disabled_run_emits_no_event_but_updates_status() {
        let mut h = BusHarness::new(PARKED, [PARKED; 4]);
        h.write(ADDR_W_CONFIG, 0b110); // enable low
        h.write(ADDR_W_TCYCLE, 10);
        h.write(ADDR_W_RUN, 30);

        for _ in 0..200 {
            assert!(h.tick(None).is_none(), "disabled core must stay silent");
        }
        let status = h.read(ADDR_R_STATUS, 4);
        assert_eq!(status & 0x1, 0, "ready must clear after the run");
        assert_eq!(status & 0x2, 0);
        assert_ne!(status & 0x4, 0, "status must report the timeout");
    }

    #[test]
    fn read_reply_arrives_on_following_clock() {
        let mut h = BusHarness::new(PARKED, [PARKED; 4]);
        h.write(ADDR_W_TCYCLE, 42);
        assert!(
            h.tick(Some(OutputEvent {
                addr: ADDR_R_STATUS,
                data: 0,
            }))
            .is_none(),
            "reply must not share the request clock"
        );
        assert!(h.tick(None).is_some());
    }

    #[test]
    fn unmapped_read_returns_zero() {
        let mut h = BusHarness::new(PARKED, [PARKED; 4]);
        assert_eq!(h.read(0x24, 4), 0);
    }

    #[test]
    fn timing_write_truncates_to_fourteen_bits() {
        let mut h = BusHarness::new(PARKED, [PARKED; 4]);
        h.write(ADDR_W_TIMING_BASE + 4, 0xFFFF_FFFF);
        assert_eq!(h.bus.core.gaters[0].gate_start, 0x3FFF);
        assert_eq!(h.bus.core.gaters[0].gate_stop, 0x3FFF);
    }
}
