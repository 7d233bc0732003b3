//! Composition root for the sequencer core.
//!
//! Owns every clocked component and advances them together, once per clock:
//! the state machine drives the cursor `m`, the sequencers and gaters key
//! off it, the gaters' `triggered` flags feed the heralder, and the herald
//! closes the loop back into the state machine as the success condition.
//! The loop closes across the clock boundary: everything samples the state
//! that held during the clock and commits for the next one.

use crate::counters::{PatternCounter, SingleChannelCounter};
use crate::gater::{InputEdge, InputGater};
use crate::heralder::Heralder;
use crate::msm::{EVENT_COUNTER_MASK, LinkIn, MainStateMachine};
use crate::sequencer::ChannelSequencer;

/// Number of detector channels, fixed at build time. The trigger vector,
/// the herald patterns, and the counter bank are all this wide.
pub const NUM_CHANNELS: usize = 4;

/// Output channel that drives the shared pulsed-laser trigger. While the
/// core is disabled, the master's pad for this channel also carries the
/// slave's passthrough copy so the laser stays usable for calibration.
pub const PULSED_LASER_SEQ_IDX: usize = 2;

/// One clock of deserializer activity: the shared laser reference plus one
/// edge stream per detector channel.
#[derive(Clone, Copy, Default)]
pub struct PhyInputs {
    pub reference: InputEdge,
    pub detectors: [InputEdge; NUM_CHANNELS],
}

/// Per-clock outputs of the core, derived while advancing it.
#[derive(Clone, Copy)]
pub struct CoreTick {
    pub cycle_starting: bool,
    pub cycle_ending: bool,
    /// One-clock completion strobe for the run.
    pub done_stb: bool,
    /// Success level as it stood on the processed clock.
    pub success: bool,
    /// Herald match bitmap on the processed clock; the completion event
    /// payload on success.
    pub matches: u8,
    pub trigger_out: bool,
    pub timeout: bool,
}

pub struct EntanglerCore {
    /// When low, the output pads carry their passthrough signals and no
    /// completion event is emitted.
    pub enable: bool,
    pub msm: MainStateMachine,
    pub sequencers: [ChannelSequencer; NUM_CHANNELS],
    pub gaters: [InputGater; NUM_CHANNELS],
    pub heralder: Heralder,
    pub single_counters: [SingleChannelCounter; NUM_CHANNELS],
    pub pattern_counters: [PatternCounter; NUM_CHANNELS],
    /// Laser reference pulses seen this run, one count per attempt. The
    /// first gater's `got_ref` stands in for the shared reference.
    pub triggers_received: u16,
}

impl Default for EntanglerCore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntanglerCore {
    pub fn new() -> Self {
        Self {
            enable: false,
            msm: MainStateMachine::new(),
            sequencers: [(); NUM_CHANNELS].map(|_| ChannelSequencer::new()),
            gaters: [(); NUM_CHANNELS].map(|_| InputGater::new()),
            heralder: Heralder::new(),
            single_counters: std::array::from_fn(|i| SingleChannelCounter::new(i as u8)),
            pattern_counters: [(); NUM_CHANNELS].map(|_| PatternCounter::new()),
            triggers_received: 0,
        }
    }

    /// Current trigger vector: bit per channel, set while that gater has
    /// latched an in-window edge this attempt.
    pub fn trigger_vector(&self) -> u8 {
        self.gaters
            .iter()
            .enumerate()
            .fold(0, |v, (i, g)| v | (u8::from(g.triggered) << i))
    }

    /// Advance the whole core by one clock.
    pub fn tick(&mut self, run_stb: bool, link: LinkIn, phys: &PhyInputs) -> CoreTick {
        // Sample everything the components consume combinationally before
        // any register commits.
        let sig = self.trigger_vector();
        let matches = self.heralder.matches(sig);
        let herald = self.heralder.herald(sig);
        let got_ref = self.gaters[0].got_ref;
        let success = self.msm.success;
        let was_running = self.msm.running;

        let t = self.msm.tick(run_stb, herald, link);

        // Per-attempt state clears while idling, and whenever the core is
        // not running at all.
        let clear = t.cycle_starting || !was_running;
        for seq in &mut self.sequencers {
            seq.tick(t.m, clear);
        }
        for (gater, edge) in self.gaters.iter_mut().zip(phys.detectors) {
            gater.tick(t.m, phys.reference, edge, clear);
        }

        for counter in &mut self.single_counters {
            counter.tick(sig, t.cycle_ending, run_stb);
        }
        for counter in &mut self.pattern_counters {
            counter.tick(sig, t.cycle_ending, run_stb);
        }

        if run_stb {
            self.triggers_received = 0;
        } else if t.cycle_ending && got_ref {
            self.triggers_received = (self.triggers_received + 1) & EVENT_COUNTER_MASK;
        }

        CoreTick {
            cycle_starting: t.cycle_starting,
            cycle_ending: t.cycle_ending,
            done_stb: t.done_stb,
            success,
            matches,
            trigger_out: t.trigger_out,
            timeout: t.timeout,
        }
    }

    /// Levels driven onto the five output pads.
    ///
    /// While enabled, the first four pads carry the sequencer outputs;
    /// otherwise they carry their passthrough signals, with the slave's
    /// pulsed-laser copy ORed onto the master's designated pad. The fifth
    /// pad asserts while the core is running, else follows its passthrough.
    pub fn output_pads(&self, passthrough: &[bool; 5], slave_laser: bool) -> [bool; 5] {
        let mut pads = [false; 5];
        for i in 0..NUM_CHANNELS {
            let mut pt = passthrough[i];
            if i == PULSED_LASER_SEQ_IDX {
                pt |= slave_laser && self.msm.is_master;
            }
            pads[i] = if self.enable {
                self.sequencers[i].output
            } else {
                pt
            };
        }
        pads[4] = self.msm.running || passthrough[4];
        pads
    }

    /// The pulsed-laser copy this device offers to its partner: sequencer
    /// output while enabled, the local passthrough otherwise.
    pub fn laser_link_out(&self, passthrough: bool) -> bool {
        if self.enable {
            self.sequencers[PULSED_LASER_SEQ_IDX].output
        } else {
            passthrough
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{EntanglerCore, PhyInputs};
    use crate::gater::InputEdge;
    use crate::msm::LinkIn;
    use crate::FINE_BITS;

    /// Mock deserializer keyed off the shared cursor, one per channel: the
    /// strobe registers one clock after the cursor passes the coarse part
    /// of `t_event`, once per attempt.
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

    /// Standalone device with mock phys on the reference and all four
    /// detector channels. An out-of-reach event time parks a channel.
    struct StandaloneHarness {
        core: EntanglerCore,
        phy_ref: MockPhy,
        phy_det: [MockPhy; 4],
    }

    const PARKED: u32 = 1_000_000;

    impl StandaloneHarness {
        fn new(t_ref: u32, t_det: [u32; 4]) -> Self {
            let mut core = EntanglerCore::new();
            core.enable = true;
            core.msm.is_master = true;
            core.msm.standalone = true;
            core.msm.m_end = 20;
            core.msm.time_remaining_buf = 100;
            Self {
                core,
                phy_ref: MockPhy::new(t_ref),
                phy_det: t_det.map(MockPhy::new),
            }
        }

        fn tick(&mut self, run_stb: bool) -> super::CoreTick {
            let m = self.core.msm.m;
            let phys = PhyInputs {
                reference: self.phy_ref.tick(m),
                detectors: [
                    self.phy_det[0].tick(m),
                    self.phy_det[1].tick(m),
                    self.phy_det[2].tick(m),
                    self.phy_det[3].tick(m),
                ],
            };
            self.core.tick(run_stb, LinkIn::default(), &phys)
        }

        fn run_until_done(&mut self, budget: usize) -> (usize, bool) {
            self.tick(true);
            for i in 0..budget {
                let t = self.tick(false);
                if t.done_stb {
                    return (i, t.success);
                }
            }
            panic!("core never finished");
        }
    }

    #[test]
    fn heralded_attempt_succeeds_end_to_end() {
        let t_ref = 8 * 10 + 3;
        let mut h = StandaloneHarness::new(t_ref, [t_ref + 18, PARKED, t_ref + 30, PARKED]);
        h.core.sequencers[0].set_timing(1, 9);
        h.core.sequencers[3].set_timing(0, 0);
        h.core.gaters[0].set_gate(18, 30);
        h.core.gaters[2].set_gate(18, 30);
        h.core.heralder.patterns[0] = 0b0101;
        h.core.heralder.pattern_ens = 0b0001;

        let (_, success) = h.run_until_done(200);
        assert!(success);
        assert_eq!(h.core.msm.cycles_completed, 1);
        assert_eq!(h.core.triggers_received, 1);
        assert_eq!(h.core.single_counters[0].counter, 1);
        assert_eq!(h.core.single_counters[1].counter, 0);
        assert_eq!(h.core.single_counters[2].counter, 1);
        assert_eq!(h.core.pattern_counters[0].counter, 0);
    }

    #[test]
    fn unheralded_run_counts_every_attempt() {
        let t_ref = 8 * 5;
        let mut h = StandaloneHarness::new(t_ref, [t_ref + 12, PARKED, PARKED, PARKED]);
        h.core.gaters[0].set_gate(8, 16);
        // No herald enabled: the run must exhaust its timer.
        let (_, success) = h.run_until_done(200);
        assert!(!success);
        let attempts = u32::from(h.core.msm.cycles_completed);
        assert!(attempts > 1);
        assert_eq!(u32::from(h.core.triggers_received), attempts);
        assert_eq!(h.core.single_counters[0].counter, attempts);
    }

    #[test]
    fn pattern_counters_tally_across_attempts() {
        // One detector pattern per attempt: 0b0001, 0b1001, 0b0110, 0b1100.
        let vectors = [0b0001u8, 0b1001, 0b0110, 0b1100];
        let mut h = StandaloneHarness::new(8 * 4, [PARKED; 4]);
        h.core.msm.time_remaining_buf = 1000;
        for g in &mut h.core.gaters {
            g.set_gate(8, 16);
        }
        h.core.heralder.patterns[0] = 0b1100;
        h.core.heralder.pattern_ens = 0b0001;
        h.core.pattern_counters[0].patterns = [0b0001; 4];
        h.core.pattern_counters[1].patterns = [0b1001; 4];
        h.core.pattern_counters[2].patterns = [0b1001, 0b0110, 0b1001, 0b1001];
        h.core.pattern_counters[3].patterns = [0b1100; 4];

        let mut attempt = 0;
        h.tick(true);
        let mut done = false;
        for _ in 0..500 {
            // Re-arm the detector phys for the vector of the current attempt.
            if h.core.msm.m == 0 {
                for (i, phy) in h.phy_det.iter_mut().enumerate() {
                    let hit = attempt < 4 && vectors[attempt] >> i & 1 != 0;
                    phy.t_event = if hit { 8 * 4 + 10 } else { PARKED };
                    phy.pending = None;
                }
            }
            let t = h.tick(false);
            if t.cycle_ending {
                attempt += 1;
            }
            if t.done_stb {
                done = true;
                break;
            }
        }
        assert!(done);
        assert!(h.core.msm.success);
        assert_eq!(h.core.msm.cycles_completed, 4);

        let singles: Vec<u32> = h.core.single_counters.iter().map(|c| c.counter).collect();
        assert_eq!(singles, vec![2, 1, 2, 2]);
        let patterns: Vec<u32> = h.core.pattern_counters.iter().map(|c| c.counter).collect();
        assert_eq!(patterns, vec![1, 1, 2, 1]);
    }

    #[test]
    fn pads_follow_passthrough_while_disabled() {
        let mut core = EntanglerCore::new();
        core.msm.is_master = true;
        let pt = [true, false, false, true, false];

        let pads = core.output_pads(&pt, false);
        assert_eq!(pads, [true, false, false, true, false]);

        // Slave's laser copy rides the designated pad on the master.
        let pads = core.output_pads(&pt, true);
        assert_eq!(pads, [true, false, true, true, false]);

        // A slave does not OR the partner signal in.
        core.msm.is_master = false;
        let pads = core.output_pads(&pt, true);
        assert_eq!(pads, [true, false, false, true, false]);
    }

    #[test]
    fn pads_follow_sequencers_while_enabled() {
        let mut core = EntanglerCore::new();
        core.enable = true;
        core.sequencers[1].output = true;
        let pads = core.output_pads(&[false; 5], true);
        assert_eq!(pads, [false, true, false, false, false]);

        core.msm.running = true;
        let pads = core.output_pads(&[false; 5], false);
        assert!(pads[4], "running pad must assert while running");
    }
}
