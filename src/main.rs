//! Entanglement sequencer demo.
//!
//! Brings up one standalone device, configures a realistic pulse sequence,
//! gate windows, and herald set, then performs repeated runs against
//! randomly thinned photon arrivals and reports each outcome.
//! Usage: `entangler [runs]`

use std::env;

use ansi_term::Colour;
use rand::Rng;
use rand::rngs::ThreadRng;
use tracing_subscriber::EnvFilter;

use entangler::bus::TIMEOUT_SENTINEL;
use entangler::core::core::{EntanglerCore, NUM_CHANNELS, PhyInputs};
use entangler::driver::{Driver, DriverError, EdgeSource, GATE_CHANNEL_BASE};
use entangler::gater::InputEdge;

/// Attempt length in machine units (one coarse clock = 8 units).
const CYCLE_LENGTH_MU: u32 = 1048;

/// Pulsed-laser trigger time within the attempt, machine units. The
/// reference pulse comes back at this fine-absolute time every attempt.
const LASER_TRIGGER_MU: u32 = 580;

/// Gate window offsets from the reference pulse, fine units: early and late
/// windows for each of the two traps.
const GATE_OFFSETS: [(u32, u32); NUM_CHANNELS] = [(39, 50), (70, 85), (35, 48), (68, 83)];

/// Herald patterns: exactly one early and one late detector click.
const HERALDS: [u8; NUM_CHANNELS] = [0b0101, 0b1001, 0b0110, 0b1010];

/// Wall-clock budget for one run, machine units.
const RUN_DURATION_MU: u32 = 200_000;

/// Simulated photon arrivals. Every attempt gets a laser reference pulse;
/// each detector clicks with the given probability, at a uniformly drawn
/// offset inside its gate window. Edges strobe one clock after the cursor
/// passes their coarse time, deserializer-style.
struct PhotonSim {
    rng: ThreadRng,
    detect_prob: f64,
    prev_m: u16,
    pending_ref: Option<u8>,
    pending_det: [Option<u8>; NUM_CHANNELS],
    det_events: [Option<u32>; NUM_CHANNELS],
}

impl PhotonSim {
    fn new(detect_prob: f64) -> Self {
        let mut sim = Self {
            rng: rand::thread_rng(),
            detect_prob,
            prev_m: 0,
            pending_ref: None,
            pending_det: [None; NUM_CHANNELS],
            det_events: [None; NUM_CHANNELS],
        };
        sim.roll_attempt();
        sim
    }

    /// Draw this attempt's detector plan.
    fn roll_attempt(&mut self) {
        for (ch, event) in self.det_events.iter_mut().enumerate() {
            *event = if self.rng.gen_bool(self.detect_prob) {
                let (lo, hi) = GATE_OFFSETS[ch];
                Some(LASER_TRIGGER_MU + self.rng.gen_range(lo..=hi))
            } else {
                None
            };
        }
    }
}

impl EdgeSource for PhotonSim {
    fn edges(&mut self, _clock: u64, core: &EntanglerCore) -> PhyInputs {
        let m = core.msm.m;
        if m < self.prev_m {
            // Cursor wrapped back to zero: a fresh attempt is starting.
            self.roll_attempt();
        }
        self.prev_m = m;

        let mut phys = PhyInputs::default();
        if let Some(fine) = self.pending_ref.take() {
            phys.reference = InputEdge::rising(fine);
        }
        for (ch, pending) in self.pending_det.iter_mut().enumerate() {
            if let Some(fine) = pending.take() {
                phys.detectors[ch] = InputEdge::rising(fine);
            }
        }

        if u32::from(m) == LASER_TRIGGER_MU >> 3 {
            self.pending_ref = Some((LASER_TRIGGER_MU & 0x7) as u8);
        }
        for ch in 0..NUM_CHANNELS {
            if let Some(t) = self.det_events[ch] {
                if u32::from(m) == t >> 3 {
                    self.pending_det[ch] = Some((t & 0x7) as u8);
                }
            }
        }
        phys
    }
}

fn main() -> Result<(), DriverError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let runs: usize = env::args()
        .nth(1)
        .and_then(|a| a.parse().ok())
        .unwrap_or(5);

    let mut drv = Driver::new(true, PhotonSim::new(0.3));

    // Bring-up: timings and heralds first, enable last.
    drv.set_config(false, true);
    drv.set_timing_mu(0, 30, 500); // pump pulse
    drv.set_timing_mu(1, 0, 450); // repump pulse
    drv.set_timing_mu(2, LASER_TRIGGER_MU, LASER_TRIGGER_MU + 8); // laser trigger
    drv.set_timing_mu(3, 8184, 8184); // aux channel parked past the cycle end
    for (ch, (lo, hi)) in GATE_OFFSETS.iter().enumerate() {
        drv.set_timing_mu(GATE_CHANNEL_BASE + ch, *lo, *hi);
    }
    drv.set_cycle_length_mu(CYCLE_LENGTH_MU);
    drv.set_heralds(&HERALDS)?;
    for (i, herald) in HERALDS.iter().enumerate() {
        drv.set_counter_patterns(i, &[*herald])?;
    }
    drv.set_config(true, true);

    println!(
        "{} {} run(s), cycle {} mu, heralds {:?}",
        Colour::Cyan.paint("entangler:"),
        runs,
        CYCLE_LENGTH_MU,
        HERALDS.map(|h| format!("{h:04b}")),
    );

    let mut successes = 0;
    for run in 0..runs {
        let (clock, data) = drv.run_mu(RUN_DURATION_MU)?;
        let attempts = drv.get_ncycles()?;
        let triggers = drv.get_ntriggers()?;

        let outcome = if data == TIMEOUT_SENTINEL {
            Colour::Red.paint("timeout").to_string()
        } else {
            successes += 1;
            format!("{} matches {:04b}", Colour::Green.paint("success"), data)
        };
        println!(
            "run {:>2}: {outcome}  ({attempts} attempts, {triggers} triggers, clock {clock})",
            run + 1,
        );
    }

    drv.set_config(false, true);

    println!("\n{successes}/{runs} runs heralded");
    // Counters reset on every run strobe, so these cover the final run.
    print!("last-run single-channel counts:");
    for ch in 0..NUM_CHANNELS {
        print!(" {}", drv.get_input_count(ch)?);
    }
    print!("\nlast-run pattern counts:       ");
    for idx in 0..NUM_CHANNELS {
        print!(" {}", drv.get_pattern_count(idx)?);
    }
    println!();
    Ok(())
}
