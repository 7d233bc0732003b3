//! Main state machine.
//!
//! Schedules entanglement attempts on a shared cycle cursor `m`, counts
//! completed attempts, applies the run-level timeout, and keeps the
//! master–slave pair in lockstep:
//!
//! - The master idles until the slave reports ready, then holds the trigger
//!   line for two clocks and starts counting.
//! - The slave idles until triggered, counts the same number of clocks, then
//!   spends two clocks waiting for the master's success broadcast.
//! - All four inter-device inputs are registered one stage before use. The
//!   two-clock trigger dwell and the two-clock success wait exactly cover
//!   that latency in both directions, so after a successful attempt the two
//!   devices re-enter idle within two clocks of each other.
//!
//! The slave also ORs the master's timeout line into its own timeout so
//! both devices finish even when only the master's timer fires.

use tracing::trace;

use crate::M_MASK;

/// Width of the run-scoped event counters (`cycles_completed` and the
/// trigger tally), in bits.
pub const EVENT_COUNTER_WIDTH: u32 = 14;

/// Mask for run-scoped event counters.
pub const EVENT_COUNTER_MASK: u16 = (1 << EVENT_COUNTER_WIDTH) - 1;

/// Attempt phases. The trigger dwell and the slave success wait are split
/// over two states each to mirror the one-stage registration of the link
/// inputs on the far side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Idle,
    TriggerSlave,
    TriggerSlave2,
    Counter,
    SlaveSuccessWait,
    SlaveSuccessCheck,
}

/// Raw inter-device inputs as sampled from the link pads this clock. They
/// are registered one stage inside the state machine before use.
#[derive(Clone, Copy, Default)]
pub struct LinkIn {
    /// Master's attempt trigger (slave side).
    pub trigger: bool,
    /// Master's success broadcast (slave side).
    pub success: bool,
    /// Master's timeout line (slave side).
    pub timeout: bool,
    /// Slave's ready line (master side).
    pub slave_ready: bool,
}

/// Per-clock strobes and levels derived while advancing the machine. All of
/// them describe the clock that was just processed.
#[derive(Clone, Copy)]
pub struct MsmTick {
    /// Cursor value during the processed clock.
    pub m: u16,
    /// The machine sat in idle this clock; per-attempt state clears now.
    pub cycle_starting: bool,
    /// The cursor reached the end of the attempt this clock.
    pub cycle_ending: bool,
    /// One-clock completion strobe for the whole run.
    pub done_stb: bool,
    /// Trigger line level towards the slave.
    pub trigger_out: bool,
    /// Timeout level (own timer, or the master's for a slave).
    pub timeout: bool,
}

pub struct MainStateMachine {
    pub state: State,
    /// Cycle-relative time cursor. Reset every idle clock, incremented while
    /// counting. It parks one past `m_end` between the end of counting and
    /// the next idle clock so that `cycle_ending` is a one-clock strobe.
    pub m: u16,
    /// Length of one attempt in clocks.
    pub m_end: u16,
    /// Clocks left before the run times out.
    pub time_remaining: u32,
    /// Reload value for `time_remaining`, written by the host.
    pub time_remaining_buf: u32,
    /// Attempts completed since the run started.
    pub cycles_completed: u16,
    pub running: bool,
    pub ready: bool,
    pub success: bool,
    pub is_master: bool,
    /// Single-device mode: act as master but ignore the absent partner.
    pub standalone: bool,
    // Link inputs after their one-stage registration.
    trigger_in: bool,
    success_in: bool,
    slave_ready: bool,
    timeout_in: bool,
    done_d: bool,
}

impl Default for MainStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl MainStateMachine {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            m: 0,
            m_end: 0,
            time_remaining: 0,
            time_remaining_buf: 0,
            cycles_completed: 0,
            running: false,
            ready: false,
            success: false,
            is_master: false,
            standalone: false,
            trigger_in: false,
            success_in: false,
            slave_ready: false,
            timeout_in: false,
            done_d: false,
        }
    }

    /// Effective role: a standalone device behaves as the master.
    pub fn act_as_master(&self) -> bool {
        self.is_master || self.standalone
    }

    /// Timeout level: own countdown exhausted, or (slave only) the master
    /// reported timeout. The OR keeps the pair finishing together when only
    /// the master's timer fires.
    pub fn timeout(&self) -> bool {
        self.time_remaining == 0 || (!self.act_as_master() && self.timeout_in)
    }

    /// Trigger line level towards the slave during this clock.
    pub fn trigger_out(&self) -> bool {
        matches!(self.state, State::TriggerSlave | State::TriggerSlave2)
    }

    /// Advance one clock.
    ///
    /// All registered state is read before it is written, so every update
    /// sees the values that held during the processed clock; the cursor
    /// value and the derived strobes for that clock are returned.
    pub fn tick(&mut self, run_stb: bool, herald: bool, link: LinkIn) -> MsmTick {
        let m = self.m;
        let cycle_starting = self.state == State::Idle;
        let cycle_ending = self.m == self.m_end;
        let timeout = self.timeout();
        let finishing = !run_stb && self.running && (timeout || self.success);
        let done = finishing && cycle_starting;
        let done_stb = done && !self.done_d;
        let trigger_out = self.trigger_out();
        let act_as_master = self.act_as_master();

        let next_state = match self.state {
            State::Idle => {
                let start = !finishing
                    && self.ready
                    && if act_as_master {
                        self.slave_ready || self.standalone
                    } else {
                        self.trigger_in
                    };
                match (start, act_as_master) {
                    (true, true) => State::TriggerSlave,
                    (true, false) => State::Counter,
                    (false, _) => State::Idle,
                }
            }
            State::TriggerSlave => State::TriggerSlave2,
            State::TriggerSlave2 => State::Counter,
            State::Counter => {
                if cycle_ending {
                    if act_as_master {
                        State::Idle
                    } else {
                        State::SlaveSuccessWait
                    }
                } else {
                    State::Counter
                }
            }
            State::SlaveSuccessWait => State::SlaveSuccessCheck,
            State::SlaveSuccessCheck => State::Idle,
        };

        match self.state {
            State::Idle => self.m = 0,
            State::Counter => {
                // Increments past m_end on the closing clock; idle resets it.
                self.m = (self.m + 1) & M_MASK;
                if cycle_ending {
                    self.cycles_completed = (self.cycles_completed + 1) & EVENT_COUNTER_MASK;
                    if act_as_master && herald {
                        self.success = true;
                    }
                }
            }
            State::SlaveSuccessCheck => {
                if self.success_in {
                    self.success = true;
                }
            }
            _ => {}
        }

        if run_stb {
            trace!(
                timeout_clocks = self.time_remaining_buf,
                m_end = self.m_end,
                "run starting"
            );
            self.running = true;
            self.ready = true;
            self.cycles_completed = 0;
            self.success = false;
            self.time_remaining = self.time_remaining_buf;
        } else {
            if done_stb {
                trace!(
                    success = self.success,
                    cycles = self.cycles_completed,
                    "run finished"
                );
                self.running = false;
            }
            if !timeout {
                self.time_remaining -= 1;
            }
            if finishing {
                self.ready = false;
            }
        }
        self.done_d = done;

        self.trigger_in = link.trigger;
        self.success_in = link.success;
        self.slave_ready = link.slave_ready;
        self.timeout_in = link.timeout;
        self.state = next_state;

        MsmTick {
            m,
            cycle_starting,
            cycle_ending,
            done_stb,
            trigger_out,
            timeout,
        }
    }
}
