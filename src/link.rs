//! Inter-device link wires and the device-pair harness.
//!
//! Four point-to-point signals ride bidirectional differential pads between
//! the two devices: the slave's `ready` line one way; the master's
//! `trigger`, `success`, and `timeout` lines the other. Each wire is driven
//! only by the role it belongs to, and only while that device is enabled
//! and not standalone; an undriven wire reads low. A fifth wire carries the
//! slave's pulsed-laser passthrough copy to the master for calibration use
//! while the cores are idle.
//!
//! Both devices sample all wires every clock; the state machines register
//! them one stage before use, which is what the two-clock dwells in the
//! state machine compensate for.

use crate::bus::{OutputEvent, RegisterBus};
use crate::core::core::{EntanglerCore, PhyInputs};
use crate::msm::LinkIn;

/// Wire levels on the inter-device link during one clock.
#[derive(Clone, Copy, Default)]
pub struct LinkWires {
    pub slave_ready: bool,
    pub trigger: bool,
    pub success: bool,
    pub timeout: bool,
    pub slave_laser: bool,
}

fn drives_link(core: &EntanglerCore) -> bool {
    core.enable && !core.msm.standalone
}

/// Sample the wire levels from both devices' current state, honouring the
/// role-gated drive enables.
pub fn wire_levels(
    master: &EntanglerCore,
    slave: &EntanglerCore,
    slave_laser_passthrough: bool,
) -> LinkWires {
    let mut wires = LinkWires::default();
    if master.msm.is_master && drives_link(master) {
        wires.trigger = master.msm.trigger_out();
        wires.success = master.msm.success;
        wires.timeout = master.msm.timeout();
    }
    if !slave.msm.is_master && drives_link(slave) {
        wires.slave_ready = slave.msm.ready;
    }
    if !slave.msm.is_master {
        wires.slave_laser = slave.laser_link_out(slave_laser_passthrough);
    }
    wires
}

impl From<LinkWires> for LinkIn {
    fn from(w: LinkWires) -> Self {
        LinkIn {
            trigger: w.trigger,
            success: w.success,
            timeout: w.timeout,
            slave_ready: w.slave_ready,
        }
    }
}

/// Events emitted by the two devices during one lockstep clock.
pub struct PairTick {
    pub master_event: Option<u32>,
    pub slave_event: Option<u32>,
}

/// Two complete devices wired back to back, ticked in lockstep. Roles are
/// assigned by the caller through configuration writes, exactly as on the
/// bench.
pub struct DevicePair {
    pub master: RegisterBus,
    pub slave: RegisterBus,
}

impl Default for DevicePair {
    fn default() -> Self {
        Self::new()
    }
}

impl DevicePair {
    pub fn new() -> Self {
        Self {
            master: RegisterBus::new(),
            slave: RegisterBus::new(),
        }
    }

    /// Advance both devices by one clock with the wires sampled from the
    /// state they held during it.
    pub fn tick(
        &mut self,
        master_out: Option<OutputEvent>,
        slave_out: Option<OutputEvent>,
        master_phys: &PhyInputs,
        slave_phys: &PhyInputs,
    ) -> PairTick {
        let wires = wire_levels(&self.master.core, &self.slave.core, false);
        PairTick {
            master_event: self.master.tick(master_out, wires.into(), master_phys),
            slave_event: self.slave.tick(slave_out, wires.into(), slave_phys),
        }
    }
}
