//! Simulation rig: a coordinator wired to simulated feeder MCUs with a
//! scripted firmware model, driven tick by tick on a stepped clock.

use std::collections::BTreeMap;
use std::sync::Arc;

use oams_config::Config;
use oams_core::{
    ClogSensitivity, Coordinator, FeederCfg, FpsCfg, ManagerCfg, Ticket, TicketState,
};
use oams_hardware::{SimCommand, SimulatedFeeder};
use oams_traits::{Host, TickClock};

/// Firmware-side progress of a simulated load/unload.
enum Pending {
    Load { bay: u8, steps: u8 },
    Unload { steps: u8 },
}

/// How many ticks the simulated firmware takes to finish an operation.
const SIM_OP_TICKS: u8 = 2;

pub struct SimRig {
    pub coordinator: Coordinator,
    pub clock: TickClock,
    sims: BTreeMap<String, SimulatedFeeder>,
    pending: BTreeMap<String, Pending>,
}

fn feeder_cfg(cfg: &oams_config::FeederCfg) -> FeederCfg {
    FeederCfg {
        fps_upper_threshold: cfg.fps_upper_threshold,
        fps_lower_threshold: cfg.fps_lower_threshold,
        f1s_hes_on: cfg.f1s_hes_on,
        hub_hes_on: cfg.hub_hes_on,
        ticks_per_mm: cfg.ticks_per_mm,
        load_retry_max: cfg.load_retry_max,
        unload_retry_max: cfg.unload_retry_max,
        retry_backoff_base_ms: cfg.retry_backoff_base_ms,
        retry_backoff_max_ms: cfg.retry_backoff_max_ms,
        min_progress_ticks: cfg.min_progress_ticks,
        stuck_threshold_ms: cfg.stuck_threshold_ms,
        auto_unload_on_failed_load: cfg.auto_unload_on_failed_load,
        load_timeout_ms: cfg.load_timeout_ms,
        unload_timeout_ms: cfg.unload_timeout_ms,
        pressure_grace_ms: cfg.pressure_grace_ms,
    }
}

fn sensitivity(s: oams_config::ClogSensitivity) -> ClogSensitivity {
    match s {
        oams_config::ClogSensitivity::Low => ClogSensitivity::Low,
        oams_config::ClogSensitivity::Medium => ClogSensitivity::Medium,
        oams_config::ClogSensitivity::High => ClogSensitivity::High,
    }
}

impl SimRig {
    pub fn from_config(
        cfg: &Config,
        host: Arc<dyn Host + Send + Sync>,
    ) -> oams_core::error::Result<Self> {
        cfg.validate().map_err(eyre::Report::new)?;
        let clock = TickClock::new();
        let mut sims = BTreeMap::new();
        let mut builder = Coordinator::builder()
            .with_clock(Arc::new(clock.clone()))
            .with_host(host)
            .with_manager(ManagerCfg {
                reload_before_toolhead_distance: cfg.manager.reload_before_toolhead_distance,
                clog_sensitivity: sensitivity(cfg.manager.clog_sensitivity),
                runout_pause_distance: cfg.manager.runout_pause_distance,
                bowden_clear_grace_ms: cfg.manager.bowden_clear_grace_ms,
            });
        for (name, fcfg) in &cfg.feeder {
            let sim = SimulatedFeeder::new();
            sims.insert(name.clone(), sim.clone());
            builder = builder.add_feeder(name.clone(), feeder_cfg(fcfg), Box::new(sim));
        }
        for (name, fps) in &cfg.fps {
            builder = builder.add_fps(
                name.clone(),
                FpsCfg {
                    pin: fps.pin.clone(),
                    extruder: fps.extruder.clone(),
                    feeders: fps.feeders.clone(),
                },
            );
        }
        for (name, group) in &cfg.group {
            let mut members = Vec::new();
            for token in &group.members {
                let (feeder, bay) = oams_config::parse_member(token).map_err(eyre::Report::new)?;
                members.push((feeder, bay));
            }
            builder = builder.add_group(name.clone(), members);
        }
        Ok(Self {
            coordinator: builder.build()?,
            clock,
            sims,
            pending: BTreeMap::new(),
        })
    }

    pub fn sim(&self, name: &str) -> Option<&SimulatedFeeder> {
        self.sims.get(name)
    }

    /// Seat a spool in every bay of every feeder.
    pub fn seed_all_bays(&self) {
        for sim in self.sims.values() {
            for bay in 0..oams_traits::BAY_COUNT {
                sim.set_filament(bay, true);
            }
            sim.push_telemetry();
        }
    }

    /// One 250 ms scheduler period: advance firmware, emit telemetry, tick.
    pub fn step(&mut self) {
        self.clock.tick();
        self.drive_firmware();
        for sim in self.sims.values() {
            sim.push_telemetry();
        }
        self.coordinator.tick();
    }

    /// Model the firmware: motion commands finish after a couple of ticks
    /// with the encoder turning and the pressure pad landing in band.
    fn drive_firmware(&mut self) {
        for (name, sim) in &self.sims {
            for cmd in sim.commands() {
                match cmd {
                    SimCommand::Load(bay) => {
                        self.pending
                            .insert(name.clone(), Pending::Load { bay, steps: SIM_OP_TICKS });
                    }
                    SimCommand::Unload => {
                        self.pending
                            .insert(name.clone(), Pending::Unload { steps: SIM_OP_TICKS });
                    }
                    _ => {}
                }
            }
            sim.clear_commands();
            match self.pending.get_mut(name) {
                Some(Pending::Load { bay, steps }) => {
                    sim.add_encoder(50);
                    if *steps == 0 {
                        sim.set_pressure(0.8);
                        sim.complete_load(*bay);
                        self.pending.remove(name);
                    } else {
                        *steps -= 1;
                    }
                }
                Some(Pending::Unload { steps }) => {
                    sim.add_encoder(-50);
                    if *steps == 0 {
                        sim.set_pressure(0.1);
                        sim.complete_unload();
                        self.pending.remove(name);
                    } else {
                        *steps -= 1;
                    }
                }
                None => {}
            }
        }
    }

    /// Step until the ticket resolves or the budget runs out.
    pub fn run_until_resolved(&mut self, ticket: Ticket, max_ticks: u32) -> Option<TicketState> {
        for _ in 0..max_ticks {
            self.step();
            match self.coordinator.ticket_state(ticket) {
                Some(TicketState::Pending) => {}
                other => return other,
            }
        }
        self.coordinator.ticket_state(ticket)
    }
}
