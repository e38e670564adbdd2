//! The coordinator owns every feeder, FPS tracker, lane group, runout
//! monitor and clog detector, and binds them together under the host's
//! periodic tick.
//!
//! Tick order is fixed: telemetry intake, FPS reconcile, runout step, clog
//! step, operation step. Monitors see the snapshot taken at intake and
//! mutate nothing themselves; every mutation funnels through this module.
//!
//! Commands are asynchronous. Validation failures (`NOT_READY`, `BUSY`,
//! unknown names) surface immediately; accepted operations return a
//! [`Ticket`] that resolves over subsequent ticks, with the final outcome
//! also announced through [`Host::respond`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use oams_traits::{BAY_COUNT, Clock, FeederPort, FollowerDirection, Host};
use tracing::{error, info, warn};

use crate::clog::{ClogDetector, ClogSensitivity};
use crate::error::{AmsError, BuildError, Result};
use crate::feeder::{Feeder, FeederCfg, FeederState};
use crate::fps::{Binding, FpsCfg, FpsTracker, LoadState};
use crate::group::LaneGroup;
use crate::op::{OpDriver, OpKind, OpProgress};
use crate::runout::{RunoutAction, RunoutCfg, RunoutMonitor, RunoutState};

pub use oams_traits::TICK_MS;

pub fn tick_period() -> Duration {
    Duration::from_millis(TICK_MS)
}

/// Manager-level tunables shared by all monitors.
#[derive(Debug, Clone)]
pub struct ManagerCfg {
    /// How far before the toolhead the reload should land; doubles as the
    /// coast distance past the runout trigger.
    pub reload_before_toolhead_distance: f64,
    pub clog_sensitivity: ClogSensitivity,
    /// Extruder travel past the trigger before the follower is coasted.
    pub runout_pause_distance: f64,
    pub bowden_clear_grace_ms: u64,
}

impl Default for ManagerCfg {
    fn default() -> Self {
        Self {
            reload_before_toolhead_distance: 0.0,
            clog_sensitivity: ClogSensitivity::Medium,
            runout_pause_distance: 60.0,
            bowden_clear_grace_ms: 200,
        }
    }
}

/// Handle for an accepted asynchronous command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(u64);

#[derive(Debug, Clone, PartialEq)]
pub enum TicketState {
    Pending,
    Done(std::result::Result<(), AmsError>),
}

#[derive(Debug, Clone)]
enum OpOrigin {
    Command { ticket: Ticket, fps: Option<String> },
    Runout { fps: String },
}

struct ActiveOp {
    driver: OpDriver,
    origin: OpOrigin,
}

/// Read-only snapshot of the whole system, for status surfaces.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub feeders: Vec<FeederState>,
    pub fps: Vec<FpsStatus>,
    pub groups: Vec<GroupStatus>,
}

#[derive(Debug, Clone)]
pub struct FpsStatus {
    pub name: String,
    pub state: LoadState,
    pub group: Option<String>,
    pub feeder: Option<String>,
    pub bay: Option<u8>,
    pub following: bool,
    pub direction: FollowerDirection,
    pub runout: RunoutState,
    pub clog_tripped: bool,
    pub recent_motion: bool,
}

#[derive(Debug, Clone)]
pub struct GroupStatus {
    pub name: String,
    pub loaded: Option<(String, u8)>,
    pub available: Vec<(String, u8)>,
}

#[derive(Default)]
pub struct CoordinatorBuilder {
    clock: Option<Arc<dyn Clock + Send + Sync>>,
    host: Option<Arc<dyn Host + Send + Sync>>,
    manager: Option<ManagerCfg>,
    feeders: Vec<(String, FeederCfg, Box<dyn FeederPort>)>,
    fps: Vec<(String, FpsCfg)>,
    groups: Vec<(String, Vec<(String, u8)>)>,
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults to the real monotonic clock when not provided.
    pub fn with_clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_host(mut self, host: Arc<dyn Host + Send + Sync>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_manager(mut self, manager: ManagerCfg) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn add_feeder(
        mut self,
        name: impl Into<String>,
        cfg: FeederCfg,
        port: Box<dyn FeederPort>,
    ) -> Self {
        self.feeders.push((name.into(), cfg, port));
        self
    }

    pub fn add_fps(mut self, name: impl Into<String>, cfg: FpsCfg) -> Self {
        self.fps.push((name.into(), cfg));
        self
    }

    pub fn add_group(mut self, name: impl Into<String>, members: Vec<(String, u8)>) -> Self {
        self.groups.push((name.into(), members));
        self
    }

    /// Validate cross-references and assemble the coordinator.
    pub fn build(self) -> Result<Coordinator> {
        let host = self
            .host
            .ok_or_else(|| eyre::Report::new(BuildError::MissingHost))?;
        if self.feeders.is_empty() {
            return Err(eyre::Report::new(BuildError::NoFeeders));
        }
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(oams_traits::MonotonicClock::new()));
        let manager = self.manager.unwrap_or_default();

        let mut feeders = BTreeMap::new();
        for (name, cfg, port) in self.feeders {
            if cfg.fps_lower_threshold >= cfg.fps_upper_threshold {
                return Err(eyre::Report::new(BuildError::InvalidConfig(format!(
                    "feeder {name}: pressure lower threshold must be below upper"
                ))));
            }
            if feeders
                .insert(name.clone(), Feeder::new(name.clone(), cfg, port))
                .is_some()
            {
                return Err(eyre::Report::new(BuildError::InvalidConfig(format!(
                    "duplicate feeder '{name}'"
                ))));
            }
        }

        let mut fps = BTreeMap::new();
        for (name, cfg) in self.fps {
            for feeder in &cfg.feeders {
                if !feeders.contains_key(feeder) {
                    return Err(eyre::Report::new(BuildError::UnknownFeeder(feeder.clone())));
                }
            }
            fps.insert(name.clone(), FpsTracker::new(name, cfg));
        }

        let mut groups = BTreeMap::new();
        for (name, members) in self.groups {
            for (feeder, bay) in &members {
                if !feeders.contains_key(feeder) {
                    return Err(eyre::Report::new(BuildError::UnknownFeeder(feeder.clone())));
                }
                if usize::from(*bay) >= BAY_COUNT {
                    return Err(eyre::Report::new(BuildError::InvalidConfig(format!(
                        "group {name}: bay {bay} out of range"
                    ))));
                }
            }
            groups.insert(name.clone(), LaneGroup::new(name, members));
        }

        let runout_cfg = RunoutCfg {
            pause_distance: manager.runout_pause_distance,
            coast_distance: manager.reload_before_toolhead_distance,
            bowden_clear_grace_ms: manager.bowden_clear_grace_ms,
        };
        let runouts = fps
            .keys()
            .map(|name| (name.clone(), RunoutMonitor::new(name.clone(), runout_cfg.clone())))
            .collect();
        let clogs = fps
            .keys()
            .map(|name| {
                (
                    name.clone(),
                    ClogDetector::new(name.clone(), manager.clog_sensitivity),
                )
            })
            .collect();

        Ok(Coordinator {
            clock,
            host,
            manager,
            feeders,
            fps,
            groups,
            runouts,
            clogs,
            ops: BTreeMap::new(),
            overrides: BTreeMap::new(),
            next_ticket: 0,
            tickets: BTreeMap::new(),
        })
    }
}

pub struct Coordinator {
    clock: Arc<dyn Clock + Send + Sync>,
    host: Arc<dyn Host + Send + Sync>,
    manager: ManagerCfg,
    feeders: BTreeMap<String, Feeder>,
    fps: BTreeMap<String, FpsTracker>,
    groups: BTreeMap<String, LaneGroup>,
    runouts: BTreeMap<String, RunoutMonitor>,
    clogs: BTreeMap<String, ClogDetector>,
    ops: BTreeMap<String, ActiveOp>,
    overrides: BTreeMap<String, String>,
    next_ticket: u64,
    tickets: BTreeMap<Ticket, TicketState>,
}

impl Coordinator {
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::new()
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn ticket_state(&self, ticket: Ticket) -> Option<TicketState> {
        self.tickets.get(&ticket).cloned()
    }

    fn new_ticket(&mut self) -> Ticket {
        self.next_ticket += 1;
        let ticket = Ticket(self.next_ticket);
        self.tickets.insert(ticket, TicketState::Pending);
        ticket
    }

    /// One scheduler period. Never blocks; suspensions are expressed as
    /// state that later ticks observe.
    pub fn tick(&mut self) {
        let now = self.now_ms();

        // 1. Telemetry intake; aperiodic signals go to the feeder's
        //    in-flight operation.
        for (name, feeder) in self.feeders.iter_mut() {
            let signals = feeder.intake();
            if feeder.is_faulted()
                && let Some(op) = self.ops.get_mut(name)
            {
                op.driver.fail_comm();
            }
            for signal in &signals {
                if let Some(op) = self.ops.get_mut(name) {
                    op.driver.on_signal(signal, now);
                }
            }
        }

        // 2. FPS reconcile.
        for tracker in self.fps.values_mut() {
            tracker.reconcile(now, &self.feeders, &self.groups);
        }

        // 3. Runout monitors.
        let mut runout_cmds: Vec<(String, RunoutAction)> = Vec::new();
        for (name, monitor) in self.runouts.iter_mut() {
            let Some(tracker) = self.fps.get(name) else {
                continue;
            };
            let position = self.host.extruder_position(&tracker.cfg().extruder);
            for action in monitor.tick(
                now,
                position,
                tracker,
                &self.feeders,
                &self.groups,
                &self.overrides,
            ) {
                runout_cmds.push((name.clone(), action));
            }
        }
        for (fps_name, action) in runout_cmds {
            self.exec_runout_action(&fps_name, action, now);
        }

        // 4. Clog detectors.
        for (name, detector) in self.clogs.iter_mut() {
            let Some(tracker) = self.fps.get(name) else {
                continue;
            };
            let binding = tracker.binding();
            let active = tracker.is_loaded()
                && tracker.following()
                && tracker.direction() == FollowerDirection::Forward
                && binding.is_some_and(|b| !self.ops.contains_key(&b.feeder));
            let (position, encoder, ticks_per_mm) = match binding {
                Some(b) => {
                    let feeder = self.feeders.get(&b.feeder);
                    (
                        self.host.extruder_position(&tracker.cfg().extruder),
                        feeder.map_or(0, Feeder::encoder_total),
                        feeder.map_or(40.0, |f| f.cfg().ticks_per_mm),
                    )
                }
                None => (0.0, 0, 40.0),
            };
            if let Some(trip) = detector.tick(active, position, encoder, ticks_per_mm) {
                let err = AmsError::ClogDetected {
                    fps: trip.fps.clone(),
                    detail: format!(
                        "{} ticks observed over {} mm, expected at least {:.0}",
                        trip.observed_ticks, trip.window_mm, trip.expected_ticks
                    ),
                };
                let reason = err.to_string();
                error!(fps = %name, "{reason}");
                self.host.pause_print(&reason);
                self.host.respond(&reason);
            }
        }

        // 5. Operation watchdog / retry step.
        let op_names: Vec<String> = self.ops.keys().cloned().collect();
        for name in op_names {
            let progress = {
                let (Some(op), Some(feeder)) =
                    (self.ops.get_mut(&name), self.feeders.get_mut(&name))
                else {
                    continue;
                };
                op.driver.step(feeder, now)
            };
            if progress != OpProgress::Pending
                && let Some(op) = self.ops.remove(&name)
            {
                self.finalize_op(&name, op, progress, now);
            }
        }
    }

    fn exec_runout_action(&mut self, fps_name: &str, action: RunoutAction, now: u64) {
        match action {
            RunoutAction::CoastFollower { feeder } => {
                if let Some(f) = self.feeders.get_mut(&feeder) {
                    let _ = f.set_follower(false, FollowerDirection::Forward);
                }
                if let Some(t) = self.fps.get_mut(fps_name) {
                    let direction = t.direction();
                    t.note_follower(false, direction);
                }
                info!(fps = %fps_name, feeder = %feeder, "follower coasted after runout");
            }
            RunoutAction::Reload { feeder, bay } => {
                let outcome = self.start_runout_load(fps_name, &feeder, bay, now);
                if let Err(e) = outcome {
                    error!(fps = %fps_name, feeder = %feeder, bay, error = %e, "runout reload failed to start");
                    if let Some(m) = self.runouts.get_mut(fps_name) {
                        m.on_reload_done(false);
                    }
                    self.host.pause_print(&e.to_string());
                }
            }
            RunoutAction::Pause { reason } => {
                error!(fps = %fps_name, "{reason}");
                self.host.respond(&reason);
                self.host.pause_print(&reason);
            }
        }
    }

    /// Drop `current_bay` on serving feeders whose hub has lost the
    /// filament: the binding is stale after a runout and would otherwise
    /// block the next load.
    fn release_stale_bays(&mut self, serves: &[String]) {
        for name in serves {
            if self.ops.contains_key(name) {
                continue;
            }
            if let Some(feeder) = self.feeders.get_mut(name)
                && let Some(bay) = feeder.current_bay()
                && !feeder.hub_present(bay)
            {
                info!(feeder = %name, bay, "releasing ran-out bay");
                feeder.set_current_bay(None);
            }
        }
    }

    fn start_runout_load(
        &mut self,
        fps_name: &str,
        feeder_name: &str,
        bay: u8,
        now: u64,
    ) -> std::result::Result<(), AmsError> {
        let serves = self
            .fps
            .get(fps_name)
            .map(|t| t.cfg().feeders.clone())
            .unwrap_or_default();
        self.release_stale_bays(&serves);
        if self.ops.contains_key(feeder_name) {
            return Err(AmsError::Busy {
                feeder: feeder_name.to_string(),
            });
        }
        let feeder = self
            .feeders
            .get_mut(feeder_name)
            .ok_or_else(|| AmsError::UnknownName {
                kind: "feeder",
                name: feeder_name.to_string(),
            })?;
        let driver = OpDriver::start_load(feeder, bay, now)?;
        self.ops.insert(
            feeder_name.to_string(),
            ActiveOp {
                driver,
                origin: OpOrigin::Runout {
                    fps: fps_name.to_string(),
                },
            },
        );
        if let Some(t) = self.fps.get_mut(fps_name) {
            t.set_loading(now);
        }
        info!(fps = %fps_name, feeder = %feeder_name, bay, "runout reload started");
        Ok(())
    }

    fn group_of(&self, feeder: &str, bay: u8) -> Option<String> {
        self.groups
            .values()
            .find(|g| g.contains(feeder, bay))
            .map(|g| g.name().to_string())
    }

    fn finalize_op(&mut self, feeder_name: &str, op: ActiveOp, progress: OpProgress, now: u64) {
        let kind = op.driver.kind();
        match (kind, progress) {
            (OpKind::Load { bay }, OpProgress::Complete) => {
                let group = self.group_of(feeder_name, bay);
                let binding = Binding {
                    group,
                    feeder: feeder_name.to_string(),
                    bay,
                };
                match op.origin {
                    OpOrigin::Command { ticket, fps } => {
                        if let Some(fps_name) = fps.as_deref()
                            && let Some(t) = self.fps.get_mut(fps_name)
                        {
                            t.bind_loaded(binding, now);
                        }
                        if let Some(fps_name) = fps.as_deref()
                            && let Some(d) = self.clogs.get_mut(fps_name)
                        {
                            d.reset();
                        }
                        self.tickets.insert(ticket, TicketState::Done(Ok(())));
                        self.host
                            .respond(&format!("spool loaded: {feeder_name} bay {bay}"));
                    }
                    OpOrigin::Runout { fps } => {
                        if let Some(t) = self.fps.get_mut(&fps) {
                            t.bind_loaded(binding, now);
                            t.note_follower(true, FollowerDirection::Forward);
                        }
                        if let Some(f) = self.feeders.get_mut(feeder_name) {
                            let _ = f.set_follower(true, FollowerDirection::Forward);
                        }
                        if let Some(d) = self.clogs.get_mut(&fps) {
                            d.reset();
                        }
                        if let Some(m) = self.runouts.get_mut(&fps) {
                            m.on_reload_done(true);
                        }
                        self.host.respond(&format!(
                            "runout recovered: {feeder_name} bay {bay} now feeding {fps}"
                        ));
                    }
                }
            }
            (OpKind::Load { bay }, OpProgress::Failed { reason, attempts }) => {
                if let Some(f) = self.feeders.get_mut(feeder_name) {
                    f.set_led(bay, true);
                }
                let err = AmsError::LoadFailed {
                    feeder: feeder_name.to_string(),
                    bay,
                    attempts,
                    reason,
                };
                match op.origin {
                    OpOrigin::Command { ticket, fps } => {
                        if let Some(fps_name) = fps.as_deref()
                            && let Some(t) = self.fps.get_mut(fps_name)
                        {
                            t.clear(now);
                        }
                        self.tickets
                            .insert(ticket, TicketState::Done(Err(err.clone())));
                        self.host.respond(&err.to_string());
                    }
                    OpOrigin::Runout { fps } => {
                        if let Some(t) = self.fps.get_mut(&fps) {
                            t.clear(now);
                        }
                        if let Some(m) = self.runouts.get_mut(&fps) {
                            m.on_reload_done(false);
                        }
                        self.host.pause_print(&err.to_string());
                    }
                }
            }
            (OpKind::Unload { bay }, OpProgress::Complete) => {
                if let OpOrigin::Command { ticket, fps } = op.origin {
                    if let Some(fps_name) = fps.as_deref() {
                        if let Some(t) = self.fps.get_mut(fps_name) {
                            t.clear(now);
                        }
                        if let Some(d) = self.clogs.get_mut(fps_name) {
                            d.reset();
                        }
                    }
                    self.tickets.insert(ticket, TicketState::Done(Ok(())));
                    self.host
                        .respond(&format!("spool unloaded: {feeder_name} bay {bay}"));
                }
            }
            (OpKind::Unload { bay }, OpProgress::Failed { reason, attempts }) => {
                if let Some(f) = self.feeders.get_mut(feeder_name) {
                    f.set_led(bay, true);
                }
                let err = AmsError::UnloadFailed {
                    feeder: feeder_name.to_string(),
                    attempts,
                    reason,
                };
                if let OpOrigin::Command { ticket, fps } = op.origin {
                    if let Some(fps_name) = fps.as_deref()
                        && let Some(t) = self.fps.get_mut(fps_name)
                    {
                        // Reconcile restores LOADED next tick if the hub
                        // is in fact still engaged.
                        t.clear(now);
                    }
                    self.tickets
                        .insert(ticket, TicketState::Done(Err(err.clone())));
                    self.host.respond(&err.to_string());
                }
            }
            (_, OpProgress::Pending) => {
                warn!(feeder = %feeder_name, "finalize called on pending op");
            }
        }
    }

    /// Select and load the next available bay for `fps`, optionally
    /// restricted to one lane group.
    pub fn load_spool(
        &mut self,
        fps_name: &str,
        group: Option<&str>,
    ) -> std::result::Result<Ticket, AmsError> {
        let now = self.now_ms();
        let tracker = self
            .fps
            .get(fps_name)
            .ok_or_else(|| AmsError::UnknownName {
                kind: "fps",
                name: fps_name.to_string(),
            })?;
        let serves = tracker.cfg().feeders.clone();
        match tracker.state() {
            LoadState::Loaded => {
                return Err(AmsError::AlreadyLoaded {
                    fps: fps_name.to_string(),
                });
            }
            LoadState::Loading | LoadState::Unloading => {
                let feeder = serves
                    .iter()
                    .find(|f| self.ops.contains_key(*f))
                    .cloned()
                    .unwrap_or_else(|| fps_name.to_string());
                return Err(AmsError::Busy { feeder });
            }
            LoadState::Unloaded => {}
        }
        self.release_stale_bays(&serves);

        let (feeder_name, bay) = match group {
            Some(g) => {
                let lane = self.groups.get(g).ok_or_else(|| AmsError::UnknownName {
                    kind: "group",
                    name: g.to_string(),
                })?;
                lane.available(&self.feeders)
                    .into_iter()
                    .find(|(f, _)| serves.iter().any(|s| s == f))
                    .map(|(f, b)| (f.to_string(), b))
                    .ok_or_else(|| AmsError::NoSpoolAvailable {
                        group: g.to_string(),
                    })?
            }
            None => self
                .groups
                .values()
                .find_map(|lane| {
                    lane.available(&self.feeders)
                        .into_iter()
                        .find(|(f, _)| serves.iter().any(|s| s == f))
                        .map(|(f, b)| (f.to_string(), b))
                })
                .ok_or_else(|| AmsError::NoSpoolAvailable {
                    group: "any".to_string(),
                })?,
        };

        if self.ops.contains_key(&feeder_name) {
            return Err(AmsError::Busy {
                feeder: feeder_name,
            });
        }
        let feeder = self
            .feeders
            .get_mut(&feeder_name)
            .ok_or_else(|| AmsError::UnknownName {
                kind: "feeder",
                name: feeder_name.clone(),
            })?;
        if feeder.is_faulted() {
            return Err(AmsError::FeederFaulted {
                feeder: feeder_name,
            });
        }
        let driver = OpDriver::start_load(feeder, bay, now)?;
        let ticket = self.new_ticket();
        self.ops.insert(
            feeder_name,
            ActiveOp {
                driver,
                origin: OpOrigin::Command {
                    ticket,
                    fps: Some(fps_name.to_string()),
                },
            },
        );
        if let Some(t) = self.fps.get_mut(fps_name) {
            t.set_loading(now);
        }
        Ok(ticket)
    }

    /// Unload whatever currently feeds `fps`.
    pub fn unload_spool(&mut self, fps_name: &str) -> std::result::Result<Ticket, AmsError> {
        let now = self.now_ms();
        let tracker = self
            .fps
            .get(fps_name)
            .ok_or_else(|| AmsError::UnknownName {
                kind: "fps",
                name: fps_name.to_string(),
            })?;
        let binding = match tracker.state() {
            LoadState::Loaded => tracker.binding().cloned(),
            LoadState::Loading | LoadState::Unloading => {
                return Err(AmsError::Busy {
                    feeder: fps_name.to_string(),
                });
            }
            LoadState::Unloaded => None,
        };
        let Some(binding) = binding else {
            return Err(AmsError::NotLoaded {
                fps: fps_name.to_string(),
            });
        };
        if self.ops.contains_key(&binding.feeder) {
            return Err(AmsError::Busy {
                feeder: binding.feeder,
            });
        }
        let feeder = self
            .feeders
            .get_mut(&binding.feeder)
            .ok_or_else(|| AmsError::UnknownName {
                kind: "feeder",
                name: binding.feeder.clone(),
            })?;
        if feeder.is_faulted() {
            return Err(AmsError::FeederFaulted {
                feeder: binding.feeder,
            });
        }
        // The follower must not fight the unload.
        let _ = feeder.set_follower(false, FollowerDirection::Forward);
        let driver = OpDriver::start_unload(feeder, now)?;
        let ticket = self.new_ticket();
        self.ops.insert(
            binding.feeder.clone(),
            ActiveOp {
                driver,
                origin: OpOrigin::Command {
                    ticket,
                    fps: Some(fps_name.to_string()),
                },
            },
        );
        if let Some(t) = self.fps.get_mut(fps_name) {
            t.note_follower(false, FollowerDirection::Forward);
            t.set_unloading(now);
        }
        Ok(ticket)
    }

    /// Enable or disable the pressure follower on the feeder bound to `fps`.
    pub fn set_follower(
        &mut self,
        fps_name: &str,
        enable: bool,
        direction: FollowerDirection,
    ) -> std::result::Result<(), AmsError> {
        let tracker = self
            .fps
            .get(fps_name)
            .ok_or_else(|| AmsError::UnknownName {
                kind: "fps",
                name: fps_name.to_string(),
            })?;
        let Some(binding) = tracker.binding().cloned() else {
            return Err(AmsError::NotLoaded {
                fps: fps_name.to_string(),
            });
        };
        if self.ops.contains_key(&binding.feeder) {
            return Err(AmsError::Busy {
                feeder: binding.feeder,
            });
        }
        let feeder = self
            .feeders
            .get_mut(&binding.feeder)
            .ok_or_else(|| AmsError::UnknownName {
                kind: "feeder",
                name: binding.feeder.clone(),
            })?;
        feeder.set_follower(enable, direction)?;
        if let Some(t) = self.fps.get_mut(fps_name) {
            t.note_follower(enable, direction);
        }
        Ok(())
    }

    /// Record an explicit runout override: when `lane` runs out, look for a
    /// replacement in `backup` first.
    pub fn set_runout(&mut self, lane: &str, backup: &str) -> std::result::Result<(), AmsError> {
        for name in [lane, backup] {
            if !self.groups.contains_key(name) {
                return Err(AmsError::UnknownName {
                    kind: "group",
                    name: name.to_string(),
                });
            }
        }
        self.overrides.insert(lane.to_string(), backup.to_string());
        Ok(())
    }

    /// Operator abort of an in-flight command.
    pub fn cancel(&mut self, ticket: Ticket) -> std::result::Result<(), AmsError> {
        let now = self.now_ms();
        let Some(feeder_name) = self.ops.iter().find_map(|(name, op)| {
            matches!(op.origin, OpOrigin::Command { ticket: t, .. } if t == ticket)
                .then(|| name.clone())
        }) else {
            return Err(AmsError::Command(format!(
                "no in-flight operation for ticket {ticket:?}"
            )));
        };
        if let Some(op) = self.ops.get_mut(&feeder_name)
            && let Some(feeder) = self.feeders.get_mut(&feeder_name)
        {
            op.driver.cancel(feeder);
        }
        if let Some(op) = self.ops.remove(&feeder_name) {
            let progress = op.driver.progress();
            self.finalize_op(&feeder_name, op, progress, now);
        }
        Ok(())
    }

    /// Re-query every feeder, lift fault latches, clear error LEDs and
    /// re-arm monitors. The only path out of `MCU_COMM_ERROR`.
    pub fn clear_errors(&mut self) -> std::result::Result<(), AmsError> {
        let mut first_err = None;
        for feeder in self.feeders.values_mut() {
            if let Err(e) = feeder.resync() {
                warn!(feeder = %feeder.name(), error = %e, "resync failed");
                first_err.get_or_insert(e);
                continue;
            }
            for bay in 0..BAY_COUNT as u8 {
                feeder.set_led(bay, false);
            }
        }
        for monitor in self.runouts.values_mut() {
            monitor.disable();
        }
        for detector in self.clogs.values_mut() {
            detector.reset();
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Explicitly stop runout handling for one FPS.
    pub fn disable_runout(&mut self, fps_name: &str) -> std::result::Result<(), AmsError> {
        let monitor = self
            .runouts
            .get_mut(fps_name)
            .ok_or_else(|| AmsError::UnknownName {
                kind: "fps",
                name: fps_name.to_string(),
            })?;
        monitor.disable();
        Ok(())
    }

    pub fn calibrate_hub(&mut self, feeder_name: &str, bay: u8) -> std::result::Result<(), AmsError> {
        let feeder = self
            .feeders
            .get_mut(feeder_name)
            .ok_or_else(|| AmsError::UnknownName {
                kind: "feeder",
                name: feeder_name.to_string(),
            })?;
        feeder.calibrate_hub(bay)
    }

    pub fn calibrate_ptfe(
        &mut self,
        feeder_name: &str,
        bay: u8,
    ) -> std::result::Result<(), AmsError> {
        let feeder = self
            .feeders
            .get_mut(feeder_name)
            .ok_or_else(|| AmsError::UnknownName {
                kind: "feeder",
                name: feeder_name.to_string(),
            })?;
        feeder.calibrate_ptfe(bay)
    }

    /// Name of the lane group currently feeding, if any.
    pub fn current_loaded_group(&self) -> Option<&str> {
        self.groups
            .values()
            .find(|g| g.loaded(&self.feeders).is_some())
            .map(LaneGroup::name)
    }

    pub fn runout_state(&self, fps_name: &str) -> Option<RunoutState> {
        self.runouts.get(fps_name).map(RunoutMonitor::state)
    }

    pub fn fps_state(&self, fps_name: &str) -> Option<LoadState> {
        self.fps.get(fps_name).map(FpsTracker::state)
    }

    pub fn fps_binding(&self, fps_name: &str) -> Option<Binding> {
        self.fps.get(fps_name).and_then(|t| t.binding().cloned())
    }

    pub fn feeder_snapshot(&self, feeder_name: &str) -> Option<FeederState> {
        self.feeders.get(feeder_name).map(Feeder::snapshot)
    }

    pub fn manager_cfg(&self) -> &ManagerCfg {
        &self.manager
    }

    /// Read-only system snapshot for status surfaces.
    pub fn status(&self) -> StatusReport {
        let now = self.now_ms();
        let feeders = self.feeders.values().map(Feeder::snapshot).collect();
        let fps = self
            .fps
            .values()
            .map(|t| FpsStatus {
                name: t.name().to_string(),
                state: t.state(),
                group: t.binding().and_then(|b| b.group.clone()),
                feeder: t.binding().map(|b| b.feeder.clone()),
                bay: t.binding().map(|b| b.bay),
                following: t.following(),
                direction: t.direction(),
                runout: self
                    .runouts
                    .get(t.name())
                    .map_or(RunoutState::Stopped, RunoutMonitor::state),
                clog_tripped: self.clogs.get(t.name()).is_some_and(ClogDetector::tripped),
                recent_motion: t.recent_motion(now, 2 * TICK_MS, 0),
            })
            .collect();
        let groups = self
            .groups
            .values()
            .map(|g| GroupStatus {
                name: g.name().to_string(),
                loaded: g
                    .loaded(&self.feeders)
                    .map(|(f, b)| (f.to_string(), b)),
                available: g
                    .available(&self.feeders)
                    .into_iter()
                    .map(|(f, b)| (f.to_string(), b))
                    .collect(),
            })
            .collect();
        StatusReport {
            feeders,
            fps,
            groups,
        }
    }
}
