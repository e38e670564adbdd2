//! Runout monitor: detect → coast → reload, one per FPS.
//!
//! The monitor never mutates feeders or trackers. Each tick it inspects a
//! consistent snapshot and returns the commands the coordinator should
//! route: coast the follower, begin a reload, or pause the print.
//!
//! The monitor keeps its own copy of the watched (feeder, bay) binding:
//! when a spool runs dry the hub sensor drops and the FPS tracker
//! reconciles to `Unloaded`, so detection must not depend on the tracker
//! still holding the binding.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::error::AmsError;
use crate::feeder::Feeder;
use crate::fps::{FpsTracker, LoadState};
use crate::group::LaneGroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunoutState {
    Stopped,
    Monitoring,
    Detected,
    Coasting,
    Reloading,
    Paused,
}

#[derive(Debug, Clone)]
pub struct RunoutCfg {
    /// Extruder travel past the trigger before the follower is coasted.
    pub pause_distance: f64,
    /// Extruder travel past the trigger before a reload is committed.
    pub coast_distance: f64,
    /// How long pressure must stay below the lower threshold before the
    /// bowden counts as drained.
    pub bowden_clear_grace_ms: u64,
}

impl Default for RunoutCfg {
    fn default() -> Self {
        Self {
            pause_distance: 60.0,
            coast_distance: 0.0,
            bowden_clear_grace_ms: 200,
        }
    }
}

/// Commands for the coordinator to execute on the monitor's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum RunoutAction {
    CoastFollower { feeder: String },
    Reload { feeder: String, bay: u8 },
    Pause { reason: String },
}

#[derive(Debug)]
pub struct RunoutMonitor {
    fps: String,
    cfg: RunoutCfg,
    state: RunoutState,
    trigger_position: Option<f64>,
    watched: Option<(String, u8)>,
    watched_group: Option<String>,
    chosen: Option<(String, u8)>,
    pressure_low_since: Option<u64>,
}

impl RunoutMonitor {
    pub fn new(fps: impl Into<String>, cfg: RunoutCfg) -> Self {
        Self {
            fps: fps.into(),
            cfg,
            state: RunoutState::Stopped,
            trigger_position: None,
            watched: None,
            watched_group: None,
            chosen: None,
            pressure_low_since: None,
        }
    }

    pub fn state(&self) -> RunoutState {
        self.state
    }

    pub fn trigger_position(&self) -> Option<f64> {
        self.trigger_position
    }

    fn set_state(&mut self, state: RunoutState) {
        if self.state != state {
            info!(fps = %self.fps, from = ?self.state, to = ?state, "runout state changed");
            self.state = state;
        }
    }

    /// Explicit disable; also used by the error-clearing path.
    pub fn disable(&mut self) {
        self.set_state(RunoutState::Stopped);
        self.trigger_position = None;
        self.watched = None;
        self.watched_group = None;
        self.chosen = None;
        self.pressure_low_since = None;
    }

    /// Outcome of the reload this monitor requested.
    pub(crate) fn on_reload_done(&mut self, ok: bool) {
        if self.state != RunoutState::Reloading {
            return;
        }
        if ok {
            self.trigger_position = None;
            self.chosen = None;
            self.set_state(RunoutState::Monitoring);
        } else {
            self.set_state(RunoutState::Paused);
        }
    }

    pub(crate) fn tick(
        &mut self,
        now_ms: u64,
        extruder_position: f64,
        fps: &FpsTracker,
        feeders: &BTreeMap<String, Feeder>,
        groups: &BTreeMap<String, LaneGroup>,
        overrides: &BTreeMap<String, String>,
    ) -> Vec<RunoutAction> {
        let mut actions = Vec::new();
        match self.state {
            RunoutState::Stopped => {
                if fps.is_loaded()
                    && let Some(b) = fps.binding()
                {
                    self.watched = Some((b.feeder.clone(), b.bay));
                    self.watched_group = b.group.clone();
                    self.set_state(RunoutState::Monitoring);
                }
            }
            RunoutState::Monitoring => {
                // Track the live binding while it exists.
                if fps.is_loaded()
                    && let Some(b) = fps.binding()
                {
                    self.watched = Some((b.feeder.clone(), b.bay));
                    self.watched_group = b.group.clone();
                }
                // A deliberate load/unload owns the feeder; not a runout.
                if matches!(fps.state(), LoadState::Loading | LoadState::Unloading) {
                    return actions;
                }
                let Some((feeder_name, bay)) = self.watched.clone() else {
                    self.set_state(RunoutState::Stopped);
                    return actions;
                };
                let Some(feeder) = feeders.get(&feeder_name) else {
                    self.disable();
                    return actions;
                };
                if feeder.current_bay() == Some(bay) && !feeder.hub_present(bay) {
                    // Spool ran dry while still mechanically engaged.
                    self.trigger_position = Some(extruder_position);
                    info!(
                        fps = %self.fps,
                        feeder = %feeder_name,
                        bay,
                        position = extruder_position,
                        "runout detected"
                    );
                    self.set_state(RunoutState::Detected);
                } else if feeder.current_bay().is_none() && !fps.is_loaded() {
                    // Cleanly unloaded underneath us.
                    self.watched = None;
                    self.watched_group = None;
                    self.set_state(RunoutState::Stopped);
                }
            }
            RunoutState::Detected => {
                if matches!(fps.state(), LoadState::Loading | LoadState::Unloading) {
                    return actions;
                }
                if fps.is_loaded() {
                    // Hub restored (re-seated spool): stand back down.
                    self.trigger_position = None;
                    self.set_state(RunoutState::Monitoring);
                    return actions;
                }
                let trigger = self.trigger_position.unwrap_or(extruder_position);
                if extruder_position - trigger >= self.cfg.pause_distance {
                    if let Some((feeder, _)) = self.watched.clone() {
                        actions.push(RunoutAction::CoastFollower { feeder });
                    }
                    self.chosen = self.select_backup(feeders, groups, overrides);
                    debug!(fps = %self.fps, chosen = ?self.chosen, "coasting");
                    self.pressure_low_since = None;
                    self.set_state(RunoutState::Coasting);
                }
            }
            RunoutState::Coasting => {
                if matches!(fps.state(), LoadState::Loading | LoadState::Unloading) {
                    return actions;
                }
                if fps.is_loaded() {
                    // An operator load resolved the runout under us.
                    self.trigger_position = None;
                    self.chosen = None;
                    self.set_state(RunoutState::Monitoring);
                    return actions;
                }
                // Bowden drain check on the ran-out feeder's pressure pad.
                let drained = if let Some((feeder_name, _)) = &self.watched
                    && let Some(feeder) = feeders.get(feeder_name)
                {
                    if feeder.pressure() < feeder.cfg().fps_lower_threshold {
                        let since = *self.pressure_low_since.get_or_insert(now_ms);
                        now_ms.saturating_sub(since) >= self.cfg.bowden_clear_grace_ms
                    } else {
                        self.pressure_low_since = None;
                        false
                    }
                } else {
                    false
                };
                let trigger = self.trigger_position.unwrap_or(extruder_position);
                if extruder_position - trigger >= self.cfg.coast_distance && drained {
                    // Re-evaluate so a spool added mid-coast is picked up.
                    match self.select_backup(feeders, groups, overrides) {
                        Some((feeder, bay)) => {
                            actions.push(RunoutAction::Reload { feeder, bay });
                            self.set_state(RunoutState::Reloading);
                        }
                        None => {
                            let group = self.watched_group.clone().unwrap_or_default();
                            actions.push(RunoutAction::Pause {
                                reason: AmsError::NoRunoutBackup { group }.to_string(),
                            });
                            self.set_state(RunoutState::Paused);
                        }
                    }
                }
            }
            RunoutState::Reloading => {}
            RunoutState::Paused => {
                // A fresh spool loaded by the operator re-arms monitoring.
                if fps.is_loaded() {
                    self.trigger_position = None;
                    self.chosen = None;
                    self.set_state(RunoutState::Monitoring);
                }
            }
        }
        actions
    }

    /// Lane selection: explicit override for the current lane first, then
    /// same-group rotation in insertion order. The ran-out bay itself is
    /// never a candidate.
    fn select_backup(
        &self,
        feeders: &BTreeMap<String, Feeder>,
        groups: &BTreeMap<String, LaneGroup>,
        overrides: &BTreeMap<String, String>,
    ) -> Option<(String, u8)> {
        let group_name = self.watched_group.as_deref()?;
        let exclude = self.watched.as_ref();
        let pick = |g: &LaneGroup| -> Option<(String, u8)> {
            g.available(feeders)
                .into_iter()
                .find(|&(f, b)| match exclude {
                    Some((wf, wb)) => !(wf == f && *wb == b),
                    None => true,
                })
                .map(|(f, b)| (f.to_string(), b))
        };
        if let Some(over) = overrides.get(group_name)
            && let Some(g) = groups.get(over)
            && let Some(found) = pick(g)
        {
            return Some(found);
        }
        groups.get(group_name).and_then(pick)
    }
}
