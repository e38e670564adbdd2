//! Per-extruder load-state tracker.
//!
//! One tracker exists per filament pressure sensor (FPS). It records which
//! feeder/bay currently serves the extruder, the commanded follower mode,
//! and a short ring of encoder samples for motion queries. It is mutated
//! only by the coordinator.

use std::collections::{BTreeMap, VecDeque};

use oams_traits::FollowerDirection;
use tracing::info;

use crate::feeder::Feeder;
use crate::group::LaneGroup;

const ENCODER_RING_CAP: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
}

/// Static wiring of one FPS: its ADC pin, the extruder it buffers, and the
/// feeders that may serve it, in configured order.
#[derive(Debug, Clone)]
pub struct FpsCfg {
    pub pin: String,
    pub extruder: String,
    pub feeders: Vec<String>,
}

/// Which (group, feeder, bay) currently feeds the extruder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub group: Option<String>,
    pub feeder: String,
    pub bay: u8,
}

#[derive(Debug)]
pub struct FpsTracker {
    name: String,
    cfg: FpsCfg,
    load_state: LoadState,
    binding: Option<Binding>,
    following: bool,
    direction: FollowerDirection,
    since_ms: u64,
    ring: VecDeque<(u64, i64)>,
}

impl FpsTracker {
    pub fn new(name: impl Into<String>, cfg: FpsCfg) -> Self {
        Self {
            name: name.into(),
            cfg,
            load_state: LoadState::Unloaded,
            binding: None,
            following: false,
            direction: FollowerDirection::Forward,
            since_ms: 0,
            ring: VecDeque::with_capacity(ENCODER_RING_CAP),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cfg(&self) -> &FpsCfg {
        &self.cfg
    }

    pub fn state(&self) -> LoadState {
        self.load_state
    }

    pub fn is_loaded(&self) -> bool {
        self.load_state == LoadState::Loaded
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }

    pub fn following(&self) -> bool {
        self.following
    }

    pub fn direction(&self) -> FollowerDirection {
        self.direction
    }

    pub fn since_ms(&self) -> u64 {
        self.since_ms
    }

    fn set_state(&mut self, state: LoadState, now_ms: u64) {
        if self.load_state != state {
            info!(fps = %self.name, from = ?self.load_state, to = ?state, "load state changed");
            self.load_state = state;
            self.since_ms = now_ms;
        }
    }

    pub(crate) fn set_loading(&mut self, now_ms: u64) {
        self.binding = None;
        self.set_state(LoadState::Loading, now_ms);
    }

    pub(crate) fn set_unloading(&mut self, now_ms: u64) {
        self.set_state(LoadState::Unloading, now_ms);
    }

    pub(crate) fn bind_loaded(&mut self, binding: Binding, now_ms: u64) {
        self.binding = Some(binding);
        self.set_state(LoadState::Loaded, now_ms);
    }

    pub(crate) fn clear(&mut self, now_ms: u64) {
        self.binding = None;
        self.following = false;
        self.set_state(LoadState::Unloaded, now_ms);
    }

    pub(crate) fn note_follower(&mut self, enable: bool, direction: FollowerDirection) {
        self.following = enable;
        self.direction = direction;
    }

    /// Audit the referenced feeders and settle `Loaded`/`Unloaded`.
    /// Transitional states are owned by the in-flight command and skipped.
    pub(crate) fn reconcile(
        &mut self,
        now_ms: u64,
        feeders: &BTreeMap<String, Feeder>,
        groups: &BTreeMap<String, LaneGroup>,
    ) {
        if matches!(self.load_state, LoadState::Loading | LoadState::Unloading) {
            return;
        }
        let mut found: Option<Binding> = None;
        for name in &self.cfg.feeders {
            if let Some(feeder) = feeders.get(name)
                && let Some(bay) = feeder.current_bay()
                && feeder.is_bay_loaded(bay)
            {
                let group = groups
                    .values()
                    .find(|g| g.contains(name, bay))
                    .map(|g| g.name().to_string());
                found = Some(Binding {
                    group,
                    feeder: name.clone(),
                    bay,
                });
                break;
            }
        }
        match (&self.binding, &found) {
            (None, Some(b)) => {
                info!(fps = %self.name, feeder = %b.feeder, bay = b.bay, "spool present");
            }
            (Some(b), None) => {
                info!(fps = %self.name, feeder = %b.feeder, bay = b.bay, "spool gone");
            }
            _ => {}
        }
        let state = if found.is_some() {
            LoadState::Loaded
        } else {
            LoadState::Unloaded
        };
        self.binding = found;
        self.set_state(state, now_ms);

        if let Some(b) = &self.binding
            && let Some(feeder) = feeders.get(&b.feeder)
        {
            self.push_encoder_sample(now_ms, feeder.encoder_total());
        }
    }

    pub(crate) fn push_encoder_sample(&mut self, now_ms: u64, encoder_total: i64) {
        if self.ring.len() == ENCODER_RING_CAP {
            self.ring.pop_front();
        }
        self.ring.push_back((now_ms, encoder_total));
    }

    /// True iff the encoder ring shows net travel above the noise floor
    /// within the trailing window.
    pub fn recent_motion(&self, now_ms: u64, window_ms: u64, noise_ticks: u64) -> bool {
        let cutoff = now_ms.saturating_sub(window_ms);
        let mut iter = self.ring.iter().skip_while(|(ts, _)| *ts < cutoff);
        let Some(&(_, first)) = iter.next() else {
            return false;
        };
        let Some(&(_, last)) = self.ring.back() else {
            return false;
        };
        last.abs_diff(first) > noise_ticks
    }
}
