//! Feeder driver: command/event bridge to one physical feeder MCU.
//!
//! The driver owns the latest sensor snapshot (bay presence, hub presence,
//! pressure, encoder), the loaded-bay bookkeeping, and the transport
//! fault latch. It never retries anything itself; retry policy lives in
//! the operation state machine ([`crate::op`]).

use oams_traits::{
    BAY_COUNT, FeederPort, FollowerDirection, HardwareStatus, PortEvent, TelemetryFrame,
};
use tracing::{debug, error, warn};

use crate::error::AmsError;

/// Per-feeder tunables. Thresholds mirror the firmware configuration so
/// the control plane and the MCU agree on what "engaged" means.
#[derive(Debug, Clone)]
pub struct FeederCfg {
    /// Follower releases above this pressure; load succeeds once crossed.
    pub fps_upper_threshold: f32,
    /// Bowden is considered drained below this pressure.
    pub fps_lower_threshold: f32,
    /// Filament-sensor HES trigger levels per bay.
    pub f1s_hes_on: [f32; BAY_COUNT],
    /// Hub HES trigger levels per bay.
    pub hub_hes_on: [f32; BAY_COUNT],
    /// Calibrated encoder ratio, ticks per mm of filament.
    pub ticks_per_mm: f64,
    pub load_retry_max: u32,
    pub unload_retry_max: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    /// Minimum encoder travel over the watchdog window to count as motion.
    pub min_progress_ticks: u32,
    /// Watchdog window length.
    pub stuck_threshold_ms: u64,
    pub auto_unload_on_failed_load: bool,
    pub load_timeout_ms: u64,
    pub unload_timeout_ms: u64,
    /// How long after the MCU reports `loaded` the pressure may take to
    /// cross the upper threshold before the attempt counts as failed.
    pub pressure_grace_ms: u64,
}

impl Default for FeederCfg {
    fn default() -> Self {
        Self {
            fps_upper_threshold: 0.65,
            fps_lower_threshold: 0.35,
            f1s_hes_on: [0.5; BAY_COUNT],
            hub_hes_on: [0.5; BAY_COUNT],
            ticks_per_mm: 40.0,
            load_retry_max: 3,
            unload_retry_max: 2,
            retry_backoff_base_ms: 1_000,
            retry_backoff_max_ms: 5_000,
            min_progress_ticks: 4,
            stuck_threshold_ms: 1_000,
            auto_unload_on_failed_load: true,
            load_timeout_ms: 60_000,
            unload_timeout_ms: 60_000,
            pressure_grace_ms: 2_000,
        }
    }
}

/// Cheap immutable copy of a feeder's observable state.
#[derive(Debug, Clone)]
pub struct FeederState {
    pub name: String,
    pub filament_present: [bool; BAY_COUNT],
    pub hub_present: [bool; BAY_COUNT],
    pub pressure: f32,
    pub encoder_total: i64,
    pub status: HardwareStatus,
    pub current_bay: Option<u8>,
}

/// Aperiodic MCU events surfaced to the operation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeederSignal {
    Loaded { bay: u8 },
    Unloaded,
    /// Firmware aborted the current action with an error code.
    Fault { code: u8 },
}

pub struct Feeder {
    name: String,
    cfg: FeederCfg,
    port: Box<dyn FeederPort>,
    filament_present: [bool; BAY_COUNT],
    hub_present: [bool; BAY_COUNT],
    pressure: f32,
    last_encoder: Option<i32>,
    encoder_total: i64,
    status: HardwareStatus,
    current_bay: Option<u8>,
    comm_error: Option<String>,
}

impl std::fmt::Debug for Feeder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feeder")
            .field("name", &self.name)
            .field("status", &self.status)
            .field("current_bay", &self.current_bay)
            .field("pressure", &self.pressure)
            .finish()
    }
}

impl Feeder {
    pub fn new(name: impl Into<String>, cfg: FeederCfg, port: Box<dyn FeederPort>) -> Self {
        Self {
            name: name.into(),
            cfg,
            port,
            filament_present: [false; BAY_COUNT],
            hub_present: [false; BAY_COUNT],
            pressure: 0.0,
            last_encoder: None,
            encoder_total: 0,
            status: HardwareStatus::Stopped,
            current_bay: None,
            comm_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cfg(&self) -> &FeederCfg {
        &self.cfg
    }

    pub fn snapshot(&self) -> FeederState {
        FeederState {
            name: self.name.clone(),
            filament_present: self.filament_present,
            hub_present: self.hub_present,
            pressure: self.pressure,
            encoder_total: self.encoder_total,
            status: self.status,
            current_bay: self.current_bay,
        }
    }

    /// A bay can be loaded when its spool is seated and its filament has
    /// not already been threaded past the hub.
    pub fn is_bay_ready(&self, bay: u8) -> bool {
        let b = usize::from(bay);
        b < BAY_COUNT && self.filament_present[b] && !self.hub_present[b]
    }

    pub fn is_bay_loaded(&self, bay: u8) -> bool {
        let b = usize::from(bay);
        b < BAY_COUNT && self.hub_present[b] && self.current_bay == Some(bay)
    }

    pub fn hub_present(&self, bay: u8) -> bool {
        usize::from(bay) < BAY_COUNT && self.hub_present[usize::from(bay)]
    }

    pub fn pressure(&self) -> f32 {
        self.pressure
    }

    pub fn encoder_total(&self) -> i64 {
        self.encoder_total
    }

    pub fn status(&self) -> HardwareStatus {
        self.status
    }

    pub fn current_bay(&self) -> Option<u8> {
        self.current_bay
    }

    pub(crate) fn set_current_bay(&mut self, bay: Option<u8>) {
        self.current_bay = bay;
    }

    pub fn is_faulted(&self) -> bool {
        self.status.is_error()
    }

    /// Drain the port's event queue: telemetry frames are folded into the
    /// local snapshot, aperiodic events are returned for the operation
    /// state machine. A transport error latches the fault state.
    pub fn intake(&mut self) -> Vec<FeederSignal> {
        let mut signals = Vec::new();
        loop {
            match self.port.poll_event() {
                Ok(Some(PortEvent::Telemetry(frame))) => self.apply_telemetry(&frame),
                Ok(Some(PortEvent::Loaded { bay })) => signals.push(FeederSignal::Loaded { bay }),
                Ok(Some(PortEvent::Unloaded)) => signals.push(FeederSignal::Unloaded),
                Ok(Some(PortEvent::Error { code })) => {
                    warn!(feeder = %self.name, code, "mcu reported action error");
                    signals.push(FeederSignal::Fault { code });
                }
                Ok(None) => break,
                Err(e) => {
                    self.fault_comm(&format!("poll: {e}"));
                    break;
                }
            }
        }
        signals
    }

    fn apply_telemetry(&mut self, frame: &TelemetryFrame) {
        self.filament_present = frame.filament_present;
        self.hub_present = frame.hub_present;
        self.pressure = frame.pressure;
        // Signed delta arithmetic keeps the running total correct across
        // i32 wraparound of the firmware accumulator.
        if let Some(prev) = self.last_encoder {
            self.encoder_total += i64::from(frame.encoder.wrapping_sub(prev));
        }
        self.last_encoder = Some(frame.encoder);
        if self.comm_error.is_none() {
            self.status = frame.status;
        }
    }

    fn fault_comm(&mut self, detail: &str) {
        if self.comm_error.is_none() {
            error!(feeder = %self.name, detail, "feeder link faulted");
        }
        self.comm_error = Some(detail.to_string());
        self.status = HardwareStatus::Error;
    }

    fn comm_err(&mut self, what: &str, e: &(dyn std::error::Error + 'static)) -> AmsError {
        let detail = format!("{what}: {e}");
        self.fault_comm(&detail);
        AmsError::McuComm {
            feeder: self.name.clone(),
            detail,
        }
    }

    fn guard_faulted(&self) -> Result<(), AmsError> {
        if self.is_faulted() {
            return Err(AmsError::FeederFaulted {
                feeder: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Send the load command. Legality (readiness, idle bay) is checked by
    /// the caller; this only guards the fault latch and the transport.
    pub(crate) fn command_load(&mut self, bay: u8) -> Result<(), AmsError> {
        self.guard_faulted()?;
        debug!(feeder = %self.name, bay, "sending load");
        match self.port.send_load(bay) {
            Ok(()) => {
                self.status = HardwareStatus::Loading;
                Ok(())
            }
            Err(e) => Err(self.comm_err("load", &*e)),
        }
    }

    pub(crate) fn command_unload(&mut self) -> Result<(), AmsError> {
        self.guard_faulted()?;
        debug!(feeder = %self.name, "sending unload");
        match self.port.send_unload() {
            Ok(()) => {
                self.status = HardwareStatus::Unloading;
                Ok(())
            }
            Err(e) => Err(self.comm_err("unload", &*e)),
        }
    }

    /// `stop` is allowed even on a faulted feeder: it is the safe command.
    pub(crate) fn command_stop(&mut self) -> Result<(), AmsError> {
        match self.port.send_stop() {
            Ok(()) => Ok(()),
            Err(e) => Err(self.comm_err("stop", &*e)),
        }
    }

    pub(crate) fn set_follower(
        &mut self,
        enable: bool,
        direction: FollowerDirection,
    ) -> Result<(), AmsError> {
        self.guard_faulted()?;
        match self.port.send_follower(enable, direction) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.comm_err("follower", &*e)),
        }
    }

    pub(crate) fn calibrate_hub(&mut self, bay: u8) -> Result<(), AmsError> {
        self.guard_faulted()?;
        match self.port.send_calibrate_hub(bay) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.comm_err("calibrate_hub", &*e)),
        }
    }

    pub(crate) fn calibrate_ptfe(&mut self, bay: u8) -> Result<(), AmsError> {
        self.guard_faulted()?;
        match self.port.send_calibrate_ptfe(bay) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.comm_err("calibrate_ptfe", &*e)),
        }
    }

    /// Best-effort LED write; an LED glitch must not fault the feeder.
    pub(crate) fn set_led(&mut self, bay: u8, on: bool) {
        if let Err(e) = self.port.set_led(bay, on) {
            warn!(feeder = %self.name, bay, error = %e, "led write failed");
        }
    }

    /// Re-query the firmware for the loaded bay and lift the fault latch.
    /// This is the only path out of the `ERROR` status.
    pub fn resync(&mut self) -> Result<(), AmsError> {
        match self.port.query_current_bay() {
            Ok(bay) => {
                self.current_bay = bay;
                self.comm_error = None;
                if self.status.is_error() {
                    self.status = HardwareStatus::Stopped;
                }
                debug!(feeder = %self.name, ?bay, "resynced");
                Ok(())
            }
            Err(e) => Err(self.comm_err("query", &*e)),
        }
    }
}
