//! Simulated feeder mainboard.
//!
//! The simulator is shared-handle: cloning yields another view of the same
//! board, so a test (or the CLI rig) can keep a handle while the
//! coordinator owns the port. All mutation goes through a mutex; poisoning
//! is survivable because the state is plain data.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use oams_traits::{
    BAY_COUNT, FeederPort, FollowerDirection, HardwareStatus, PortEvent, PortResult,
    TelemetryFrame,
};

use crate::error::PortError;

/// Commands the simulator has received, in send order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimCommand {
    Load(u8),
    Unload,
    Follower { enable: bool, direction: FollowerDirection },
    Stop,
    Query,
    CalibrateHub(u8),
    CalibratePtfe(u8),
    Led { bay: u8, on: bool },
}

#[derive(Debug)]
struct SimInner {
    filament: [bool; BAY_COUNT],
    hub: [bool; BAY_COUNT],
    pressure: f32,
    encoder: i32,
    status: HardwareStatus,
    current_bay: Option<u8>,
    queue: VecDeque<PortEvent>,
    sent: Vec<SimCommand>,
    offline: bool,
}

impl Default for SimInner {
    fn default() -> Self {
        Self {
            filament: [false; BAY_COUNT],
            hub: [false; BAY_COUNT],
            pressure: 0.0,
            encoder: 0,
            status: HardwareStatus::Stopped,
            current_bay: None,
            queue: VecDeque::new(),
            sent: Vec::new(),
            offline: false,
        }
    }
}

/// Shared-handle simulated feeder MCU.
#[derive(Debug, Clone, Default)]
pub struct SimulatedFeeder {
    inner: Arc<Mutex<SimInner>>,
}

impl SimulatedFeeder {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimInner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Put a spool in (or remove it from) a bay's filament sensor.
    pub fn set_filament(&self, bay: usize, present: bool) {
        self.lock().filament[bay] = present;
    }

    /// Force the hub hall-effect reading for a bay.
    pub fn set_hub(&self, bay: usize, present: bool) {
        self.lock().hub[bay] = present;
    }

    pub fn set_pressure(&self, value: f32) {
        self.lock().pressure = value;
    }

    pub fn set_status(&self, status: HardwareStatus) {
        self.lock().status = status;
    }

    /// Advance the encoder accumulator; wraps like the firmware counter.
    pub fn add_encoder(&self, ticks: i32) {
        let mut g = self.lock();
        g.encoder = g.encoder.wrapping_add(ticks);
    }

    pub fn set_encoder_raw(&self, raw: i32) {
        self.lock().encoder = raw;
    }

    /// Simulate a dropped link: every port call fails until restored.
    pub fn set_offline(&self, offline: bool) {
        tracing::debug!(offline, "simulated feeder link state changed");
        self.lock().offline = offline;
    }

    /// Queue one telemetry frame snapshotting the current sensor state.
    pub fn push_telemetry(&self) {
        let mut g = self.lock();
        let frame = TelemetryFrame {
            pressure: g.pressure,
            encoder: g.encoder,
            filament_present: g.filament,
            hub_present: g.hub,
            status: g.status,
        };
        g.queue.push_back(PortEvent::Telemetry(frame));
    }

    /// Firmware finished a load: hub engages, motor idles, `loaded` fires.
    pub fn complete_load(&self, bay: u8) {
        let mut g = self.lock();
        g.hub[bay as usize] = true;
        g.current_bay = Some(bay);
        g.status = HardwareStatus::Stopped;
        g.queue.push_back(PortEvent::Loaded { bay });
    }

    /// Firmware finished an unload: hub releases, `unloaded` fires.
    pub fn complete_unload(&self) {
        let mut g = self.lock();
        if let Some(bay) = g.current_bay.take() {
            g.hub[bay as usize] = false;
        }
        g.status = HardwareStatus::Stopped;
        g.queue.push_back(PortEvent::Unloaded);
    }

    pub fn push_error(&self, code: u8) {
        self.lock().queue.push_back(PortEvent::Error { code });
    }

    /// Commands received so far, oldest first.
    pub fn commands(&self) -> Vec<SimCommand> {
        self.lock().sent.clone()
    }

    pub fn clear_commands(&self) {
        self.lock().sent.clear();
    }

    pub fn current_bay(&self) -> Option<u8> {
        self.lock().current_bay
    }

    pub fn set_current_bay(&self, bay: Option<u8>) {
        self.lock().current_bay = bay;
    }

    fn send(&self, cmd: SimCommand) -> PortResult<()> {
        let mut g = self.lock();
        if g.offline {
            return Err(Box::new(PortError::Disconnected));
        }
        // The firmware acknowledges motion commands by switching status.
        match cmd {
            SimCommand::Load(_) => g.status = HardwareStatus::Loading,
            SimCommand::Unload => g.status = HardwareStatus::Unloading,
            SimCommand::Stop => g.status = HardwareStatus::Stopped,
            SimCommand::Follower { enable, direction } => {
                g.status = if !enable {
                    HardwareStatus::Stopped
                } else {
                    match direction {
                        FollowerDirection::Forward => HardwareStatus::Forward,
                        FollowerDirection::Reverse => HardwareStatus::Reverse,
                    }
                };
            }
            _ => {}
        }
        g.sent.push(cmd);
        Ok(())
    }
}

impl FeederPort for SimulatedFeeder {
    fn send_load(&mut self, bay: u8) -> PortResult<()> {
        self.send(SimCommand::Load(bay))
    }

    fn send_unload(&mut self) -> PortResult<()> {
        self.send(SimCommand::Unload)
    }

    fn send_follower(&mut self, enable: bool, direction: FollowerDirection) -> PortResult<()> {
        self.send(SimCommand::Follower { enable, direction })
    }

    fn send_stop(&mut self) -> PortResult<()> {
        self.send(SimCommand::Stop)
    }

    fn query_current_bay(&mut self) -> PortResult<Option<u8>> {
        let mut g = self.lock();
        if g.offline {
            return Err(Box::new(PortError::Disconnected));
        }
        g.sent.push(SimCommand::Query);
        Ok(g.current_bay)
    }

    fn send_calibrate_hub(&mut self, bay: u8) -> PortResult<()> {
        self.send(SimCommand::CalibrateHub(bay))
    }

    fn send_calibrate_ptfe(&mut self, bay: u8) -> PortResult<()> {
        self.send(SimCommand::CalibratePtfe(bay))
    }

    fn set_led(&mut self, bay: u8, on: bool) -> PortResult<()> {
        self.send(SimCommand::Led { bay, on })
    }

    fn poll_event(&mut self) -> PortResult<Option<PortEvent>> {
        let mut g = self.lock();
        if g.offline {
            return Err(Box::new(PortError::Disconnected));
        }
        Ok(g.queue.pop_front())
    }
}
