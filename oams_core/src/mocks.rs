//! Test and helper mocks for oams_core.

use std::sync::Mutex;

use oams_traits::{FollowerDirection, Host, PortEvent, PortResult};

/// A port that accepts every command and never delivers events; useful
/// for exercising pure bookkeeping without a simulated MCU.
#[derive(Debug, Default)]
pub struct NullPort;

impl oams_traits::FeederPort for NullPort {
    fn send_load(&mut self, _bay: u8) -> PortResult<()> {
        Ok(())
    }
    fn send_unload(&mut self) -> PortResult<()> {
        Ok(())
    }
    fn send_follower(&mut self, _enable: bool, _direction: FollowerDirection) -> PortResult<()> {
        Ok(())
    }
    fn send_stop(&mut self) -> PortResult<()> {
        Ok(())
    }
    fn query_current_bay(&mut self) -> PortResult<Option<u8>> {
        Ok(None)
    }
    fn send_calibrate_hub(&mut self, _bay: u8) -> PortResult<()> {
        Ok(())
    }
    fn send_calibrate_ptfe(&mut self, _bay: u8) -> PortResult<()> {
        Ok(())
    }
    fn set_led(&mut self, _bay: u8, _on: bool) -> PortResult<()> {
        Ok(())
    }
    fn poll_event(&mut self) -> PortResult<Option<PortEvent>> {
        Ok(None)
    }
}

/// Recording host: scripted extruder position, captured pauses and
/// responses. Share it with the coordinator through an `Arc`.
#[derive(Debug, Default)]
pub struct MockHost {
    position: Mutex<f64>,
    pauses: Mutex<Vec<String>>,
    responses: Mutex<Vec<String>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_position(&self, mm: f64) {
        if let Ok(mut p) = self.position.lock() {
            *p = mm;
        }
    }

    pub fn advance_extruder(&self, mm: f64) {
        if let Ok(mut p) = self.position.lock() {
            *p += mm;
        }
    }

    pub fn pauses(&self) -> Vec<String> {
        self.pauses.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn paused(&self) -> bool {
        !self.pauses().is_empty()
    }

    pub fn responses(&self) -> Vec<String> {
        self.responses.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl Host for MockHost {
    fn extruder_position(&self, _extruder: &str) -> f64 {
        self.position.lock().map(|g| *g).unwrap_or(0.0)
    }

    fn pause_print(&self, reason: &str) {
        if let Ok(mut p) = self.pauses.lock() {
            p.push(reason.to_string());
        }
    }

    fn respond(&self, message: &str) {
        if let Ok(mut r) = self.responses.lock() {
            r.push(message.to_string());
        }
    }
}
