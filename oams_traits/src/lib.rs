#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Seam traits between the AMS control core and its collaborators.
//!
//! The control core never talks to an MCU or to the print controller
//! directly. It goes through `FeederPort` (one per feeder mainboard) and
//! `Host` (the print controller facade). Both are object-safe so backends
//! can be swapped for simulations in tests.

pub mod clock;

pub use clock::{Clock, MonotonicClock, TickClock};

/// Number of spool bays per feeder unit. Fixed by the hardware.
pub const BAY_COUNT: usize = 4;

/// Period of the coordinator tick the host is expected to drive, in
/// milliseconds. One tick is the scheduling quantum of the whole control
/// plane.
pub const TICK_MS: u64 = 250;

pub type PortResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Motor follower direction. On the wire, forward is 1 and reverse is 0
/// (the MCU interface is authoritative for the bit meaning).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowerDirection {
    Forward,
    Reverse,
}

impl FollowerDirection {
    pub fn wire_bit(self) -> u8 {
        match self {
            Self::Forward => 1,
            Self::Reverse => 0,
        }
    }

    pub fn from_wire(bit: u8) -> Self {
        if bit == 0 { Self::Reverse } else { Self::Forward }
    }
}

/// Hardware status byte reported in every telemetry frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareStatus {
    Loading,
    Unloading,
    Forward,
    Reverse,
    Stopped,
    Error,
}

impl HardwareStatus {
    /// Decode the status byte from a telemetry frame. Unknown values are
    /// treated as `Error` so a firmware mismatch cannot be mistaken for idle.
    pub fn from_wire(raw: u8) -> Self {
        match raw {
            0 => Self::Loading,
            1 => Self::Unloading,
            2 => Self::Forward,
            3 => Self::Reverse,
            4 => Self::Stopped,
            _ => Self::Error,
        }
    }

    pub fn is_error(self) -> bool {
        matches!(self, Self::Error)
    }
}

/// One periodic telemetry frame from a feeder MCU (>= 10 Hz).
///
/// `encoder` is the raw signed 32-bit accumulator; consumers must use
/// wrapping delta arithmetic, never absolute comparisons.
#[derive(Debug, Clone, Copy)]
pub struct TelemetryFrame {
    /// Normalized pressure reading in [0, 1].
    pub pressure: f32,
    pub encoder: i32,
    pub filament_present: [bool; BAY_COUNT],
    pub hub_present: [bool; BAY_COUNT],
    pub status: HardwareStatus,
}

/// Events delivered by a feeder MCU, drained via `FeederPort::poll_event`.
#[derive(Debug, Clone, Copy)]
pub enum PortEvent {
    Telemetry(TelemetryFrame),
    /// Aperiodic: a load command finished on the MCU side.
    Loaded { bay: u8 },
    /// Aperiodic: an unload command finished on the MCU side.
    Unloaded,
    /// Aperiodic: firmware-reported failure of the current action.
    Error { code: u8 },
}

/// Command/event bridge to one physical feeder mainboard.
///
/// Implementations queue inbound events; `poll_event` must never block.
/// A transport-level `Err` from any method means the link is suspect and
/// the feeder will be demoted to `ERROR` until re-synced.
pub trait FeederPort {
    fn send_load(&mut self, bay: u8) -> PortResult<()>;
    fn send_unload(&mut self) -> PortResult<()>;
    fn send_follower(&mut self, enable: bool, direction: FollowerDirection) -> PortResult<()>;
    fn send_stop(&mut self) -> PortResult<()>;
    /// Ask the firmware which bay it believes is loaded, if any.
    fn query_current_bay(&mut self) -> PortResult<Option<u8>>;
    fn send_calibrate_hub(&mut self, bay: u8) -> PortResult<()>;
    fn send_calibrate_ptfe(&mut self, bay: u8) -> PortResult<()>;
    fn set_led(&mut self, bay: u8, on: bool) -> PortResult<()>;
    /// Drain the next queued event, if any.
    fn poll_event(&mut self) -> PortResult<Option<PortEvent>>;
}

/// Facade over the print controller. The coordinator receives this at
/// init and never reaches for a global.
pub trait Host {
    /// Commanded extruder position in mm; monotone non-decreasing while
    /// a print is running.
    fn extruder_position(&self, extruder: &str) -> f64;
    fn pause_print(&self, reason: &str);
    /// Deliver an operator-visible message.
    fn respond(&self, message: &str);
}
