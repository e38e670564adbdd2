use thiserror::Error;

/// Why a single load/unload attempt (or the whole operation) went wrong.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    #[error("no encoder motion")]
    Stuck,
    #[error("pressure never reached threshold")]
    Pressure,
    #[error("timed out")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
    #[error("mcu error code {0}")]
    Mcu(u8),
    #[error("mcu communication lost")]
    CommLost,
}

/// Typed command-surface and monitor errors.
///
/// Recoverable kinds (`NotReady`, `Busy`, `AlreadyLoaded`, `NotLoaded`) are
/// returned to the caller without any state change. The rest surface after
/// the retry loop is exhausted or a monitor trips.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AmsError {
    #[error("bay {bay} on feeder {feeder} is not ready to load")]
    NotReady { feeder: String, bay: u8 },
    #[error("no ready bay in group {group}")]
    NoSpoolAvailable { group: String },
    #[error("feeder {feeder} is busy with another operation")]
    Busy { feeder: String },
    #[error("{fps} already has a loaded spool")]
    AlreadyLoaded { fps: String },
    #[error("no spool is loaded on {fps}")]
    NotLoaded { fps: String },
    #[error("load of bay {bay} on feeder {feeder} failed after {attempts} attempts: {reason}")]
    LoadFailed {
        feeder: String,
        bay: u8,
        attempts: u32,
        reason: FailReason,
    },
    #[error("unload of feeder {feeder} failed after {attempts} attempts: {reason}")]
    UnloadFailed {
        feeder: String,
        attempts: u32,
        reason: FailReason,
    },
    #[error("clog detected on {fps}: {detail}")]
    ClogDetected { fps: String, detail: String },
    #[error("no runout backup available for group {group}")]
    NoRunoutBackup { group: String },
    #[error("mcu communication error on feeder {feeder}: {detail}")]
    McuComm { feeder: String, detail: String },
    #[error("feeder {feeder} is in error state; run OAMS_CLEAR_ERRORS")]
    FeederFaulted { feeder: String },
    #[error("unknown {kind} '{name}'")]
    UnknownName { kind: &'static str, name: String },
    #[error("invalid command: {0}")]
    Command(String),
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing host")]
    MissingHost,
    #[error("no feeders registered")]
    NoFeeders,
    #[error("unknown feeder '{0}' referenced")]
    UnknownFeeder(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
