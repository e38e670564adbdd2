//! Load/unload operation state machine with encoder-motion watchdog and
//! exponential retry.
//!
//! One driver exists per in-flight operation. The coordinator calls
//! [`OpDriver::step`] once per tick and routes aperiodic MCU signals in via
//! [`OpDriver::on_signal`]. The driver owns retry policy; the feeder owns
//! the transport.

use std::collections::VecDeque;

use oams_traits::HardwareStatus;
use tracing::{debug, info, warn};

use crate::error::{AmsError, FailReason};
use crate::feeder::{Feeder, FeederSignal};

/// Compute the delay before retry `attempt` (1-based): `min(base × attempt, max)`.
pub fn backoff_delay_ms(base_ms: u64, max_ms: u64, attempt: u32) -> u64 {
    base_ms
        .saturating_mul(u64::from(attempt.max(1)))
        .min(max_ms)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Load { bay: u8 },
    Unload { bay: u8 },
}

impl OpKind {
    pub fn bay(self) -> u8 {
        match self {
            Self::Load { bay } | Self::Unload { bay } => bay,
        }
    }

    fn verb(self) -> &'static str {
        match self {
            Self::Load { .. } => "load",
            Self::Unload { .. } => "unload",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpProgress {
    Pending,
    Complete,
    Failed { reason: FailReason, attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Command issued; watching for completion or a stall.
    Attempting,
    /// Stop sent after a failed attempt; waiting for the motor to idle.
    CleanupStopping,
    /// Backing a partially threaded load out of the hub before retrying.
    CleanupUnloading,
    /// Inter-retry delay.
    Backoff { resume_at_ms: u64 },
    Done,
}

pub struct OpDriver {
    kind: OpKind,
    phase: Phase,
    attempt: u32,
    max_attempts: u32,
    deadline_ms: u64,
    attempt_since_ms: u64,
    /// (timestamp, encoder_total) samples over the watchdog window.
    window: VecDeque<(u64, i64)>,
    hw_done_at_ms: Option<u64>,
    pending_fault: Option<u8>,
    last_fail: FailReason,
    outcome: Option<OpProgress>,
}

impl std::fmt::Debug for OpDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpDriver")
            .field("kind", &self.kind)
            .field("phase", &self.phase)
            .field("attempt", &self.attempt)
            .finish()
    }
}

impl OpDriver {
    /// Begin a load. Legal only when no bay is loaded and the target bay
    /// has a spool seated but not yet threaded past the hub.
    pub fn start_load(feeder: &mut Feeder, bay: u8, now_ms: u64) -> Result<Self, AmsError> {
        if feeder.current_bay().is_some() || !feeder.is_bay_ready(bay) {
            return Err(AmsError::NotReady {
                feeder: feeder.name().to_string(),
                bay,
            });
        }
        feeder.command_load(bay)?;
        info!(feeder = %feeder.name(), bay, "load started");
        Ok(Self::new(
            OpKind::Load { bay },
            feeder.cfg().load_retry_max,
            now_ms,
            now_ms + feeder.cfg().load_timeout_ms,
        ))
    }

    /// Begin an unload of the currently loaded bay.
    pub fn start_unload(feeder: &mut Feeder, now_ms: u64) -> Result<Self, AmsError> {
        let Some(bay) = feeder.current_bay() else {
            return Err(AmsError::Command("no bay is loaded".into()));
        };
        feeder.command_unload()?;
        info!(feeder = %feeder.name(), bay, "unload started");
        Ok(Self::new(
            OpKind::Unload { bay },
            feeder.cfg().unload_retry_max,
            now_ms,
            now_ms + feeder.cfg().unload_timeout_ms,
        ))
    }

    fn new(kind: OpKind, retry_max: u32, now_ms: u64, deadline_ms: u64) -> Self {
        Self {
            kind,
            phase: Phase::Attempting,
            attempt: 1,
            max_attempts: retry_max.max(1),
            deadline_ms,
            attempt_since_ms: now_ms,
            window: VecDeque::new(),
            hw_done_at_ms: None,
            pending_fault: None,
            last_fail: FailReason::Stuck,
            outcome: None,
        }
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn progress(&self) -> OpProgress {
        self.outcome.clone().unwrap_or(OpProgress::Pending)
    }

    /// Route an aperiodic MCU signal. Only the active attempt cares;
    /// signals arriving during cleanup or backoff are stale.
    pub fn on_signal(&mut self, signal: &FeederSignal, now_ms: u64) {
        match *signal {
            FeederSignal::Loaded { bay } => {
                if self.phase == Phase::Attempting
                    && matches!(self.kind, OpKind::Load { bay: b } if b == bay)
                {
                    self.hw_done_at_ms = Some(now_ms);
                } else {
                    warn!(bay, op = ?self.kind, "ignoring stray loaded event");
                }
            }
            FeederSignal::Unloaded => {
                if self.phase == Phase::Attempting && matches!(self.kind, OpKind::Unload { .. }) {
                    self.hw_done_at_ms = Some(now_ms);
                }
            }
            FeederSignal::Fault { code } => {
                if self.phase == Phase::Attempting {
                    self.pending_fault = Some(code);
                }
            }
        }
    }

    /// Operator abort: force a stop and resolve as `CANCELLED`.
    pub fn cancel(&mut self, feeder: &mut Feeder) {
        if self.phase == Phase::Done {
            return;
        }
        let _ = feeder.command_stop();
        self.finish_failed(FailReason::Cancelled);
    }

    /// The feeder's transport died; nothing more can be commanded.
    pub fn fail_comm(&mut self) {
        if self.phase != Phase::Done {
            self.finish_failed(FailReason::CommLost);
        }
    }

    /// Advance the state machine one tick.
    pub fn step(&mut self, feeder: &mut Feeder, now_ms: u64) -> OpProgress {
        if self.phase == Phase::Done {
            return self.progress();
        }
        if now_ms >= self.deadline_ms {
            warn!(feeder = %feeder.name(), op = ?self.kind, "operation deadline expired");
            let _ = feeder.command_stop();
            self.finish_failed(FailReason::Timeout);
            return self.progress();
        }
        match self.phase {
            Phase::Attempting => self.step_attempting(feeder, now_ms),
            Phase::CleanupStopping => self.step_cleanup_stopping(feeder, now_ms),
            Phase::CleanupUnloading => self.step_cleanup_unloading(feeder, now_ms),
            Phase::Backoff { resume_at_ms } => {
                if now_ms >= resume_at_ms {
                    self.next_attempt(feeder, now_ms);
                }
            }
            Phase::Done => {}
        }
        self.progress()
    }

    fn step_attempting(&mut self, feeder: &mut Feeder, now_ms: u64) {
        if let Some(code) = self.pending_fault.take() {
            self.fail_attempt(feeder, FailReason::Mcu(code), now_ms);
            return;
        }

        // Completion checks come before the watchdog: once the MCU reports
        // the mechanical phase done, the motor is idle by design and the
        // encoder is expected to be still.
        if let Some(done_at) = self.hw_done_at_ms {
            let cfg = feeder.cfg().clone();
            match self.kind {
                OpKind::Load { bay } => {
                    if feeder.hub_present(bay) && feeder.pressure() > cfg.fps_upper_threshold {
                        feeder.set_current_bay(Some(bay));
                        info!(feeder = %feeder.name(), bay, attempts = self.attempt, "load complete");
                        self.finish_ok();
                        return;
                    }
                    if now_ms.saturating_sub(done_at) > cfg.pressure_grace_ms {
                        self.fail_attempt(feeder, FailReason::Pressure, now_ms);
                    }
                }
                OpKind::Unload { bay } => {
                    if !feeder.hub_present(bay) {
                        feeder.set_current_bay(None);
                        info!(feeder = %feeder.name(), bay, attempts = self.attempt, "unload complete");
                        self.finish_ok();
                        return;
                    }
                    if now_ms.saturating_sub(done_at) > cfg.pressure_grace_ms {
                        self.fail_attempt(feeder, FailReason::Stuck, now_ms);
                    }
                }
            }
            return;
        }

        // Encoder-motion watchdog over the trailing window.
        let threshold_ms = feeder.cfg().stuck_threshold_ms;
        let min_ticks = u64::from(feeder.cfg().min_progress_ticks);
        self.window.push_back((now_ms, feeder.encoder_total()));
        while self
            .window
            .front()
            .is_some_and(|(ts, _)| now_ms.saturating_sub(*ts) > threshold_ms)
        {
            self.window.pop_front();
        }
        if now_ms.saturating_sub(self.attempt_since_ms) >= threshold_ms
            && let (Some(&(t0, e0)), Some(&(_, e1))) = (self.window.front(), self.window.back())
            && now_ms.saturating_sub(t0) >= threshold_ms
            && e1.abs_diff(e0) < min_ticks
        {
            self.fail_attempt(feeder, FailReason::Stuck, now_ms);
        }
    }

    fn step_cleanup_stopping(&mut self, feeder: &mut Feeder, now_ms: u64) {
        if feeder.status() != HardwareStatus::Stopped {
            return;
        }
        let auto_unload = feeder.cfg().auto_unload_on_failed_load
            && matches!(self.kind, OpKind::Load { bay } if feeder.hub_present(bay));
        if auto_unload {
            debug!(feeder = %feeder.name(), "backing partial load out of the hub");
            if feeder.command_unload().is_err() {
                self.finish_failed(FailReason::CommLost);
                return;
            }
            self.phase = Phase::CleanupUnloading;
        } else {
            self.begin_backoff(feeder, now_ms);
        }
    }

    fn step_cleanup_unloading(&mut self, feeder: &mut Feeder, now_ms: u64) {
        if !feeder.hub_present(self.kind.bay()) && feeder.status() == HardwareStatus::Stopped {
            self.begin_backoff(feeder, now_ms);
        }
    }

    fn fail_attempt(&mut self, feeder: &mut Feeder, reason: FailReason, _now_ms: u64) {
        warn!(
            feeder = %feeder.name(),
            op = self.kind.verb(),
            attempt = self.attempt,
            %reason,
            "attempt failed"
        );
        self.last_fail = reason;
        self.hw_done_at_ms = None;
        if feeder.command_stop().is_err() {
            self.finish_failed(FailReason::CommLost);
            return;
        }
        self.phase = Phase::CleanupStopping;
    }

    fn begin_backoff(&mut self, feeder: &Feeder, now_ms: u64) {
        let cfg = feeder.cfg();
        let delay = backoff_delay_ms(
            cfg.retry_backoff_base_ms,
            cfg.retry_backoff_max_ms,
            self.attempt,
        );
        debug!(feeder = %feeder.name(), attempt = self.attempt, delay_ms = delay, "retry backoff");
        self.phase = Phase::Backoff {
            resume_at_ms: now_ms + delay,
        };
    }

    fn next_attempt(&mut self, feeder: &mut Feeder, now_ms: u64) {
        if self.attempt >= self.max_attempts {
            self.finish_failed(self.last_fail);
            return;
        }
        self.attempt += 1;
        let sent = match self.kind {
            OpKind::Load { bay } => feeder.command_load(bay),
            OpKind::Unload { .. } => feeder.command_unload(),
        };
        if sent.is_err() {
            self.finish_failed(FailReason::CommLost);
            return;
        }
        info!(feeder = %feeder.name(), op = self.kind.verb(), attempt = self.attempt, "retrying");
        self.attempt_since_ms = now_ms;
        self.window.clear();
        self.hw_done_at_ms = None;
    }

    fn finish_ok(&mut self) {
        self.outcome = Some(OpProgress::Complete);
        self.phase = Phase::Done;
    }

    fn finish_failed(&mut self, reason: FailReason) {
        self.outcome = Some(OpProgress::Failed {
            reason,
            attempts: self.attempt,
        });
        self.phase = Phase::Done;
    }
}
