//! Clog detection by flow comparison.
//!
//! While the follower feeds forward, extruder travel over a sliding window
//! must be matched by feeder encoder travel scaled by the calibrated
//! ticks-per-mm ratio. A sustained deficit means filament is not actually
//! moving: a clog. The detector latches after one trip and stays quiet
//! until the next load cycle resets it.

use std::collections::VecDeque;

use tracing::warn;

/// Fraction of the ideal encoder travel below which a window counts as
/// clogged.
pub const CLOG_FLOW_RATIO: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClogSensitivity {
    Low,
    #[default]
    Medium,
    High,
}

impl ClogSensitivity {
    /// Extrusion window length the comparison runs over.
    pub fn window_mm(self) -> f64 {
        match self {
            Self::Low => 48.0,
            Self::Medium => 24.0,
            Self::High => 12.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClogTrip {
    pub fps: String,
    pub window_mm: f64,
    pub expected_ticks: f64,
    pub observed_ticks: u64,
}

#[derive(Debug)]
pub struct ClogDetector {
    fps: String,
    window_mm: f64,
    alpha: f64,
    samples: VecDeque<(f64, i64)>,
    tripped: bool,
}

impl ClogDetector {
    pub fn new(fps: impl Into<String>, sensitivity: ClogSensitivity) -> Self {
        Self {
            fps: fps.into(),
            window_mm: sensitivity.window_mm(),
            alpha: CLOG_FLOW_RATIO,
            samples: VecDeque::new(),
            tripped: false,
        }
    }

    pub fn window_mm(&self) -> f64 {
        self.window_mm
    }

    pub fn tripped(&self) -> bool {
        self.tripped
    }

    /// Forget everything; called on every load/unload cycle.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.tripped = false;
    }

    /// Append one sample and evaluate the trailing window.
    ///
    /// `active` must only be true while the FPS is loaded and the follower
    /// feeds forward; otherwise the sample stream is stale and is dropped.
    pub fn tick(
        &mut self,
        active: bool,
        extruder_position: f64,
        encoder_total: i64,
        ticks_per_mm: f64,
    ) -> Option<ClogTrip> {
        if !active {
            self.samples.clear();
            return None;
        }
        if self.tripped {
            return None;
        }
        self.samples.push_back((extruder_position, encoder_total));
        let &(back_pos, back_enc) = self.samples.back()?;
        // Slide: drop leading samples as long as the window still spans W.
        while self.samples.len() >= 2 && back_pos - self.samples[1].0 >= self.window_mm {
            self.samples.pop_front();
        }
        let &(front_pos, front_enc) = self.samples.front()?;
        let span = back_pos - front_pos;
        if span < self.window_mm {
            return None;
        }
        let observed = back_enc.abs_diff(front_enc);
        let expected = self.alpha * ticks_per_mm * span;
        if (observed as f64) < expected {
            self.tripped = true;
            warn!(
                fps = %self.fps,
                span_mm = span,
                observed,
                expected,
                "clog detected"
            );
            return Some(ClogTrip {
                fps: self.fps.clone(),
                window_mm: self.window_mm,
                expected_ticks: expected,
                observed_ticks: observed,
            });
        }
        None
    }
}
