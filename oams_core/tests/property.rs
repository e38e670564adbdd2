//! Property tests for retry backoff and the clog window.

use oams_core::{ClogDetector, ClogSensitivity, backoff_delay_ms};
use proptest::prelude::*;

proptest! {
    #[test]
    fn backoff_is_monotone_and_capped(
        base in 1u64..10_000,
        max in 1u64..60_000,
        attempts in 1u32..50,
    ) {
        let max = max.max(base);
        let mut last = 0u64;
        for attempt in 1..=attempts {
            let delay = backoff_delay_ms(base, max, attempt);
            prop_assert!(delay >= last, "delay shrank at attempt {attempt}");
            prop_assert!(delay <= max, "delay exceeded the cap");
            prop_assert!(delay >= base.min(max));
            last = delay;
        }
    }

    #[test]
    fn proportional_feed_never_trips(
        ticks_per_mm in 1.0f64..200.0,
        step_mm in 0.5f64..4.0,
        steps in 30usize..120,
    ) {
        // Encoder travel at (or above) the calibrated ratio is healthy by
        // definition and must never read as a clog.
        let mut det = ClogDetector::new("fps0", ClogSensitivity::Medium);
        let mut enc = 0i64;
        let mut pos = 0.0f64;
        for _ in 0..steps {
            pos += step_mm;
            enc += (step_mm * ticks_per_mm).ceil() as i64;
            prop_assert!(det.tick(true, pos, enc, ticks_per_mm).is_none());
        }
        prop_assert!(!det.tripped());
    }

    #[test]
    fn frozen_encoder_always_trips_within_two_windows(
        ticks_per_mm in 1.0f64..200.0,
        step_mm in 0.5f64..4.0,
    ) {
        let mut det = ClogDetector::new("fps0", ClogSensitivity::Medium);
        let mut pos = 0.0f64;
        let mut tripped = false;
        let budget = (2.0 * det.window_mm() / step_mm).ceil() as usize + 2;
        for _ in 0..budget {
            pos += step_mm;
            if det.tick(true, pos, 0, ticks_per_mm).is_some() {
                tripped = true;
                break;
            }
        }
        prop_assert!(tripped, "no trip over two full windows");
    }
}
