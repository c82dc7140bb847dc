//! Per-thread adaptive send pacing.
//!
//! Each sender paces itself against `rate / (senders * packet_streams)`
//! target iterations per second; there is no shared token bucket. Below
//! [`SLOW_RATE`] the thread sleeps between targets, adjusting the sleep by
//! an EMA of the observed rate. At or above it, sleeping is too coarse, so
//! the thread busy-waits a tunable iteration count and re-measures every
//! twentieth of a second's worth of sends.
//!
//! The controllers re-read the shared rate word on every measurement
//! cycle, which is how the +/-5% signal nudges take effect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Per-thread rate below which sleep-based pacing is used (per second).
pub const SLOW_RATE: f64 = 1000.0;

const NSEC_PER_SEC: f64 = 1_000_000_000.0;

/// Spin-mode delay update: scale by the observed/target ratio, nudge when
/// truncation swallowed the adjustment, and never let the delay reach
/// zero (a zero delay would disable rate limiting for the rest of the
/// scan, since every later multiplication would keep it at zero).
pub fn spin_update(delay: u32, multiplier: f64) -> u32 {
    let mut new = (delay as f64 * multiplier) as u32;
    if new == delay {
        if multiplier > 1.0 {
            new = new.saturating_mul(2);
        } else if multiplier < 1.0 {
            new /= 2;
        }
    }
    new.max(1)
}

/// Sleep-mode update: EMA halfway between the current sleep and one
/// scaled by observed/target.
pub fn sleep_update(sleep_ns: f64, last_rate: f64, target_rate: f64) -> f64 {
    sleep_ns * ((last_rate / target_rate) + 1.0) / 2.0
}

#[derive(Clone, Copy)]
enum Mode {
    /// No pacing at all (rate 0 = unlimited).
    Unlimited,
    /// nanosleep between targets.
    Sleep { sleep_ns: f64 },
    /// Busy-wait `delay` iterations per target, re-measured every
    /// `interval` targets.
    Spin { delay: u32, interval: u64 },
}

/// Adaptive pacing state for one sender thread.
pub struct RateController {
    mode: Mode,
    divisor: f64,
    target_rate: f64,
    count: u64,
    last_count: u64,
    last_time: Instant,
}

impl RateController {
    /// Build the controller for one of `senders` threads sending
    /// `packet_streams` probes per target at `global_rate` pps total.
    pub fn new(global_rate: u64, senders: u8, packet_streams: u16) -> Self {
        let divisor = senders as f64 * packet_streams as f64;
        if global_rate == 0 {
            return Self {
                mode: Mode::Unlimited,
                divisor,
                target_rate: 0.0,
                count: 0,
                last_count: 0,
                last_time: Instant::now(),
            };
        }
        let target_rate = global_rate as f64 / divisor;
        if target_rate < SLOW_RATE {
            Self {
                mode: Mode::Sleep {
                    sleep_ns: NSEC_PER_SEC / target_rate,
                },
                divisor,
                target_rate,
                count: 0,
                last_count: 0,
                // Seed the clock one inter-packet gap in the past so the
                // first measurement sees a plausible rate.
                last_time: Instant::now() - Duration::from_secs_f64(1.0 / target_rate),
            }
        } else {
            // Calibrate the busy-wait cost so the first delay guess is in
            // the right ballpark.
            let probe_iters: u32 = 10_000;
            let start = Instant::now();
            busy_wait(probe_iters);
            let elapsed = start.elapsed().as_secs_f64().max(1e-9);
            let delay = ((probe_iters as f64 / elapsed / target_rate) as u32).max(1);
            let interval = ((target_rate / 20.0) as u64).max(1);
            Self {
                mode: Mode::Spin { delay, interval },
                divisor,
                target_rate,
                count: 0,
                last_count: 0,
                last_time: Instant::now(),
            }
        }
    }

    /// Current per-thread target, re-derived from the shared rate word.
    fn refresh_target(&mut self, rate: &AtomicU64) {
        let global = rate.load(Ordering::Relaxed);
        if global > 0 {
            self.target_rate = global as f64 / self.divisor;
        }
    }

    /// Pace before processing one target. Call exactly once per target
    /// iteration; `rate` is the live global pps knob.
    pub fn pace(&mut self, rate: &AtomicU64) {
        self.count += 1;
        if self.count == 1 {
            // First target goes out unthrottled.
            return;
        }
        match self.mode {
            Mode::Unlimited => {}
            Mode::Sleep { sleep_ns } => {
                let t = Instant::now();
                let gap = (t - self.last_time).as_secs_f64().max(1e-9);
                let last_rate = 1.0 / gap;
                self.refresh_target(rate);
                let next = sleep_update(sleep_ns, last_rate, self.target_rate);
                self.mode = Mode::Sleep { sleep_ns: next };
                self.last_time = t;
                std::thread::sleep(Duration::from_nanos(next as u64));
            }
            Mode::Spin { delay, interval } => {
                busy_wait(delay);
                if self.count % interval == 0 {
                    let t = Instant::now();
                    let elapsed = (t - self.last_time).as_secs_f64().max(1e-9);
                    self.refresh_target(rate);
                    let observed = (self.count - self.last_count) as f64 / elapsed;
                    let multiplier = observed / self.target_rate;
                    self.mode = Mode::Spin {
                        delay: spin_update(delay, multiplier),
                        interval,
                    };
                    self.last_count = self.count;
                    self.last_time = t;
                }
            }
        }
    }

    /// Targets processed so far.
    pub fn count(&self) -> u64 {
        self.count
    }
}

#[inline]
fn busy_wait(iterations: u32) {
    for _ in 0..iterations {
        std::hint::spin_loop();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // ── spin-mode update rules ─────────────────────────────────────────────

    #[test]
    fn test_spin_update_scales_by_multiplier() {
        assert_eq!(spin_update(100, 2.0), 200);
        assert_eq!(spin_update(100, 0.25), 25);
        assert_eq!(spin_update(3, 0.9), 2);
    }

    #[test]
    fn test_spin_update_nudges_when_truncation_eats_change() {
        // 100 * 1.004 truncates back to 100 -> double instead.
        assert_eq!(spin_update(100, 1.004), 200);
        // 100 * 0.999 truncates to 99, a real change -> no nudge.
        assert_eq!(spin_update(100, 0.999), 99);
        // 10 * 0.99 truncates back to 9 -> changed, no nudge.
        assert_eq!(spin_update(10, 0.99), 9);
        // Exactly on target: leave alone.
        assert_eq!(spin_update(100, 1.0), 100);
    }

    #[test]
    fn test_spin_update_halves_on_small_overrun() {
        // 2 * 0.9 truncates to 1... that's a change, fine. But 1 * 0.9
        // truncates back to 0 -> clamp keeps pacing alive.
        assert_eq!(spin_update(1, 0.9), 1);
    }

    #[test]
    fn test_spin_update_never_zero() {
        assert_eq!(spin_update(1, 0.01), 1);
        assert_eq!(spin_update(5, 0.0), 1);
    }

    // ── sleep-mode EMA ─────────────────────────────────────────────────────

    #[test]
    fn test_sleep_update_on_target_is_stable() {
        let s = sleep_update(1_000_000.0, 100.0, 100.0);
        assert!((s - 1_000_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_sleep_update_moves_halfway() {
        // Running 2x too fast: sleep grows by 1.5x, not 2x.
        let s = sleep_update(1_000_000.0, 200.0, 100.0);
        assert!((s - 1_500_000.0).abs() < 1e-6);
        // Running at half speed: sleep shrinks to 0.75x.
        let s = sleep_update(1_000_000.0, 50.0, 100.0);
        assert!((s - 750_000.0).abs() < 1e-6);
    }

    // ── controller construction ────────────────────────────────────────────

    #[test]
    fn test_mode_selection_by_per_thread_rate() {
        // 10k pps over 4 senders x 4 streams = 625/thread -> sleep mode.
        let c = RateController::new(10_000, 4, 4);
        assert!(matches!(c.mode, Mode::Sleep { .. }));
        // 1M pps over 4 senders = 250k/thread -> spin mode.
        let c = RateController::new(1_000_000, 4, 1);
        assert!(matches!(c.mode, Mode::Spin { .. }));
        let c = RateController::new(0, 1, 1);
        assert!(matches!(c.mode, Mode::Unlimited));
    }

    #[test]
    fn test_spin_interval_is_twentieth_of_rate() {
        let c = RateController::new(100_000, 1, 1);
        match c.mode {
            Mode::Spin { interval, .. } => assert_eq!(interval, 5000),
            _ => panic!("expected spin mode"),
        }
    }

    #[test]
    fn test_unlimited_pace_is_free() {
        let mut c = RateController::new(0, 1, 1);
        let rate = AtomicU64::new(0);
        let start = Instant::now();
        for _ in 0..10_000 {
            c.pace(&rate);
        }
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(c.count(), 10_000);
    }

    #[test]
    fn test_rate_refresh_picks_up_signal_nudges() {
        let mut c = RateController::new(2_000_000, 1, 1);
        let rate = AtomicU64::new(2_000_000);
        rate.store(3_000_000, Ordering::Relaxed);
        c.refresh_target(&rate);
        assert!((c.target_rate - 3_000_000.0).abs() < 1e-3);
    }

    /// Wall-clock fidelity check; timing-sensitive, so opt-in only.
    #[test]
    #[ignore]
    fn test_sleep_mode_rate_fidelity() {
        let target = 200u64; // per-thread, sleep mode
        let mut c = RateController::new(target, 1, 1);
        let rate = AtomicU64::new(target);
        let start = Instant::now();
        let seconds = 3.0;
        let mut sent = 0u64;
        while start.elapsed().as_secs_f64() < seconds {
            c.pace(&rate);
            sent += 1;
        }
        let observed = sent as f64 / seconds;
        let err = (observed - target as f64).abs() / target as f64;
        assert!(
            err < 0.05,
            "observed {observed:.1}/s vs target {target}/s (err {:.1}%)",
            err * 100.0
        );
    }
}
