//! Monitor thread: periodic stats, completion detection, cooldown.
//!
//! Wakes at a fixed cadence, publishes aggregate progress, and drives the
//! end of the scan: once every sender has finished, the cooldown window
//! opens (late responses are flagged), and when it has run its course the
//! receiver-complete flag is raised and everyone unwinds. The monitor is
//! also where orderly shutdown requests (SIGINT/SIGTERM) and the
//! max-runtime cap are turned into the sender stop flag.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{RuntimeState, ScanConfig};

/// Everything the monitor thread needs.
pub struct MonitorContext {
    pub config: Arc<ScanConfig>,
    pub runtime: Arc<RuntimeState>,
    /// Targets this machine shard is expected to cover, for ETA.
    pub expected_targets: u64,
    /// Wake cadence; one second in production, shorter in tests.
    pub cadence: Duration,
}

/// Run the monitor until the scan is complete.
pub fn run_monitor(ctx: &MonitorContext) {
    let runtime = &ctx.runtime;
    let senders = ctx.config.senders as u32;

    loop {
        std::thread::sleep(ctx.cadence);

        if runtime.shutdown_requested.load(Ordering::Relaxed)
            && !runtime.senders_stop.load(Ordering::Relaxed)
        {
            tracing::info!("shutdown requested, stopping senders");
            runtime.senders_stop.store(true, Ordering::SeqCst);
        }
        if let Some(max) = ctx.config.max_runtime {
            if runtime.start.elapsed() >= max && !runtime.senders_stop.load(Ordering::Relaxed) {
                tracing::info!(
                    max_runtime_secs = max.as_secs(),
                    "max runtime reached, stopping senders"
                );
                runtime.senders_stop.store(true, Ordering::SeqCst);
            }
        }

        log_progress(ctx);

        if runtime.senders_done.load(Ordering::SeqCst) >= senders {
            let last_finish = runtime
                .last_send_finished
                .lock()
                .expect("send-finish clock poisoned")
                .unwrap_or_else(Instant::now);
            if !runtime.in_cooldown.swap(true, Ordering::SeqCst) {
                tracing::info!(
                    cooldown_secs = ctx.config.cooldown.as_secs(),
                    "all senders finished, cooldown window open"
                );
            }
            if last_finish.elapsed() >= ctx.config.cooldown {
                runtime.recv_complete.store(true, Ordering::SeqCst);
                log_summary(ctx);
                return;
            }
        }

        // Someone else (a fatal error path) may have completed the scan.
        if runtime.recv_complete.load(Ordering::Relaxed) {
            return;
        }
    }
}

fn log_progress(ctx: &MonitorContext) {
    let runtime = &ctx.runtime;
    let elapsed = runtime.start.elapsed().as_secs_f64();
    let scanned = runtime.targets_scanned.load(Ordering::Relaxed);
    let sent = runtime.packets_sent.load(Ordering::Relaxed);
    let failed = runtime.packets_failed.load(Ordering::Relaxed);
    let recv = runtime.responses_received.load(Ordering::Relaxed);
    let hit_rate = if sent > 0 {
        recv as f64 / sent as f64 * 100.0
    } else {
        0.0
    };
    let avg_rate = if elapsed > 0.0 {
        scanned as f64 / elapsed
    } else {
        0.0
    };
    let remaining = ctx.expected_targets.saturating_sub(scanned);
    let eta_secs = if avg_rate > 0.0 && remaining > 0 {
        (remaining as f64 / avg_rate) as u64
    } else {
        0
    };
    tracing::info!(
        elapsed_secs = elapsed as u64,
        targets = scanned,
        sent,
        failed,
        recv,
        hit_rate_pct = format!("{hit_rate:.2}"),
        send_rate_avg = avg_rate as u64,
        eta_secs,
        "scan progress"
    );
}

fn log_summary(ctx: &MonitorContext) {
    let runtime = &ctx.runtime;
    tracing::info!(
        scan_id = %ctx.config.scan_id,
        duration_secs = runtime.start.elapsed().as_secs(),
        targets = runtime.targets_scanned.load(Ordering::Relaxed),
        sent = runtime.packets_sent.load(Ordering::Relaxed),
        failed = runtime.packets_failed.load(Ordering::Relaxed),
        recv = runtime.responses_received.load(Ordering::Relaxed),
        "scan complete"
    );
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn context(config: ScanConfig, runtime: Arc<RuntimeState>) -> MonitorContext {
        MonitorContext {
            config: Arc::new(config),
            runtime,
            expected_targets: 100,
            cadence: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_completion_after_cooldown() {
        let runtime = Arc::new(RuntimeState::new(1000));
        let config = ScanConfig {
            senders: 2,
            cooldown: Duration::from_millis(40),
            ..ScanConfig::default()
        };
        runtime.sender_finished();
        runtime.sender_finished();
        let ctx = context(config, Arc::clone(&runtime));
        let start = Instant::now();
        run_monitor(&ctx);
        assert!(runtime.in_cooldown.load(Ordering::SeqCst));
        assert!(runtime.recv_complete.load(Ordering::SeqCst));
        assert!(
            start.elapsed() >= Duration::from_millis(30),
            "cooldown must actually elapse before completion"
        );
    }

    #[test]
    fn test_no_completion_while_senders_running() {
        let runtime = Arc::new(RuntimeState::new(1000));
        let config = ScanConfig {
            senders: 2,
            cooldown: Duration::from_millis(1),
            ..ScanConfig::default()
        };
        runtime.sender_finished(); // only one of two
        let ctx = context(config, Arc::clone(&runtime));
        let rt = Arc::clone(&runtime);
        let handle = std::thread::spawn(move || run_monitor(&ctx));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!rt.recv_complete.load(Ordering::SeqCst));
        assert!(!rt.in_cooldown.load(Ordering::SeqCst));
        // Let the monitor finish so the test thread can join.
        rt.sender_finished();
        handle.join().unwrap();
    }

    #[test]
    fn test_shutdown_request_stops_senders() {
        let runtime = Arc::new(RuntimeState::new(1000));
        let config = ScanConfig {
            senders: 1,
            cooldown: Duration::from_millis(1),
            ..ScanConfig::default()
        };
        runtime.shutdown_requested.store(true, Ordering::SeqCst);
        runtime.sender_finished();
        let ctx = context(config, Arc::clone(&runtime));
        run_monitor(&ctx);
        assert!(runtime.senders_stop.load(Ordering::SeqCst));
        assert!(runtime.recv_complete.load(Ordering::SeqCst));
    }

    #[test]
    fn test_max_runtime_stops_senders() {
        let runtime = Arc::new(RuntimeState::new(1000));
        let config = ScanConfig {
            senders: 1,
            max_runtime: Some(Duration::from_millis(0)),
            cooldown: Duration::from_millis(1),
            ..ScanConfig::default()
        };
        runtime.sender_finished();
        let ctx = context(config, Arc::clone(&runtime));
        run_monitor(&ctx);
        assert!(runtime.senders_stop.load(Ordering::SeqCst));
    }

    #[test]
    fn test_monitor_exits_when_completed_externally() {
        let runtime = Arc::new(RuntimeState::new(1000));
        let config = ScanConfig {
            senders: 8, // will never all finish
            ..ScanConfig::default()
        };
        runtime.recv_complete.store(true, Ordering::SeqCst);
        let ctx = context(config, Arc::clone(&runtime));
        run_monitor(&ctx); // must return promptly instead of hanging
    }
}
