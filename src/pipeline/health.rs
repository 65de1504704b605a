//! Pipeline health counters and stall detection.
//!
//! Counters are plain atomics so stages can record events from any task
//! without touching the synchronizer's locks. One instance is shared per
//! pipeline; the supervisor samples it for its periodic stats line and for
//! stall alerts.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Shared health counters for one pipeline.
pub struct PipelineHealth {
    started: Instant,
    frames_processed: AtomicU64,
    bytes_processed: AtomicU64,
    keyframes: AtomicU64,
    frames_dropped: AtomicU64,
    frames_repeated: AtomicU64,
    encode_failures: AtomicU64,
    decode_failures: AtomicU64,
    packets_lost: AtomicU64,
    transport_errors: AtomicU64,
    /// Microseconds since `started` when the last frame moved.
    last_frame_us: AtomicU64,
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            frames_processed: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            keyframes: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            frames_repeated: AtomicU64::new(0),
            encode_failures: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            packets_lost: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
            last_frame_us: AtomicU64::new(0),
        }
    }

    fn now_us(&self) -> u64 {
        self.started.elapsed().as_micros() as u64
    }

    pub fn record_frame(&self, size: usize, keyframe: bool) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed.fetch_add(size as u64, Ordering::Relaxed);
        if keyframe {
            self.keyframes.fetch_add(1, Ordering::Relaxed);
        }
        self.last_frame_us.store(self.now_us(), Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drops(&self, n: u64) {
        self.frames_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_repeat(&self) {
        self.frames_repeated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_encode_failure(&self) {
        self.encode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_packet_loss(&self, n: u64) {
        self.packets_lost.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn frames_repeated(&self) -> u64 {
        self.frames_repeated.load(Ordering::Relaxed)
    }

    pub fn encode_failures(&self) -> u64 {
        self.encode_failures.load(Ordering::Relaxed)
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    pub fn packets_lost(&self) -> u64 {
        self.packets_lost.load(Ordering::Relaxed)
    }

    pub fn transport_errors(&self) -> u64 {
        self.transport_errors.load(Ordering::Relaxed)
    }

    pub fn drop_rate(&self) -> f64 {
        let processed = self.frames_processed();
        if processed == 0 {
            return 0.0;
        }
        self.frames_dropped() as f64 / processed as f64 * 100.0
    }

    /// True when no frame has moved for `threshold`.
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let last = self.last_frame_us.load(Ordering::Relaxed);
        self.now_us().saturating_sub(last) > threshold.as_micros() as u64
    }

    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            frames_processed: self.frames_processed(),
            bytes_processed: self.bytes_processed.load(Ordering::Relaxed),
            keyframes: self.keyframes.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped(),
            frames_repeated: self.frames_repeated(),
            encode_failures: self.encode_failures(),
            decode_failures: self.decode_failures(),
            packets_lost: self.packets_lost(),
            transport_errors: self.transport_errors(),
            drop_rate: self.drop_rate(),
        }
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default)]
pub struct HealthSummary {
    pub frames_processed: u64,
    pub bytes_processed: u64,
    pub keyframes: u64,
    pub frames_dropped: u64,
    pub frames_repeated: u64,
    pub encode_failures: u64,
    pub decode_failures: u64,
    pub packets_lost: u64,
    pub transport_errors: u64,
    pub drop_rate: f64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} frames ({} dropped {:.1}%, {} repeated), {} keyframes, {} encode failures, {} decode failures, {} packets lost, {} transport errors, {} bytes",
            self.frames_processed,
            self.frames_dropped,
            self.drop_rate,
            self.frames_repeated,
            self.keyframes,
            self.encode_failures,
            self.decode_failures,
            self.packets_lost,
            self.transport_errors,
            self.bytes_processed,
        )
    }
}

/// Conditions worth telling the supervisor about.
#[derive(Debug, Clone)]
pub enum HealthAlert {
    Stalled { threshold: Duration },
    HighDropRate { rate: f64 },
    DecodeFailures { new: u64 },
    TransportErrors { new: u64 },
}

/// Periodic watchdog over a [`PipelineHealth`] instance.
pub struct HealthMonitor {
    health: Arc<PipelineHealth>,
    alerts: mpsc::Sender<HealthAlert>,
    check_interval: Duration,
    stall_threshold: Duration,
    drop_rate_threshold: f64,
}

impl HealthMonitor {
    pub fn new(health: Arc<PipelineHealth>, alerts: mpsc::Sender<HealthAlert>) -> Self {
        Self {
            health,
            alerts,
            check_interval: Duration::from_secs(5),
            stall_threshold: Duration::from_secs(5),
            drop_rate_threshold: 10.0,
        }
    }

    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Check loop; runs until the alert receiver goes away.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.check_interval);
        let mut seen_decode_failures = 0u64;
        let mut seen_transport_errors = 0u64;

        loop {
            ticker.tick().await;

            if self.health.is_stalled(self.stall_threshold)
                && self
                    .alerts
                    .send(HealthAlert::Stalled { threshold: self.stall_threshold })
                    .await
                    .is_err()
            {
                return;
            }

            let rate = self.health.drop_rate();
            if rate > self.drop_rate_threshold {
                let _ = self.alerts.send(HealthAlert::HighDropRate { rate }).await;
            }

            let decode_failures = self.health.decode_failures();
            if decode_failures > seen_decode_failures {
                let _ = self
                    .alerts
                    .send(HealthAlert::DecodeFailures { new: decode_failures - seen_decode_failures })
                    .await;
                seen_decode_failures = decode_failures;
            }

            let transport_errors = self.health.transport_errors();
            if transport_errors > seen_transport_errors {
                let _ = self
                    .alerts
                    .send(HealthAlert::TransportErrors { new: transport_errors - seen_transport_errors })
                    .await;
                seen_transport_errors = transport_errors;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let health = PipelineHealth::new();
        health.record_frame(1_000, true);
        health.record_frame(2_000, false);
        health.record_drop();
        health.record_repeat();
        health.record_encode_failure();
        health.record_packet_loss(3);

        let summary = health.summary();
        assert_eq!(summary.frames_processed, 2);
        assert_eq!(summary.bytes_processed, 3_000);
        assert_eq!(summary.keyframes, 1);
        assert_eq!(summary.frames_dropped, 1);
        assert_eq!(summary.frames_repeated, 1);
        assert_eq!(summary.encode_failures, 1);
        assert_eq!(summary.decode_failures, 0);
        assert_eq!(summary.packets_lost, 3);
        assert!(summary.drop_rate > 0.0);
    }

    #[test]
    fn test_stall_detection() {
        let health = PipelineHealth::new();
        health.record_frame(100, false);
        assert!(!health.is_stalled(Duration::from_secs(1)));
        std::thread::sleep(Duration::from_millis(30));
        assert!(health.is_stalled(Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_monitor_reports_stall() {
        let health = Arc::new(PipelineHealth::new());
        let (tx, mut rx) = mpsc::channel(8);
        let monitor = HealthMonitor::new(health.clone(), tx)
            .with_check_interval(Duration::from_millis(10))
            .with_stall_threshold(Duration::from_millis(5));

        tokio::spawn(async move { monitor.run().await });

        let alert = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("alert expected")
            .unwrap();
        assert!(matches!(alert, HealthAlert::Stalled { .. }));
    }
}
