//! Interarrival jitter, adaptive buffer sizing, and clock-drift estimation.
//!
//! The jitter estimator follows RFC 3550 §6.4.1: for each new sample the
//! deviation between the expected and observed interarrival delta feeds an
//! exponential moving average with gain 1/16. The drift estimator runs a
//! linear regression over a ring of (local time, stream time) pairs; a
//! slope of exactly 1.0 means the stream clock matches the local clock, and
//! the deviation is reported in parts per million.

use std::collections::VecDeque;

use super::types::Timestamp;

/// Lower bound for the playout buffer in milliseconds.
pub const MIN_BUFFER_MS: u32 = 20;
/// Upper bound for the playout buffer in milliseconds.
pub const MAX_BUFFER_MS: u32 = 200;
/// Starting point for the playout buffer in milliseconds.
pub const TARGET_BUFFER_MS: u32 = 50;

/// RFC 3550 interarrival jitter estimator.
#[derive(Debug, Default)]
pub struct JitterEstimator {
    last: Option<(i64, i64)>,
    jitter_us: f64,
    samples: u64,
}

impl JitterEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame with stream timestamp `pts` that arrived at local
    /// time `arrival`.
    pub fn add_sample(&mut self, pts: Timestamp, arrival: Timestamp) {
        let (pts, arrival) = (pts.as_micros(), arrival.as_micros());
        if let Some((last_pts, last_arrival)) = self.last {
            let deviation = ((arrival - last_arrival) - (pts - last_pts)).abs() as f64;
            self.jitter_us += (deviation - self.jitter_us) / 16.0;
        }
        self.last = Some((pts, arrival));
        self.samples += 1;
    }

    /// Current jitter estimate in microseconds.
    pub fn jitter_us(&self) -> i64 {
        self.jitter_us as i64
    }

    /// Playout delay that absorbs the estimated jitter: 2 × J, floored at
    /// 20 ms and capped at 200 ms.
    pub fn optimal_delay_us(&self) -> i64 {
        (self.jitter_us as i64 * 2)
            .clamp(MIN_BUFFER_MS as i64 * 1_000, MAX_BUFFER_MS as i64 * 1_000)
    }

    pub fn sample_count(&self) -> u64 {
        self.samples
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Adaptive playout buffer sizing driven by jitter and packet loss.
#[derive(Debug)]
pub struct AdaptiveBuffer {
    size_ms: u32,
}

impl AdaptiveBuffer {
    pub fn new() -> Self {
        Self { size_ms: TARGET_BUFFER_MS }
    }

    /// Re-evaluate the buffer size for one tick: grow on bad conditions,
    /// shrink cautiously on good ones.
    pub fn update(&mut self, jitter_us: i64, packets_lost: u64) {
        if jitter_us > 20_000 || packets_lost > 0 {
            self.size_ms = (self.size_ms + 10).min(MAX_BUFFER_MS);
        } else if jitter_us < 5_000 {
            self.size_ms = self.size_ms.saturating_sub(5).max(MIN_BUFFER_MS);
        }
    }

    pub fn size_ms(&self) -> u32 {
        self.size_ms
    }

    pub fn size_us(&self) -> i64 {
        self.size_ms as i64 * 1_000
    }

    pub fn reset(&mut self) {
        self.size_ms = TARGET_BUFFER_MS;
    }
}

impl Default for AdaptiveBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimum samples before the drift regression reports anything.
const MIN_DRIFT_SAMPLES: usize = 10;

/// Ring of (local, stream) timestamp pairs with a least-squares drift fit.
#[derive(Debug)]
pub struct DriftEstimator {
    samples: VecDeque<(i64, i64)>,
    capacity: usize,
}

impl DriftEstimator {
    pub fn new(capacity: usize) -> Self {
        Self { samples: VecDeque::with_capacity(capacity), capacity }
    }

    /// Record that stream time `stream` was observed at local time `local`.
    pub fn add_sample(&mut self, local: Timestamp, stream: Timestamp) {
        self.samples.push_back((local.as_micros(), stream.as_micros()));
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    /// Drift of the stream clock against the local clock in ppm, positive
    /// when the stream runs fast. `None` until enough samples accumulate.
    pub fn drift_ppm(&self) -> Option<f64> {
        if self.samples.len() < MIN_DRIFT_SAMPLES {
            return None;
        }

        let n = self.samples.len() as f64;
        // Center on the first sample to keep the products well conditioned.
        let (x0, y0) = self.samples[0];
        let (mut sum_x, mut sum_y, mut sum_xy, mut sum_xx) = (0.0, 0.0, 0.0, 0.0);
        for &(x, y) in &self.samples {
            let x = (x - x0) as f64;
            let y = (y - y0) as f64;
            sum_x += x;
            sum_y += y;
            sum_xy += x * y;
            sum_xx += x * x;
        }

        let denom = n * sum_xx - sum_x * sum_x;
        if denom.abs() < f64::EPSILON {
            return None;
        }
        let slope = (n * sum_xy - sum_x * sum_y) / denom;
        Some((slope - 1.0) * 1_000_000.0)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(us: i64) -> Timestamp {
        Timestamp::from_micros(us)
    }

    #[test]
    fn test_jitter_zero_for_periodic_stream() {
        let mut est = JitterEstimator::new();
        // Perfectly periodic 20 ms cadence: arrival delta equals pts delta.
        for i in 0..32 {
            est.add_sample(ts(i * 20_000), ts(1_000 + i * 20_000));
        }
        assert_eq!(est.jitter_us(), 0);
    }

    #[test]
    fn test_jitter_converges_back_to_zero() {
        let mut est = JitterEstimator::new();
        est.add_sample(ts(0), ts(0));
        // One disturbed arrival, then periodic again.
        est.add_sample(ts(20_000), ts(36_000));
        assert!(est.jitter_us() > 0);
        let mut arrival = 36_000;
        for i in 2..34 {
            arrival += 20_000;
            est.add_sample(ts(i * 20_000), ts(arrival));
        }
        // Property: the EMA decays to (near) zero within 32 periodic samples.
        assert!(est.jitter_us() <= 150, "jitter {}us", est.jitter_us());
    }

    #[test]
    fn test_jitter_tracks_variable_arrivals() {
        let mut est = JitterEstimator::new();
        let mut arrival = 0i64;
        for i in 0..50 {
            // Alternate ±8 ms of arrival error around the 20 ms cadence.
            let error = if i % 2 == 0 { 8_000 } else { -8_000 };
            arrival += 20_000 + error;
            est.add_sample(ts(i * 20_000), ts(arrival));
        }
        assert!(est.jitter_us() > 5_000);
    }

    #[test]
    fn test_optimal_delay_floor_and_cap() {
        let est = JitterEstimator::new();
        assert_eq!(est.optimal_delay_us(), 20_000);

        let mut est = JitterEstimator::new();
        let mut arrival = 0i64;
        for i in 0..200 {
            let error = if i % 2 == 0 { 150_000 } else { -150_000 };
            arrival += 20_000 + error.max(-19_000);
            est.add_sample(ts(i * 20_000), ts(arrival));
        }
        assert_eq!(est.optimal_delay_us(), 200_000);
    }

    #[test]
    fn test_adaptive_buffer_grows_and_shrinks() {
        let mut buf = AdaptiveBuffer::new();
        assert_eq!(buf.size_ms(), 50);

        // High jitter grows toward the cap.
        for _ in 0..20 {
            buf.update(30_000, 0);
        }
        assert_eq!(buf.size_ms(), 200);

        // Clean network shrinks to the floor.
        for _ in 0..40 {
            buf.update(1_000, 0);
        }
        assert_eq!(buf.size_ms(), 20);
    }

    #[test]
    fn test_adaptive_buffer_grows_on_loss() {
        let mut buf = AdaptiveBuffer::new();
        buf.update(1_000, 3);
        assert_eq!(buf.size_ms(), 60);
    }

    #[test]
    fn test_drift_needs_ten_samples() {
        let mut est = DriftEstimator::new(100);
        for i in 0..9 {
            est.add_sample(ts(i * 1_000), ts(i * 1_000));
        }
        assert!(est.drift_ppm().is_none());
        est.add_sample(ts(9_000), ts(9_000));
        assert!(est.drift_ppm().is_some());
    }

    #[test]
    fn test_drift_zero_for_locked_clocks() {
        let mut est = DriftEstimator::new(100);
        for i in 0..50 {
            est.add_sample(ts(i * 20_000), ts(i * 20_000));
        }
        assert!(est.drift_ppm().unwrap().abs() < 1.0);
    }

    #[test]
    fn test_drift_detects_fast_stream() {
        let mut est = DriftEstimator::new(100);
        // Stream advances 1.001x faster than local: +1000 ppm.
        for i in 0..100 {
            let local = i * 20_000;
            let stream = (local as f64 * 1.001) as i64;
            est.add_sample(ts(local), ts(stream));
        }
        let ppm = est.drift_ppm().unwrap();
        assert!((ppm - 1_000.0).abs() < 50.0, "ppm {ppm}");
    }

    #[test]
    fn test_drift_detects_slow_stream() {
        let mut est = DriftEstimator::new(100);
        for i in 0..100 {
            let local = i * 20_000;
            let stream = (local as f64 * 0.9995) as i64;
            est.add_sample(ts(local), ts(stream));
        }
        let ppm = est.drift_ppm().unwrap();
        assert!((ppm + 500.0).abs() < 50.0, "ppm {ppm}");
    }

    #[test]
    fn test_drift_ring_bounded() {
        let mut est = DriftEstimator::new(100);
        for i in 0..250 {
            est.add_sample(ts(i), ts(i));
        }
        assert_eq!(est.len(), 100);
    }
}
