//! Clock primitives for timestamping and playout scheduling.
//!
//! Two clocks live here:
//!
//! - [`StreamClock`]: the sender-side monotonic reference. Capture sources
//!   stamp frames with `now()`, so video and audio PTS share one time base.
//! - [`MasterClock`]: the receiver-side playout reference. It binds a stream
//!   PTS (`base_pts`) to a local instant and advances at an adjustable
//!   `speed`, letting the drift corrector gently stretch or squeeze playback
//!   without ever producing a discontinuity.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::types::Timestamp;

/// Allowed master-clock speed range.
pub const MIN_CLOCK_SPEED: f64 = 0.9;
pub const MAX_CLOCK_SPEED: f64 = 1.1;

/// Monotonic time source for PTS stamping on the sender.
///
/// Cheap to clone; all clones share the same base instant.
#[derive(Debug, Clone)]
pub struct StreamClock {
    base: Arc<Instant>,
}

impl StreamClock {
    pub fn new() -> Self {
        Self { base: Arc::new(Instant::now()) }
    }

    /// Microseconds elapsed since the clock was created.
    pub fn now(&self) -> Timestamp {
        Timestamp::from_micros(self.base.elapsed().as_micros() as i64)
    }

    pub fn base(&self) -> Instant {
        *self.base
    }

    /// Timestamp of an arbitrary instant on this clock's time base.
    pub fn at(&self, instant: Instant) -> Timestamp {
        Timestamp::from_instant(instant, *self.base)
    }
}

impl Default for StreamClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Which stream drives the receiver's master clock.
///
/// Audio is the default: audio artifacts are more perceptible than video
/// ones, and the audio sink advances at a constant sample-rate-driven pace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClockSource {
    #[default]
    Audio,
    Video,
    External,
}

#[derive(Debug)]
struct MasterClockState {
    base_pts: i64,
    base_local: Instant,
    speed: f64,
    source: ClockSource,
}

impl MasterClockState {
    fn current(&self, now: Instant) -> i64 {
        let elapsed = now.saturating_duration_since(self.base_local).as_micros() as i64;
        self.base_pts + (elapsed as f64 * self.speed) as i64
    }

    /// Fold elapsed time into the base so a speed or source change starts
    /// from the current reading instead of jumping.
    fn rebase(&mut self, now: Instant) {
        self.base_pts = self.current(now);
        self.base_local = now;
    }
}

/// Wall-clock anchor for presentation scheduling.
///
/// `current() = base_pts + (now − base_local) × speed`, with `speed`
/// clamped to [0.9, 1.1]. Writes serialize under one mutex; reads take the
/// same mutex (the pair (base_pts, base_local, speed) must be read
/// consistently, and the scheduler reads at frame rate, not sample rate).
#[derive(Debug, Clone)]
pub struct MasterClock {
    state: Arc<Mutex<MasterClockState>>,
}

impl MasterClock {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MasterClockState {
                base_pts: 0,
                base_local: Instant::now(),
                speed: 1.0,
                source: ClockSource::default(),
            })),
        }
    }

    /// Current clock reading in stream time.
    pub fn current(&self) -> Timestamp {
        let state = self.state.lock().unwrap();
        Timestamp::from_micros(state.current(Instant::now()))
    }

    /// Anchor the clock at `pts` now. Used on stream start and hard resyncs.
    pub fn set(&self, pts: Timestamp) {
        let mut state = self.state.lock().unwrap();
        state.base_pts = pts.as_micros();
        state.base_local = Instant::now();
    }

    /// Feed a stream timestamp into the clock. Only the configured source
    /// stream moves the anchor.
    pub fn observe(&self, source: ClockSource, pts: Timestamp) {
        let mut state = self.state.lock().unwrap();
        if state.source == source {
            state.base_pts = pts.as_micros();
            state.base_local = Instant::now();
        }
    }

    /// Adjust playback speed, clamped to [0.9, 1.1]. The clock is rebased
    /// first so the reading is continuous across the change.
    pub fn adjust_speed(&self, speed: f64) {
        let mut state = self.state.lock().unwrap();
        state.rebase(Instant::now());
        state.speed = speed.clamp(MIN_CLOCK_SPEED, MAX_CLOCK_SPEED);
    }

    pub fn speed(&self) -> f64 {
        self.state.lock().unwrap().speed
    }

    pub fn source(&self) -> ClockSource {
        self.state.lock().unwrap().source
    }

    /// Switch the driving stream. Rebases so `current()` has no step.
    pub fn set_source(&self, source: ClockSource) {
        let mut state = self.state.lock().unwrap();
        state.rebase(Instant::now());
        state.source = source;
    }

    /// Reset to zero at speed 1.0, keeping the configured source.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.base_pts = 0;
        state.base_local = Instant::now();
        state.speed = 1.0;
    }
}

impl Default for MasterClock {
    fn default() -> Self {
        Self::new()
    }
}
