//! Presentation scheduler: decides, per decoded frame, whether to display,
//! delay, repeat, or drop.
//!
//! Classification is a pure function of (diff, keyframe) against the master
//! clock, so exactly one action applies to any input:
//!
//! - more than 40 ms early: wait (capped at 200 ms);
//! - within ±40 ms: display now;
//! - 40–100 ms late, non-keyframe: repeat the previous frame (or display
//!   late when repeat is disabled);
//! - over 100 ms late, non-keyframe: drop;
//! - keyframes are never dropped, however late.
//!
//! The stage also runs the drift corrector: while the cross-stream drift
//! stays beyond the sync threshold the master-clock speed is nudged ±2 %,
//! and it returns to 1.0 once drift re-enters the window.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::decoder::DecodedVideoFrame;
use crate::pipeline::clock::MasterClock;
use crate::pipeline::handoff::BoundedHandoff;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::jitter::{AdaptiveBuffer, DriftEstimator, JitterEstimator};
use crate::pipeline::stage::PipelineStage;
use crate::pipeline::types::Timestamp;

/// Scheduler thresholds in microseconds.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Window treated as "on time" and the drift-correction threshold.
    pub sync_threshold_us: i64,
    /// Lateness beyond which non-keyframes are dropped.
    pub late_drop_threshold_us: i64,
    /// Earliness beyond which the delay is clamped.
    pub early_cap_us: i64,
    /// Repeat the previous frame for moderately late frames.
    pub allow_repeat: bool,
    /// How often the drift corrector runs.
    pub drift_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_threshold_us: 40_000,
            late_drop_threshold_us: 100_000,
            early_cap_us: 200_000,
            allow_repeat: true,
            drift_interval: Duration::from_millis(500),
        }
    }
}

/// Exactly one action per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleAction {
    DisplayNow,
    /// Sleep this long, then display.
    Delay { micros: i64 },
    RepeatPrevious,
    Drop,
}

/// Classify one frame against the clock. Pure; the partition property is
/// tested directly.
pub fn classify(diff_us: i64, keyframe: bool, config: &SchedulerConfig) -> ScheduleAction {
    if diff_us > config.sync_threshold_us {
        return ScheduleAction::Delay { micros: diff_us.min(config.early_cap_us) };
    }
    if diff_us >= -config.sync_threshold_us {
        return ScheduleAction::DisplayNow;
    }
    // Late from here on. Keyframes always display: dropping one would
    // orphan every frame that references it.
    if keyframe {
        return ScheduleAction::DisplayNow;
    }
    if diff_us >= -config.late_drop_threshold_us {
        if config.allow_repeat {
            ScheduleAction::RepeatPrevious
        } else {
            ScheduleAction::DisplayNow
        }
    } else {
        ScheduleAction::Drop
    }
}

/// Where displayed frames go; the platform renderer implements this.
pub trait VideoSink: Send {
    fn render(&mut self, frame: &DecodedVideoFrame) -> crate::error::Result<()>;
}

/// Presentation scheduling pipeline stage.
pub struct PresentStage {
    input: BoundedHandoff<DecodedVideoFrame>,
    sink: Box<dyn VideoSink>,
    clock: MasterClock,
    config: SchedulerConfig,
    jitter: JitterEstimator,
    drift: DriftEstimator,
    adaptive: AdaptiveBuffer,
    health: Arc<PipelineHealth>,
    arrival_base: Instant,
    last_frame: Option<DecodedVideoFrame>,
    last_drift_check: Instant,
    last_video_pts: Option<Timestamp>,
}

impl PresentStage {
    pub fn new(
        input: BoundedHandoff<DecodedVideoFrame>,
        sink: Box<dyn VideoSink>,
        clock: MasterClock,
        config: SchedulerConfig,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self {
            input,
            sink,
            clock,
            config,
            jitter: JitterEstimator::new(),
            drift: DriftEstimator::new(100),
            adaptive: AdaptiveBuffer::new(),
            health,
            arrival_base: Instant::now(),
            last_frame: None,
            last_drift_check: Instant::now(),
            last_video_pts: None,
        }
    }

    /// Drift correction per the master-clock contract: ±2 % while drift
    /// exceeds the sync threshold, back to 1.0 inside the window.
    fn correct_drift(&mut self) {
        let Some(video_pts) = self.last_video_pts else { return };
        let drift = video_pts.delta(self.clock.current());

        if drift.abs() > self.config.sync_threshold_us {
            let speed = if drift > 0 {
                // Video ahead of the clock: speed the clock up to catch it.
                1.02
            } else {
                0.98
            };
            self.clock.adjust_speed(speed);
            debug!(
                "present: drift {drift}us ({} ppm), clock speed {speed}",
                self.drift.drift_ppm().unwrap_or(0.0) as i64
            );
        } else {
            self.clock.adjust_speed(1.0);
        }
    }

    async fn handle_frame(
        &mut self,
        frame: DecodedVideoFrame,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let arrival = Timestamp::from_instant(Instant::now(), self.arrival_base);
        self.jitter.add_sample(frame.pts, arrival);
        self.drift.add_sample(arrival, frame.pts);
        self.adaptive.update(self.jitter.jitter_us(), self.health.packets_lost());
        self.last_video_pts = Some(frame.pts);

        let diff = frame.pts.delta(self.clock.current());
        match classify(diff, frame.keyframe, &self.config) {
            ScheduleAction::DisplayNow => {
                self.sink.render(&frame)?;
                self.health.record_frame(frame.data.len(), frame.keyframe);
                self.last_frame = Some(frame);
            }
            ScheduleAction::Delay { micros } => {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(Duration::from_micros(micros as u64)) => {}
                }
                self.sink.render(&frame)?;
                self.health.record_frame(frame.data.len(), frame.keyframe);
                self.last_frame = Some(frame);
            }
            ScheduleAction::RepeatPrevious => {
                if let Some(previous) = self.last_frame.clone() {
                    self.sink.render(&previous)?;
                }
                self.health.record_repeat();
            }
            ScheduleAction::Drop => {
                self.health.record_drop();
                debug!("present: dropped frame {}us late", -diff);
            }
        }

        if self.last_drift_check.elapsed() >= self.config.drift_interval {
            self.correct_drift();
            self.last_drift_check = Instant::now();
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineStage for PresentStage {
    async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        info!("present: started");
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = self.input.recv(Duration::from_millis(100)) => frame,
            };
            let Some(frame) = frame else {
                if self.input.is_closed() {
                    break;
                }
                continue;
            };
            self.handle_frame(frame, &cancel).await?;
        }
        self.input.drain();
        info!(
            "present: finished ({} shown, {} dropped, {} repeated)",
            self.health.frames_processed(),
            self.health.frames_dropped(),
            self.health.frames_repeated()
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "present"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SchedulerConfig {
        SchedulerConfig::default()
    }

    #[test]
    fn test_classifier_table() {
        // The receiver classifier table: (diff, keyframe) -> action.
        let c = config();
        assert_eq!(classify(60_000, false, &c), ScheduleAction::Delay { micros: 60_000 });
        assert_eq!(classify(0, false, &c), ScheduleAction::DisplayNow);
        assert_eq!(classify(-60_000, false, &c), ScheduleAction::RepeatPrevious);
        assert_eq!(classify(-120_000, false, &c), ScheduleAction::Drop);
        assert_eq!(classify(-120_000, true, &c), ScheduleAction::DisplayNow);
    }

    #[test]
    fn test_classifier_boundaries() {
        let c = config();
        assert_eq!(classify(40_000, false, &c), ScheduleAction::DisplayNow);
        assert_eq!(classify(40_001, false, &c), ScheduleAction::Delay { micros: 40_001 });
        assert_eq!(classify(-40_000, false, &c), ScheduleAction::DisplayNow);
        assert_eq!(classify(-40_001, false, &c), ScheduleAction::RepeatPrevious);
        assert_eq!(classify(-100_000, false, &c), ScheduleAction::RepeatPrevious);
        assert_eq!(classify(-100_001, false, &c), ScheduleAction::Drop);
    }

    #[test]
    fn test_early_cap_clamps_delay() {
        let c = config();
        assert_eq!(classify(450_000, false, &c), ScheduleAction::Delay { micros: 200_000 });
    }

    #[test]
    fn test_repeat_disabled_displays_late() {
        let c = SchedulerConfig { allow_repeat: false, ..config() };
        assert_eq!(classify(-60_000, false, &c), ScheduleAction::DisplayNow);
    }

    #[test]
    fn test_classifier_partition() {
        // Exactly one action for every (diff, keyframe) pair, and keyframes
        // never map to Drop.
        let c = config();
        for diff in (-500_000..=500_000).step_by(7_919) {
            for keyframe in [false, true] {
                let action = classify(diff, keyframe, &c);
                if keyframe {
                    assert_ne!(action, ScheduleAction::Drop, "keyframe dropped at diff {diff}");
                }
                // Delay only for early frames, drop/repeat only for late.
                match action {
                    ScheduleAction::Delay { micros } => {
                        assert!(diff > c.sync_threshold_us);
                        assert!(micros <= c.early_cap_us);
                    }
                    ScheduleAction::RepeatPrevious => {
                        assert!(diff < -c.sync_threshold_us);
                        assert!(diff >= -c.late_drop_threshold_us);
                    }
                    ScheduleAction::Drop => {
                        assert!(diff < -c.late_drop_threshold_us);
                        assert!(!keyframe);
                    }
                    ScheduleAction::DisplayNow => {}
                }
            }
        }
    }

    /// Sink that remembers what it rendered.
    struct CollectingSink(std::sync::mpsc::Sender<i64>);

    impl VideoSink for CollectingSink {
        fn render(&mut self, frame: &DecodedVideoFrame) -> crate::error::Result<()> {
            let _ = self.0.send(frame.pts.as_micros());
            Ok(())
        }
    }

    fn decoded(pts_us: i64, keyframe: bool) -> DecodedVideoFrame {
        DecodedVideoFrame {
            data: vec![0u8; 16],
            width: 4,
            height: 2,
            pts: Timestamp::from_micros(pts_us),
            keyframe,
        }
    }

    #[tokio::test]
    async fn test_stage_drops_late_and_repeats() {
        let input = BoundedHandoff::new(16, crate::pipeline::handoff::OverflowPolicy::DropOldest);
        let (tx, rx) = std::sync::mpsc::channel();
        let clock = MasterClock::new();
        clock.set(Timestamp::from_micros(1_000_000));
        let health = Arc::new(PipelineHealth::new());

        let mut stage = PresentStage::new(
            input.clone(),
            Box::new(CollectingSink(tx)),
            clock,
            SchedulerConfig::default(),
            health.clone(),
        );

        // On time: displayed.
        input.try_push(decoded(1_000_000, true)).unwrap();
        // 60 ms late: repeat previous.
        input.try_push(decoded(940_000, false)).unwrap();
        // 300 ms late: dropped.
        input.try_push(decoded(700_000, false)).unwrap();
        input.close();

        let cancel = CancellationToken::new();
        stage.run(cancel).await.unwrap();

        let rendered: Vec<i64> = rx.try_iter().collect();
        // First frame rendered once, then repeated once.
        assert_eq!(rendered, vec![1_000_000, 1_000_000]);
        assert_eq!(health.frames_repeated(), 1);
        assert_eq!(health.frames_dropped(), 1);
    }

    #[tokio::test]
    async fn test_drift_correction_speed_bounds_and_recovery() {
        let input: BoundedHandoff<DecodedVideoFrame> =
            BoundedHandoff::new(4, crate::pipeline::handoff::OverflowPolicy::DropOldest);
        let (tx, _rx) = std::sync::mpsc::channel();
        let clock = MasterClock::new();
        clock.set(Timestamp::ZERO);
        let health = Arc::new(PipelineHealth::new());

        let mut stage = PresentStage::new(
            input,
            Box::new(CollectingSink(tx)),
            clock.clone(),
            SchedulerConfig::default(),
            health,
        );

        // Video far ahead of the clock: speed goes up.
        stage.last_video_pts = Some(Timestamp::from_micros(500_000));
        stage.correct_drift();
        assert!((stage.clock.speed() - 1.02).abs() < 1e-9);

        // Drift back inside the window: speed returns to 1.0.
        clock.set(Timestamp::from_micros(495_000));
        stage.correct_drift();
        assert_eq!(stage.clock.speed(), 1.0);

        // Video far behind: speed goes down.
        clock.set(Timestamp::from_micros(2_000_000));
        stage.correct_drift();
        assert!((stage.clock.speed() - 0.98).abs() < 1e-9);
    }
}
