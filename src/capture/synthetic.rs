//! Deterministic capture sources for tests and loopback runs.
//!
//! The pattern source emits solid-gradient BGRA frames paced at the target
//! fps; the tone source emits a sine wave in exact frame-duration slices.
//! Both stamp PTS from a shared [`StreamClock`], so they exercise the same
//! timing paths as real drivers.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::pipeline::clock::StreamClock;
use crate::pipeline::types::{PixelFormat, RawAudioFrame, RawVideoFrame, Timestamp};

use super::traits::{
    AudioCaptureConfig, AudioCaptureSource, CaptureEvent, MonitorInfo, ScreenCaptureSource,
    VideoCaptureConfig,
};

/// Synthetic screen source: animated gradient at a fixed geometry.
pub struct PatternVideoSource {
    clock: StreamClock,
    config: VideoCaptureConfig,
    width: u32,
    height: u32,
    running: bool,
    frame_index: u64,
    sink: Option<Arc<dyn Fn(CaptureEvent) + Send + Sync>>,
    /// Queued sentinel emitted before the next frame after a reconfigure.
    pending_format_change: bool,
}

impl PatternVideoSource {
    pub fn new(width: u32, height: u32, clock: StreamClock) -> Self {
        Self {
            clock,
            config: VideoCaptureConfig::default(),
            width,
            height,
            running: false,
            frame_index: 0,
            sink: None,
            pending_format_change: false,
        }
    }

    fn render_frame(&mut self) -> RawVideoFrame {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut data = vec![0u8; w * h * 4];
        let shade = (self.frame_index % 256) as u8;
        for row in 0..h {
            let base = row * w * 4;
            let row_shade = shade.wrapping_add(row as u8);
            for px in 0..w {
                let offset = base + px * 4;
                data[offset] = row_shade;
                data[offset + 1] = shade;
                data[offset + 2] = px as u8;
                data[offset + 3] = 0xFF;
            }
        }
        self.frame_index += 1;
        RawVideoFrame {
            data: Bytes::from(data),
            width: self.width,
            height: self.height,
            stride: self.width * 4,
            format: PixelFormat::Bgra32,
            pts: self.clock.now(),
            keyframe_hint: false,
        }
    }

    /// Change geometry mid-session; the next pull yields the sentinel.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.pending_format_change = true;
    }
}

#[async_trait]
impl ScreenCaptureSource for PatternVideoSource {
    fn initialize(&mut self, config: &VideoCaptureConfig) -> Result<()> {
        if config.target_fps == 0 {
            return Err(Error::config("target_fps must be at least 1"));
        }
        self.config = config.clone();
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }

    async fn capture_frame(&mut self, deadline: Duration) -> Result<Option<CaptureEvent>> {
        if !self.running {
            return Err(Error::invariant("capture_frame on a stopped source"));
        }
        if self.pending_format_change {
            self.pending_format_change = false;
            return Ok(Some(CaptureEvent::FormatChange {
                width: self.width,
                height: self.height,
                format: PixelFormat::Bgra32,
            }));
        }

        let interval = Duration::from_micros(1_000_000 / self.config.target_fps as u64);
        if interval > deadline {
            tokio::time::sleep(deadline).await;
            return Ok(None);
        }
        tokio::time::sleep(interval).await;
        Ok(Some(CaptureEvent::Frame(self.render_frame())))
    }

    fn register_sink(&mut self, sink: Box<dyn Fn(CaptureEvent) + Send + Sync>) -> Result<()> {
        self.sink = Some(Arc::from(sink));
        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn actual_fps(&self) -> f64 {
        self.config.target_fps as f64
    }

    fn monitors(&self) -> Vec<MonitorInfo> {
        vec![MonitorInfo {
            id: 0,
            name: "synthetic".to_string(),
            width: self.width,
            height: self.height,
            primary: true,
        }]
    }

    fn select_monitor(&mut self, id: i32) -> Result<()> {
        if id != -1 && id != 0 {
            return Err(Error::config(format!("no such monitor: {id}")));
        }
        Ok(())
    }
}

/// Synthetic audio source: 440 Hz tone in exact frame-size slices.
pub struct ToneAudioSource {
    config: AudioCaptureConfig,
    running: bool,
    frame_index: u64,
    phase: f32,
    base_pts: Option<Timestamp>,
    clock: StreamClock,
}

impl ToneAudioSource {
    pub fn new(clock: StreamClock) -> Self {
        Self {
            config: AudioCaptureConfig::default(),
            running: false,
            frame_index: 0,
            phase: 0.0,
            base_pts: None,
            clock,
        }
    }

    fn samples_per_frame(&self) -> u32 {
        self.config.sample_rate * self.config.frame_size_ms / 1_000
    }

    fn frame_duration_micros(&self) -> i64 {
        self.config.frame_size_ms as i64 * 1_000
    }
}

#[async_trait]
impl AudioCaptureSource for ToneAudioSource {
    fn initialize(&mut self, config: &AudioCaptureConfig) -> Result<()> {
        if config.sample_rate == 0 || config.channels == 0 || config.frame_size_ms == 0 {
            return Err(Error::config("audio capture config must be non-zero"));
        }
        self.config = config.clone();
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }

    async fn capture_frame(&mut self, deadline: Duration) -> Result<Option<RawAudioFrame>> {
        if !self.running {
            return Err(Error::invariant("capture_frame on a stopped source"));
        }
        let interval = Duration::from_micros(self.frame_duration_micros() as u64);
        if interval > deadline {
            tokio::time::sleep(deadline).await;
            return Ok(None);
        }
        tokio::time::sleep(interval).await;

        let samples_per_channel = self.samples_per_frame();
        let channels = self.config.channels as usize;
        let step = 440.0 * 2.0 * std::f32::consts::PI / self.config.sample_rate as f32;
        let mut samples = Vec::with_capacity(samples_per_channel as usize * channels);
        for _ in 0..samples_per_channel {
            self.phase += step;
            let value = self.phase.sin() * 0.2;
            for _ in 0..channels {
                samples.push(value);
            }
        }

        // PTS advances by exactly one frame duration per frame, anchored at
        // the first pull.
        let now = self.clock.now();
        let base = *self.base_pts.get_or_insert(now);
        let pts = base.add_micros(self.frame_index as i64 * self.frame_duration_micros());
        self.frame_index += 1;

        Ok(Some(RawAudioFrame {
            samples,
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
            samples_per_channel,
            pts,
        }))
    }

    fn register_sink(&mut self, _sink: Box<dyn Fn(RawAudioFrame) + Send + Sync>) -> Result<()> {
        Err(Error::initialization("tone source runs in pull mode only"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pattern_source_pts_monotonic() {
        let mut source = PatternVideoSource::new(64, 48, StreamClock::new());
        source.initialize(&VideoCaptureConfig { target_fps: 120, ..Default::default() }).unwrap();
        source.start().unwrap();

        let mut last = Timestamp::from_micros(-1);
        for _ in 0..5 {
            let event = source.capture_frame(Duration::from_millis(100)).await.unwrap();
            let Some(CaptureEvent::Frame(frame)) = event else {
                panic!("expected a frame");
            };
            assert!(frame.pts > last);
            assert_eq!(frame.width, 64);
            assert_eq!(frame.data.len(), 64 * 48 * 4);
            last = frame.pts;
        }
    }

    #[tokio::test]
    async fn test_format_change_sentinel_precedes_frames() {
        let mut source = PatternVideoSource::new(64, 48, StreamClock::new());
        source.initialize(&VideoCaptureConfig { target_fps: 120, ..Default::default() }).unwrap();
        source.start().unwrap();
        let _ = source.capture_frame(Duration::from_millis(100)).await.unwrap();

        source.resize(128, 96);
        let event = source.capture_frame(Duration::from_millis(100)).await.unwrap();
        assert!(matches!(
            event,
            Some(CaptureEvent::FormatChange { width: 128, height: 96, .. })
        ));

        let event = source.capture_frame(Duration::from_millis(100)).await.unwrap();
        let Some(CaptureEvent::Frame(frame)) = event else {
            panic!("expected a frame after the sentinel");
        };
        assert_eq!((frame.width, frame.height), (128, 96));
    }

    #[tokio::test]
    async fn test_tone_source_exact_pts_cadence() {
        let mut source = ToneAudioSource::new(StreamClock::new());
        source.initialize(&AudioCaptureConfig::default()).unwrap();
        source.start().unwrap();

        let first = source.capture_frame(Duration::from_millis(100)).await.unwrap().unwrap();
        let second = source.capture_frame(Duration::from_millis(100)).await.unwrap().unwrap();
        let third = source.capture_frame(Duration::from_millis(100)).await.unwrap().unwrap();

        assert_eq!(first.samples_per_channel, 960);
        assert_eq!(second.pts.delta(first.pts), 20_000);
        assert_eq!(third.pts.delta(second.pts), 20_000);
        assert_eq!(first.samples.len(), 960 * 2);
    }

    #[tokio::test]
    async fn test_stopped_source_rejects_pull() {
        let mut source = ToneAudioSource::new(StreamClock::new());
        source.initialize(&AudioCaptureConfig::default()).unwrap();
        let err = source.capture_frame(Duration::from_millis(1)).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvariantViolation);
    }
}
