//! Capability traits for capture sources.
//!
//! Backend drivers (X11, Wayland portal + PipeWire, and their audio
//! counterparts) live outside this crate. The pipeline consumes these
//! traits only and relies on the documented guarantees: monotonic PTS,
//! stable frame geometry between format-change sentinels, and audio PTS
//! advancing by exactly the frame duration.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::pipeline::types::{PixelFormat, RawAudioFrame, RawVideoFrame};

/// Sub-rectangle of the captured surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Screen capture session configuration.
#[derive(Debug, Clone)]
pub struct VideoCaptureConfig {
    /// Capture region; `None` captures the whole monitor.
    pub region: Option<CaptureRegion>,
    pub target_fps: u32,
    pub show_cursor: bool,
    pub preferred_format: PixelFormat,
    /// Monitor id; -1 selects the primary.
    pub monitor: i32,
}

impl Default for VideoCaptureConfig {
    fn default() -> Self {
        Self {
            region: None,
            target_fps: 60,
            show_cursor: true,
            preferred_format: PixelFormat::Bgra32,
            monitor: -1,
        }
    }
}

/// Audio capture session configuration.
#[derive(Debug, Clone)]
pub struct AudioCaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frame duration handed to the encoder; 20 ms default.
    pub frame_size_ms: u32,
}

impl Default for AudioCaptureConfig {
    fn default() -> Self {
        Self { sample_rate: 48_000, channels: 2, frame_size_ms: 20 }
    }
}

/// One attached monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorInfo {
    pub id: i32,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub primary: bool,
}

/// What a pull on the video source yields.
///
/// A format change arrives as its own event before the first frame in the
/// new geometry; consumers reconfigure the encoder when they see it.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    Frame(RawVideoFrame),
    FormatChange { width: u32, height: u32, format: PixelFormat },
}

/// Screen capture source capability set.
///
/// Sessions run in exactly one of two modes: pull (`capture_frame`) or push
/// (`register_sink`); mixing them within a session is a driver contract
/// violation.
#[async_trait]
pub trait ScreenCaptureSource: Send {
    fn initialize(&mut self, config: &VideoCaptureConfig) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    fn is_running(&self) -> bool;

    /// Pull mode: block up to `deadline` for the next event. `Ok(None)`
    /// means the deadline passed without a frame.
    async fn capture_frame(&mut self, deadline: Duration) -> Result<Option<CaptureEvent>>;

    /// Push mode: the backend invokes `sink` from its own thread. The sink
    /// must enqueue and return promptly.
    fn register_sink(&mut self, sink: Box<dyn Fn(CaptureEvent) + Send + Sync>) -> Result<()>;

    fn resolution(&self) -> (u32, u32);

    fn actual_fps(&self) -> f64;

    fn monitors(&self) -> Vec<MonitorInfo>;

    fn select_monitor(&mut self, id: i32) -> Result<()>;
}

/// Audio capture source capability set; same pull/push duality.
#[async_trait]
pub trait AudioCaptureSource: Send {
    fn initialize(&mut self, config: &AudioCaptureConfig) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    fn is_running(&self) -> bool;

    /// Pull the next audio frame. Frames span exactly the configured frame
    /// duration; PTS advances by that duration every frame.
    async fn capture_frame(&mut self, deadline: Duration) -> Result<Option<RawAudioFrame>>;

    /// Push mode. The callback must be reentrant-safe.
    fn register_sink(&mut self, sink: Box<dyn Fn(RawAudioFrame) + Send + Sync>) -> Result<()>;
}
