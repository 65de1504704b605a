//! Capture-source boundary: capability traits plus synthetic sources.

pub mod synthetic;
pub mod traits;

pub use synthetic::{PatternVideoSource, ToneAudioSource};
pub use traits::{
    AudioCaptureConfig, AudioCaptureSource, CaptureEvent, CaptureRegion, MonitorInfo,
    ScreenCaptureSource, VideoCaptureConfig,
};
