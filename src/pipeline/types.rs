//! Core types shared by every pipeline stage.
//!
//! All timing in the crate is expressed as [`Timestamp`] values: signed
//! microseconds sampled from a monotonic clock at the moment a frame leaves
//! its source. Within one stream timestamps are non-decreasing; across the
//! audio and video streams they share a time base, so their difference is
//! the A/V offset.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Presentation timestamp in microseconds on the session's monotonic clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    micros: i64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { micros: 0 };

    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    pub fn from_millis(millis: i64) -> Self {
        Self { micros: millis * 1_000 }
    }

    /// Timestamp of `instant` relative to the session base.
    pub fn from_instant(instant: Instant, base: Instant) -> Self {
        Self { micros: instant.saturating_duration_since(base).as_micros() as i64 }
    }

    pub fn as_micros(&self) -> i64 {
        self.micros
    }

    /// Signed difference `self − other` in microseconds.
    pub fn delta(&self, other: Timestamp) -> i64 {
        self.micros - other.micros
    }

    /// Absolute difference as a `Duration`.
    pub fn distance(&self, other: Timestamp) -> Duration {
        Duration::from_micros(self.micros.abs_diff(other.micros))
    }

    pub fn add_micros(&self, delta: i64) -> Self {
        Self { micros: self.micros + delta }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}us", self.micros)
    }
}

/// Which stream a frame or packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    /// Wire stream id: video = 0, audio = 1.
    pub fn wire_id(&self) -> u8 {
        match self {
            StreamKind::Video => 0,
            StreamKind::Audio => 1,
        }
    }

    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(StreamKind::Video),
            1 => Some(StreamKind::Audio),
            _ => None,
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Video => write!(f, "video"),
            StreamKind::Audio => write!(f, "audio"),
        }
    }
}

/// Pixel layout of a raw captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb24,
    Rgba32,
    Bgr24,
    Bgra32,
    Nv12,
    Yuv420p,
    Yuv444p,
}

impl PixelFormat {
    /// Name understood by the codec library's scaler.
    pub fn codec_name(&self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Rgba32 => "rgba",
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Bgra32 => "bgra",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::Yuv420p => "yuv420p",
            PixelFormat::Yuv444p => "yuv444p",
        }
    }

    /// Bytes per pixel for packed formats; `None` for planar ones.
    pub fn packed_bpp(&self) -> Option<usize> {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Rgba32 | PixelFormat::Bgra32 => Some(4),
            _ => None,
        }
    }
}

/// Video codec selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    H265,
    Vp9,
    Av1,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
            VideoCodec::Vp9 => "vp9",
            VideoCodec::Av1 => "av1",
        }
    }
}

/// Hardware encoder family, `None` meaning software.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareAccel {
    #[default]
    None,
    Vaapi,
    Nvenc,
    Amf,
    Qsv,
}

/// A raw captured video frame, exclusively owned by one stage at a time.
#[derive(Debug, Clone)]
pub struct RawVideoFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub pts: Timestamp,
    /// Advisory hint from the source; encoders may ignore it.
    pub keyframe_hint: bool,
}

/// An encoded video frame ready for the synchronizer and the wire.
#[derive(Debug, Clone)]
pub struct EncodedVideoFrame {
    pub data: Bytes,
    pub pts: Timestamp,
    /// Decode timestamp. Equal to `pts` in this system (no B-frames).
    pub dts: Timestamp,
    /// True iff the frame is decodable without any reference frame.
    pub keyframe: bool,
    pub codec: VideoCodec,
}

/// A raw audio frame: interleaved f32 samples.
#[derive(Debug, Clone)]
pub struct RawAudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples_per_channel: u32,
    pub pts: Timestamp,
}

impl RawAudioFrame {
    /// Duration implied by the sample count.
    pub fn duration_micros(&self) -> i64 {
        self.samples_per_channel as i64 * 1_000_000 / self.sample_rate as i64
    }
}

/// An encoded audio packet (Opus). Duration is implicit: one encoder frame.
#[derive(Debug, Clone)]
pub struct EncodedAudioFrame {
    pub data: Bytes,
    pub pts: Timestamp,
}

/// A time-aligned pair emitted by the sender synchronizer.
///
/// At least one half is always present. When both are, their PTS values
/// differ by less than the synchronizer's `max_desync_us`.
#[derive(Debug, Clone, Default)]
pub struct SyncedFrames {
    pub video: Option<EncodedVideoFrame>,
    pub audio: Option<EncodedAudioFrame>,
    pub presentation_time: Timestamp,
}

impl SyncedFrames {
    pub fn video_valid(&self) -> bool {
        self.video.is_some()
    }

    pub fn audio_valid(&self) -> bool {
        self.audio.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }
}
