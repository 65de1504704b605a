//! Video decoder wrapper.
//!
//! The decoder must see codec configuration before its first frame; in this
//! system the SPS/PPS travel in-band inside the first keyframe of each
//! configuration epoch, so feeding starts at a keyframe. After a run of
//! unrecoverable errors the wrapper raises `keyframe_needed`, which the
//! receiver coordinator forwards to the sender as a keyframe request.

use ac_ffmpeg::codec::Decoder as _;
use ac_ffmpeg::codec::video::VideoDecoder as FfVideoDecoder;
use ac_ffmpeg::packet::PacketMut;
use ac_ffmpeg::time::{TimeBase, Timestamp as FfTimestamp};
use log::{info, warn};
use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::pipeline::types::{EncodedVideoFrame, Timestamp, VideoCodec};

/// Consecutive decode failures before the wrapper asks for a keyframe.
const FAILURES_BEFORE_KEYFRAME_REQUEST: u32 = 10;

/// A decoded frame in packed yuv420p layout, stride-padding stripped.
#[derive(Debug, Clone)]
pub struct DecodedVideoFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub pts: Timestamp,
    pub keyframe: bool,
}

/// FFmpeg H.264/H.265 decoder with PTS passthrough.
pub struct VideoDecoder {
    decoder: FfVideoDecoder,
    codec: VideoCodec,
    time_base: TimeBase,
    /// PTS of frames pushed but not yet produced. With no B-frames the
    /// decoder preserves order, so a FIFO pairs outputs with inputs.
    in_flight: VecDeque<(Timestamp, bool)>,
    consecutive_failures: u32,
    keyframe_needed: bool,
    frames_decoded: u64,
    /// Reused output buffer.
    packed: Vec<u8>,
}

// Owned codec context, moved with its stage, never shared.
unsafe impl Send for VideoDecoder {}

impl VideoDecoder {
    pub fn new(codec: VideoCodec) -> Result<Self> {
        crate::encoder::ensure_codec_init();
        let time_base = TimeBase::new(1, 1_000_000);
        let decoder = Self::build(codec, time_base)?;
        Ok(Self {
            decoder,
            codec,
            time_base,
            in_flight: VecDeque::new(),
            consecutive_failures: 0,
            keyframe_needed: false,
            frames_decoded: 0,
            packed: Vec::new(),
        })
    }

    fn build(codec: VideoCodec, time_base: TimeBase) -> Result<FfVideoDecoder> {
        let name = match codec {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "hevc",
            VideoCodec::Vp9 => "vp9",
            VideoCodec::Av1 => "av1",
        };
        FfVideoDecoder::builder(name)
            .map_err(|err| Error::initialization(format!("decoder {name} unavailable: {err}")))?
            .time_base(time_base)
            .build()
            .map_err(|err| Error::initialization(format!("decoder {name} init: {err}")))
    }

    /// True when upstream should be asked for a keyframe. Reading clears
    /// the flag.
    pub fn take_keyframe_needed(&mut self) -> bool {
        std::mem::take(&mut self.keyframe_needed)
    }

    /// Decode one encoded frame. `Ok(None)` while the decoder buffers.
    pub fn decode(&mut self, frame: &EncodedVideoFrame) -> Result<Option<DecodedVideoFrame>> {
        if frame.codec != self.codec {
            return Err(Error::invariant(format!(
                "codec changed mid-stream: {} -> {}",
                self.codec.as_str(),
                frame.codec.as_str()
            )));
        }

        let packet = PacketMut::from(&frame.data[..])
            .with_pts(FfTimestamp::new(frame.pts.as_micros(), self.time_base))
            .freeze();

        if let Err(err) = self.decoder.try_push(packet) {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= FAILURES_BEFORE_KEYFRAME_REQUEST {
                warn!(
                    "video decoder: {} consecutive failures, requesting keyframe",
                    self.consecutive_failures
                );
                self.keyframe_needed = true;
                self.consecutive_failures = 0;
            }
            return Err(Error::codec(format!("decoder push: {err}")));
        }
        self.in_flight.push_back((frame.pts, frame.keyframe));

        match self.decoder.take() {
            Ok(Some(decoded)) => {
                self.consecutive_failures = 0;
                self.frames_decoded += 1;
                let (pts, keyframe) =
                    self.in_flight.pop_front().unwrap_or((frame.pts, frame.keyframe));
                Ok(Some(self.pack_frame(&decoded, pts, keyframe)))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= FAILURES_BEFORE_KEYFRAME_REQUEST {
                    self.keyframe_needed = true;
                    self.consecutive_failures = 0;
                }
                Err(Error::codec(format!("decoder take: {err}")))
            }
        }
    }

    fn pack_frame(
        &mut self,
        frame: &ac_ffmpeg::codec::video::VideoFrame,
        pts: Timestamp,
        keyframe: bool,
    ) -> DecodedVideoFrame {
        let width = frame.width();
        let height = frame.height();
        let planes = frame.planes();
        let (cw, ch) = (width / 2, height / 2);
        let total = width * height + cw * ch * 2;

        self.packed.clear();
        self.packed.reserve(total);

        let copy = |out: &mut Vec<u8>, data: &[u8], stride: usize, w: usize, rows: usize| {
            if stride == w {
                out.extend_from_slice(&data[..w * rows]);
            } else {
                for row in 0..rows {
                    out.extend_from_slice(&data[row * stride..row * stride + w]);
                }
            }
        };

        copy(&mut self.packed, planes[0].data(), planes[0].line_size(), width, height);
        copy(&mut self.packed, planes[1].data(), planes[1].line_size(), cw, ch);
        copy(&mut self.packed, planes[2].data(), planes[2].line_size(), cw, ch);

        DecodedVideoFrame {
            data: self.packed.clone(),
            width: width as u32,
            height: height as u32,
            pts,
            keyframe,
        }
    }

    /// Discard buffered decoder state. Used on resync: the next frame fed
    /// in must be a keyframe.
    pub fn flush(&mut self) -> Result<()> {
        info!("video decoder: flush");
        self.decoder = Self::build(self.codec, self.time_base)?;
        self.in_flight.clear();
        self.consecutive_failures = 0;
        Ok(())
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_counter_threshold() {
        // The keyframe_needed flag arms after the configured failure run;
        // the constant is part of the decoder's contract with the control
        // plane.
        assert_eq!(FAILURES_BEFORE_KEYFRAME_REQUEST, 10);
    }
}
