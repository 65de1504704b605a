//! Opus audio encoder.
//!
//! Low-delay configuration: fixed 20 ms frames, in-band FEC and DTX both
//! disabled (this system trades resilience for latency; the jitter buffer
//! on the receiver absorbs what the network does). Input frames of any
//! duration are accumulated and re-sliced to exactly the encoder frame
//! size; each emitted packet carries the PTS of its first sample.

use ac_ffmpeg::codec::Encoder as _;
use ac_ffmpeg::codec::audio::frame::get_sample_format;
use ac_ffmpeg::codec::audio::{AudioEncoder as FfAudioEncoder, AudioFrameMut, ChannelLayout};
use bytes::Bytes;
use log::info;

use crate::error::{Error, Result};
use crate::pipeline::types::{EncodedAudioFrame, RawAudioFrame, Timestamp};

/// Audio encoder configuration.
#[derive(Debug, Clone)]
pub struct AudioEncoderConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate_bps: u32,
    pub frame_size_ms: u32,
}

impl Default for AudioEncoderConfig {
    fn default() -> Self {
        Self { sample_rate: 48_000, channels: 2, bitrate_bps: 128_000, frame_size_ms: 20 }
    }
}

/// Opus encoder over FFmpeg's libopus.
pub struct AudioEncoder {
    encoder: FfAudioEncoder,
    config: AudioEncoderConfig,
    /// Interleaved samples not yet sliced into a full encoder frame.
    pending: Vec<f32>,
    /// PTS of `pending[0]`; `None` while empty.
    pending_pts: Option<Timestamp>,
    packets_emitted: u64,
}

// Owned codec context, moved with its stage, never shared.
unsafe impl Send for AudioEncoder {}

impl AudioEncoder {
    pub fn new(config: AudioEncoderConfig) -> Result<Self> {
        super::ensure_codec_init();
        let layout = ChannelLayout::from_channels(config.channels as u32)
            .ok_or_else(|| Error::config(format!("unsupported channel count {}", config.channels)))?;

        let bitrate = config.bitrate_bps.to_string();
        let frame_duration = config.frame_size_ms.to_string();
        let encoder = FfAudioEncoder::builder("libopus")
            .map_err(|err| Error::initialization(format!("libopus unavailable: {err}")))?
            .sample_rate(config.sample_rate)
            .channel_layout(layout)
            .sample_format(get_sample_format("flt"))
            .set_option("b", bitrate.as_str())
            .set_option("frame_duration", frame_duration.as_str())
            .set_option("application", "lowdelay")
            .set_option("fec", "0")
            .set_option("dtx", "0")
            .build()
            .map_err(|err| Error::initialization(format!("opus encoder init: {err}")))?;

        info!(
            "audio encoder: libopus {} Hz, {} ch, {} ms frames",
            config.sample_rate, config.channels, config.frame_size_ms
        );

        Ok(Self { encoder, config, pending: Vec::new(), pending_pts: None, packets_emitted: 0 })
    }

    /// Interleaved samples per encoder frame (all channels).
    fn samples_per_packet(&self) -> usize {
        (self.config.sample_rate * self.config.frame_size_ms / 1_000) as usize
            * self.config.channels as usize
    }

    fn frame_duration_micros(&self) -> i64 {
        self.config.frame_size_ms as i64 * 1_000
    }

    /// Encode a raw frame, emitting zero or more packets.
    ///
    /// A frame shorter than the encoder frame size is buffered; longer
    /// frames are segmented. PTS continuity is derived from the buffered
    /// run, so arbitrary input slicing still yields packets whose PTS
    /// advance by exactly one frame duration.
    pub fn encode(&mut self, frame: &RawAudioFrame) -> Result<Vec<EncodedAudioFrame>> {
        if frame.sample_rate != self.config.sample_rate
            || frame.channels != self.config.channels
        {
            return Err(Error::invariant(format!(
                "audio format changed mid-session: {} Hz {} ch",
                frame.sample_rate, frame.channels
            )));
        }

        if self.pending.is_empty() {
            self.pending_pts = Some(frame.pts);
        }
        self.pending.extend_from_slice(&frame.samples);

        let per_packet = self.samples_per_packet();
        let mut out = Vec::new();
        while self.pending.len() >= per_packet {
            let chunk: Vec<f32> = self.pending.drain(..per_packet).collect();
            let pts = self.pending_pts.unwrap_or(frame.pts);
            self.pending_pts = Some(pts.add_micros(self.frame_duration_micros()));
            out.extend(self.encode_chunk(&chunk, pts)?);
        }
        Ok(out)
    }

    fn encode_chunk(&mut self, samples: &[f32], pts: Timestamp) -> Result<Vec<EncodedAudioFrame>> {
        let samples_per_channel = samples.len() / self.config.channels as usize;
        let layout = ChannelLayout::from_channels(self.config.channels as u32)
            .ok_or_else(|| Error::codec("channel layout"))?;

        let mut frame = AudioFrameMut::silence(
            &layout,
            get_sample_format("flt"),
            self.config.sample_rate,
            samples_per_channel,
        );

        {
            let mut planes = frame.planes_mut();
            let data = planes[0].data_mut();
            let dst: &mut [f32] = unsafe {
                std::slice::from_raw_parts_mut(
                    data.as_mut_ptr() as *mut f32,
                    data.len() / std::mem::size_of::<f32>(),
                )
            };
            dst[..samples.len()].copy_from_slice(samples);
        }

        self.encoder
            .push(frame.freeze())
            .map_err(|err| Error::codec(format!("opus push: {err}")))?;

        let mut out = Vec::new();
        while let Some(packet) = self
            .encoder
            .take()
            .map_err(|err| Error::codec(format!("opus take: {err}")))?
        {
            // The codec may batch; packets come out in order, one frame
            // duration apart.
            let packet_pts =
                pts.add_micros(out.len() as i64 * self.frame_duration_micros());
            out.push(EncodedAudioFrame {
                data: Bytes::copy_from_slice(packet.data()),
                pts: packet_pts,
            });
            self.packets_emitted += 1;
        }
        Ok(out)
    }

    pub fn packets_emitted(&self) -> u64 {
        self.packets_emitted
    }

    /// Samples currently buffered awaiting a full frame.
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_per_packet() {
        // Construction needs libopus; the arithmetic is what matters here.
        let config = AudioEncoderConfig::default();
        let samples =
            (config.sample_rate * config.frame_size_ms / 1_000) as usize * config.channels as usize;
        assert_eq!(samples, 1_920);
    }

    #[test]
    fn test_frame_duration() {
        let config = AudioEncoderConfig { frame_size_ms: 10, ..Default::default() };
        assert_eq!(config.frame_size_ms as i64 * 1_000, 10_000);
    }
}
