//! Audio decoding and playout.
//!
//! Opus packets decode to interleaved f32 samples which land in a bounded
//! ring buffer. The audio backend's realtime callback pulls from the ring;
//! every pull advances the playout position, and that position is what
//! drives the receiver's master clock when audio is the clock source.

use ac_ffmpeg::codec::Decoder as _;
use ac_ffmpeg::codec::audio::AudioDecoder as FfAudioDecoder;
use ac_ffmpeg::packet::PacketMut;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{error, warn};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::pipeline::types::{EncodedAudioFrame, RawAudioFrame, Timestamp};

const I16_TO_F32: f32 = 1.0 / 32768.0;

/// Ring capacity in samples; at 48 kHz stereo about 170 ms. Bounds both
/// memory and worst-case playout latency.
const MAX_BUFFER_SAMPLES: usize = 16_384;

/// Opus decoder producing interleaved f32 frames.
pub struct AudioDecoder {
    decoder: FfAudioDecoder,
    sample_rate: u32,
    channels: u16,
}

// Owned codec context, moved with its stage, never shared.
unsafe impl Send for AudioDecoder {}

impl AudioDecoder {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self> {
        crate::encoder::ensure_codec_init();
        let decoder = FfAudioDecoder::new("libopus")
            .or_else(|err| {
                warn!("libopus decoder unavailable ({err}), trying built-in opus");
                FfAudioDecoder::new("opus")
            })
            .map_err(|err| Error::initialization(format!("opus decoder init: {err}")))?;
        Ok(Self { decoder, sample_rate, channels })
    }

    /// Decode one packet into zero or more raw frames.
    pub fn decode(&mut self, packet: &EncodedAudioFrame) -> Result<Vec<RawAudioFrame>> {
        let ff_packet = PacketMut::from(&packet.data[..]).freeze();
        if let Err(err) = self.decoder.try_push(ff_packet) {
            if err.is_again() {
                let frames = self.drain(packet.pts)?;
                let retry = PacketMut::from(&packet.data[..]).freeze();
                if let Err(err) = self.decoder.try_push(retry) {
                    return Err(Error::codec(format!("opus decode retry: {err}")));
                }
                let mut out = frames;
                out.extend(self.drain(packet.pts)?);
                return Ok(out);
            }
            return Err(Error::codec(format!("opus decode: {err}")));
        }
        self.drain(packet.pts)
    }

    fn drain(&mut self, base_pts: Timestamp) -> Result<Vec<RawAudioFrame>> {
        let mut out = Vec::new();
        let mut offset_us = 0i64;

        while let Ok(Some(frame)) = self.decoder.take() {
            let samples_per_channel = frame.samples();
            if samples_per_channel == 0 {
                continue;
            }
            let planes = frame.planes();
            let mut samples = Vec::with_capacity(samples_per_channel * self.channels as usize);

            if planes.len() >= 2 {
                // Planar output: interleave.
                let left = planes[0].data();
                let right = planes[1].data();
                if !interleave_planar(&mut samples, left, right, samples_per_channel) {
                    warn!(
                        "audio plane too small ({}+{} bytes for {} samples)",
                        left.len(),
                        right.len(),
                        samples_per_channel
                    );
                    continue;
                }
            } else if let Some(data) = planes.first().map(|p| p.data()) {
                if !extend_interleaved(&mut samples, data, samples_per_channel, self.channels) {
                    warn!("interleaved audio too small ({} bytes)", data.len());
                    continue;
                }
            }

            let pts = base_pts.add_micros(offset_us);
            offset_us += samples_per_channel as i64 * 1_000_000 / self.sample_rate as i64;

            out.push(RawAudioFrame {
                samples,
                sample_rate: self.sample_rate,
                channels: self.channels,
                samples_per_channel: samples_per_channel as u32,
                pts,
            });
        }
        Ok(out)
    }
}

fn interleave_planar(out: &mut Vec<f32>, left: &[u8], right: &[u8], count: usize) -> bool {
    let need_f32 = count * 4;
    if left.len() >= need_f32 && right.len() >= need_f32 {
        let left: &[f32] = unsafe { std::slice::from_raw_parts(left.as_ptr() as *const f32, count) };
        let right: &[f32] =
            unsafe { std::slice::from_raw_parts(right.as_ptr() as *const f32, count) };
        for i in 0..count {
            out.push(left[i]);
            out.push(right[i]);
        }
        return true;
    }
    let need_i16 = count * 2;
    if left.len() >= need_i16 && right.len() >= need_i16 {
        let left: &[i16] = unsafe { std::slice::from_raw_parts(left.as_ptr() as *const i16, count) };
        let right: &[i16] =
            unsafe { std::slice::from_raw_parts(right.as_ptr() as *const i16, count) };
        for i in 0..count {
            out.push(left[i] as f32 * I16_TO_F32);
            out.push(right[i] as f32 * I16_TO_F32);
        }
        return true;
    }
    false
}

fn extend_interleaved(out: &mut Vec<f32>, data: &[u8], count: usize, channels: u16) -> bool {
    let total = count * channels as usize;
    if data.len() >= total * 4 {
        let samples: &[f32] =
            unsafe { std::slice::from_raw_parts(data.as_ptr() as *const f32, total) };
        out.extend_from_slice(samples);
        return true;
    }
    if data.len() >= total * 2 {
        let samples: &[i16] =
            unsafe { std::slice::from_raw_parts(data.as_ptr() as *const i16, total) };
        out.extend(samples.iter().map(|&s| s as f32 * I16_TO_F32));
        return true;
    }
    false
}

struct RingState {
    buffer: Vec<f32>,
    write_pos: usize,
    read_pos: usize,
    len: usize,
    samples_dropped: u64,
    /// Stream PTS of the next sample to be read; `None` until first write.
    next_read_pts: Option<i64>,
}

/// Bounded playout ring shared between the decode task and the realtime
/// audio callback.
///
/// Reads advance the playout position; [`position`](AudioPlayoutQueue::position)
/// is the PTS of the sample currently leaving the speaker, which the master
/// clock consumes.
pub struct AudioPlayoutQueue {
    state: Mutex<RingState>,
    sample_rate: u32,
    channels: u16,
    /// Mirror of the playout position for lock-free reads.
    position_us: AtomicI64,
}

impl AudioPlayoutQueue {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            state: Mutex::new(RingState {
                buffer: vec![0.0; MAX_BUFFER_SAMPLES],
                write_pos: 0,
                read_pos: 0,
                len: 0,
                samples_dropped: 0,
                next_read_pts: None,
            }),
            sample_rate,
            channels,
            position_us: AtomicI64::new(0),
        }
    }

    /// Queue a decoded frame, dropping the oldest samples on overflow (the
    /// no-silent-drop rule applies on the sender; at playout, stale audio
    /// is worse than a skip).
    pub fn push(&self, frame: &RawAudioFrame) {
        let mut state = self.state.lock().unwrap();
        if state.next_read_pts.is_none() {
            state.next_read_pts = Some(frame.pts.as_micros());
            self.position_us.store(frame.pts.as_micros(), Ordering::Release);
        }
        let capacity = state.buffer.len();
        for &sample in &frame.samples {
            if state.len >= capacity {
                state.read_pos = (state.read_pos + 1) % capacity;
                state.samples_dropped += 1;
                let advance = 1_000_000 / (self.sample_rate as i64 * self.channels as i64);
                if let Some(pts) = state.next_read_pts.as_mut() {
                    *pts += advance.max(0);
                }
            } else {
                state.len += 1;
            }
            let pos = state.write_pos;
            state.buffer[pos] = sample;
            state.write_pos = (pos + 1) % capacity;
        }
    }

    /// Fill `output` from the ring, zero-padding on underrun, and advance
    /// the playout position.
    pub fn read(&self, output: &mut [f32]) {
        let mut state = self.state.lock().unwrap();
        let capacity = state.buffer.len();
        let mut consumed = 0usize;
        for slot in output.iter_mut() {
            if state.len > 0 {
                *slot = state.buffer[state.read_pos];
                state.read_pos = (state.read_pos + 1) % capacity;
                state.len -= 1;
                consumed += 1;
            } else {
                *slot = 0.0;
            }
        }

        if consumed > 0 && let Some(pts) = state.next_read_pts.as_mut() {
            let frames = consumed as i64 / self.channels as i64;
            *pts += frames * 1_000_000 / self.sample_rate as i64;
            self.position_us.store(*pts, Ordering::Release);
        }
    }

    /// PTS of the sample at the speaker right now.
    pub fn position(&self) -> Timestamp {
        Timestamp::from_micros(self.position_us.load(Ordering::Acquire))
    }

    /// Queued duration in microseconds.
    pub fn buffered_micros(&self) -> i64 {
        let state = self.state.lock().unwrap();
        state.len as i64 / self.channels as i64 * 1_000_000 / self.sample_rate as i64
    }

    pub fn samples_dropped(&self) -> u64 {
        self.state.lock().unwrap().samples_dropped
    }
}

/// cpal-backed output stream pulling from an [`AudioPlayoutQueue`].
pub struct AudioSink {
    _stream: cpal::Stream,
}

// The cpal stream handle is only held to keep playback alive.
unsafe impl Send for AudioSink {}

impl AudioSink {
    pub fn new(queue: Arc<AudioPlayoutQueue>) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::initialization("no audio output device"))?;
        let config = cpal::StreamConfig {
            channels: queue.channels,
            sample_rate: cpal::SampleRate(queue.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = device
            .build_output_stream(
                &config,
                move |output: &mut [f32], _| queue.read(output),
                |err| error!("audio output error: {err}"),
                None,
            )
            .map_err(|err| Error::initialization(format!("audio output stream: {err}")))?;
        stream
            .play()
            .map_err(|err| Error::initialization(format!("audio output start: {err}")))?;

        Ok(Self { _stream: stream })
    }
}
