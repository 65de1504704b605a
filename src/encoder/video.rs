//! Video encoder: codec-agnostic contract over FFmpeg.
//!
//! Encoder selection walks a candidate chain tuned for low latency: the
//! configured hardware family first, then the software encoder. Every
//! candidate is built with zero reorder delay and no B-frames, so DTS
//! always equals PTS. A hardware failure mid-session falls back to
//! software exactly once; after that, failures surface to the supervisor.

use ac_ffmpeg::codec::video::{self, VideoEncoder as FfVideoEncoder};
use ac_ffmpeg::codec::Encoder as _;
use ac_ffmpeg::time::{TimeBase, Timestamp as FfTimestamp};
use bytes::Bytes;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::pipeline::types::{
    EncodedVideoFrame, HardwareAccel, PixelFormat, RawVideoFrame, Timestamp, VideoCodec,
};

/// Encoder configuration.
#[derive(Debug, Clone)]
pub struct VideoEncoderConfig {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_bps: u32,
    /// Keyframe interval in frames.
    pub gop_size: u32,
    /// Always 0 in this system; kept explicit because the wire format and
    /// the synchronizer both assume DTS == PTS.
    pub b_frames: u32,
    pub hw_accel: HardwareAccel,
}

impl Default for VideoEncoderConfig {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            width: 1920,
            height: 1080,
            fps: 60,
            bitrate_bps: 5_000_000,
            gop_size: 120,
            b_frames: 0,
            hw_accel: HardwareAccel::None,
        }
    }
}

/// Encoder lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Uninitialized,
    Ready,
    Encoding,
    /// A keyframe was requested; the next encoded frame will be an IDR.
    KeyframePending,
    Flushing,
    Closed,
}

/// Candidate codec implementations per hardware family, best first.
/// Options follow the low-latency tuning: no B-frames, no lookahead,
/// single-slice frames where the codec allows it.
fn candidate_chain(config: &VideoEncoderConfig) -> Vec<(&'static str, Vec<(String, String)>)> {
    let bitrate = config.bitrate_bps.to_string();
    let gop = config.gop_size.to_string();

    let nvenc = (
        "h264_nvenc",
        vec![
            ("preset".into(), "p2".into()),
            ("tune".into(), "ll".into()),
            ("zerolatency".into(), "1".into()),
            ("delay".into(), "0".into()),
            ("rc".into(), "cbr".into()),
            ("b".into(), bitrate.clone()),
            ("g".into(), gop.clone()),
            ("forced-idr".into(), "1".into()),
        ],
    );
    let qsv = (
        "h264_qsv",
        vec![
            ("preset".into(), "veryfast".into()),
            ("async_depth".into(), "1".into()),
            ("b".into(), bitrate.clone()),
            ("g".into(), gop.clone()),
        ],
    );
    let vaapi = (
        "h264_vaapi",
        vec![("b".into(), bitrate.clone()), ("g".into(), gop.clone()), ("bf".into(), "0".into())],
    );
    let amf = (
        "h264_amf",
        vec![
            ("usage".into(), "lowlatency".into()),
            ("b".into(), bitrate.clone()),
            ("g".into(), gop.clone()),
        ],
    );
    let software = (
        match config.codec {
            VideoCodec::H264 => "libx264",
            VideoCodec::H265 => "libx265",
            VideoCodec::Vp9 => "libvpx-vp9",
            VideoCodec::Av1 => "libaom-av1",
        },
        match config.codec {
            VideoCodec::H264 | VideoCodec::H265 => vec![
                ("preset".into(), "ultrafast".into()),
                ("tune".into(), "zerolatency".into()),
                ("b".into(), bitrate.clone()),
                ("g".into(), gop.clone()),
                ("bf".into(), "0".into()),
                ("slices".into(), "1".into()),
                ("sync-lookahead".into(), "0".into()),
            ],
            VideoCodec::Vp9 | VideoCodec::Av1 => vec![
                ("deadline".into(), "realtime".into()),
                ("lag-in-frames".into(), "0".into()),
                ("b".into(), bitrate.clone()),
                ("g".into(), gop.clone()),
            ],
        },
    );

    let mut chain = Vec::new();
    if config.codec == VideoCodec::H264 {
        match config.hw_accel {
            HardwareAccel::Nvenc => chain.push(nvenc),
            HardwareAccel::Qsv => chain.push(qsv),
            HardwareAccel::Vaapi => chain.push(vaapi),
            HardwareAccel::Amf => chain.push(amf),
            HardwareAccel::None => {}
        }
    }
    chain.push(software);
    chain
}

/// Scan an Annex B access unit for an IDR NAL (type 5).
pub fn contains_idr(data: &[u8]) -> bool {
    let mut i = 0usize;
    while i + 4 < data.len() {
        if data[i..i + 3] == [0, 0, 1] || data[i..i + 4] == [0, 0, 0, 1] {
            let offset = if data[i..i + 3] == [0, 0, 1] { 3 } else { 4 };
            if i + offset < data.len() {
                let nal_type = data[i + offset] & 0x1F;
                if nal_type == 5 {
                    return true;
                }
            }
            i += offset;
        } else {
            i += 1;
        }
    }
    false
}

/// FFmpeg-backed video encoder with the chain/fallback policy.
pub struct VideoEncoder {
    config: VideoEncoderConfig,
    encoder: Option<FfVideoEncoder>,
    codec_name: String,
    state: EncoderState,
    time_base: TimeBase,
    /// Set by `request_keyframe`; swap-consumed at the next encode, which
    /// makes repeated requests within one frame interval idempotent.
    force_keyframe: Arc<AtomicBool>,
    /// Bitrate waiting for the next keyframe boundary.
    pending_bitrate: Option<u32>,
    frames_since_keyframe: u32,
    hw_fallback_done: bool,
    frames_encoded: u64,
}

// The codec context is owned exclusively by this wrapper; it moves between
// threads but is never shared.
unsafe impl Send for VideoEncoder {}

impl VideoEncoder {
    pub fn new(config: VideoEncoderConfig) -> Result<Self> {
        super::ensure_codec_init();
        if config.b_frames != 0 {
            return Err(Error::config("b_frames must be 0 for low-latency streaming"));
        }
        let mut this = Self {
            config,
            encoder: None,
            codec_name: String::new(),
            state: EncoderState::Uninitialized,
            time_base: TimeBase::new(1, 1_000_000),
            force_keyframe: Arc::new(AtomicBool::new(false)),
            pending_bitrate: None,
            frames_since_keyframe: 0,
            hw_fallback_done: false,
            frames_encoded: 0,
        };
        this.build_encoder(false)?;
        this.state = EncoderState::Ready;
        Ok(this)
    }

    fn build_encoder(&mut self, software_only: bool) -> Result<()> {
        let pixel_format = video::frame::get_pixel_format("yuv420p");
        let width = self.config.width as usize;
        let height = self.config.height as usize;

        let chain = candidate_chain(&self.config);
        let candidates =
            chain.iter().filter(|(name, _)| !software_only || !is_hardware_codec(name));

        for (name, options) in candidates {
            let mut builder = match FfVideoEncoder::builder(name) {
                Ok(b) => b,
                Err(err) => {
                    debug!("encoder {name} unavailable: {err}");
                    continue;
                }
            };
            builder = builder
                .pixel_format(pixel_format)
                .width(width)
                .height(height)
                .time_base(self.time_base);
            for (key, value) in options {
                builder = builder.set_option(key.as_str(), value.as_str());
            }
            match builder.build() {
                Ok(encoder) => {
                    info!("video encoder: {name} ({}x{})", width, height);
                    self.encoder = Some(encoder);
                    self.codec_name = name.to_string();
                    return Ok(());
                }
                Err(err) => {
                    debug!("encoder {name} failed to initialize: {err}");
                }
            }
        }
        Err(Error::initialization("no usable video encoder found"))
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    /// Handle other stages use to force a keyframe without holding the
    /// encoder itself.
    pub fn keyframe_handle(&self) -> Arc<AtomicBool> {
        self.force_keyframe.clone()
    }

    /// Force the next frame to be a keyframe. Idempotent until consumed.
    pub fn request_keyframe(&self) {
        self.force_keyframe.store(true, Ordering::Release);
        // State reflects the pending request only between frames.
    }

    /// Change the target bitrate. Applied at the next keyframe boundary so
    /// the stream stays continuous; never later than `gop_size` frames.
    pub fn set_bitrate(&mut self, bitrate_bps: u32) {
        self.pending_bitrate = Some(bitrate_bps);
    }

    /// Encode one raw frame. Output PTS equals input PTS exactly.
    pub fn encode(&mut self, frame: &RawVideoFrame) -> Result<Vec<EncodedVideoFrame>> {
        match self.state {
            EncoderState::Ready | EncoderState::Encoding | EncoderState::KeyframePending => {}
            other => return Err(Error::codec(format!("encode in state {other:?}"))),
        }

        let force_idr = self.force_keyframe.swap(false, Ordering::AcqRel)
            || self.frames_since_keyframe >= self.config.gop_size
            || self.frames_encoded == 0;

        // A pending bitrate change lands together with a keyframe.
        if force_idr && let Some(bitrate) = self.pending_bitrate.take() {
            self.config.bitrate_bps = bitrate;
            self.build_encoder(self.hw_fallback_done)?;
            info!("video encoder: bitrate now {} bps", bitrate);
        }

        self.state =
            if force_idr { EncoderState::KeyframePending } else { EncoderState::Encoding };

        match self.encode_inner(frame, force_idr) {
            Ok(frames) => {
                self.state = EncoderState::Encoding;
                Ok(frames)
            }
            Err(err) => {
                if is_hardware_codec(&self.codec_name) && !self.hw_fallback_done {
                    warn!(
                        "hardware encoder {} failed ({err}), falling back to software",
                        self.codec_name
                    );
                    self.hw_fallback_done = true;
                    self.build_encoder(true)?;
                    self.force_keyframe.store(true, Ordering::Release);
                    self.state = EncoderState::Encoding;
                    return self.encode(frame);
                }
                Err(Error::codec(format!("encoding failed: {err}")))
            }
        }
    }

    fn encode_inner(&mut self, frame: &RawVideoFrame, force_idr: bool) -> Result<Vec<EncodedVideoFrame>> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| Error::codec("encoder not initialized"))?;

        let mut ff_frame = video::VideoFrameMut::black(
            video::frame::get_pixel_format("yuv420p"),
            self.config.width as usize,
            self.config.height as usize,
        );
        write_yuv420p(&mut ff_frame, frame, self.config.width, self.config.height)?;

        let mut ff_frame = ff_frame
            .with_time_base(self.time_base)
            .with_pts(FfTimestamp::new(frame.pts.as_micros(), self.time_base));
        if force_idr {
            ff_frame = ff_frame.with_picture_type(video::frame::PictureType::I);
        }

        encoder
            .push(ff_frame.freeze())
            .map_err(|err| Error::codec(format!("encoder push: {err}")))?;

        let mut out = Vec::new();
        while let Some(packet) = encoder
            .take()
            .map_err(|err| Error::codec(format!("encoder take: {err}")))?
        {
            let data = Bytes::copy_from_slice(packet.data());
            let keyframe = contains_idr(&data);
            if keyframe {
                self.frames_since_keyframe = 0;
            } else {
                self.frames_since_keyframe += 1;
            }
            self.frames_encoded += 1;
            out.push(EncodedVideoFrame {
                data,
                pts: frame.pts,
                dts: frame.pts,
                keyframe,
                codec: self.config.codec,
            });
        }
        Ok(out)
    }

    /// Drain buffered frames and close the encoder.
    pub fn flush(&mut self) -> Result<Vec<EncodedVideoFrame>> {
        self.state = EncoderState::Flushing;
        let mut out = Vec::new();
        if let Some(encoder) = self.encoder.as_mut() {
            let last_pts = Timestamp::ZERO;
            if encoder.flush().is_ok() {
                while let Ok(Some(packet)) = encoder.take() {
                    let data = Bytes::copy_from_slice(packet.data());
                    let keyframe = contains_idr(&data);
                    out.push(EncodedVideoFrame {
                        data,
                        pts: last_pts,
                        dts: last_pts,
                        keyframe,
                        codec: self.config.codec,
                    });
                }
            }
        }
        self.encoder = None;
        self.state = EncoderState::Closed;
        Ok(out)
    }

    /// Reconfigure geometry (resolution change). Forces a keyframe.
    pub fn reconfigure(&mut self, width: u32, height: u32) -> Result<()> {
        self.config.width = width;
        self.config.height = height;
        self.build_encoder(self.hw_fallback_done)?;
        self.frames_since_keyframe = 0;
        self.force_keyframe.store(true, Ordering::Release);
        Ok(())
    }
}

fn is_hardware_codec(name: &str) -> bool {
    name.contains("nvenc") || name.contains("qsv") || name.contains("vaapi") || name.contains("amf")
}

/// Convert a raw frame into the encoder's yuv420p planes.
///
/// Packed RGB inputs go through a BT.601 conversion; planar inputs are
/// copied with stride handling.
fn write_yuv420p(
    dst: &mut video::VideoFrameMut,
    src: &RawVideoFrame,
    width: u32,
    height: u32,
) -> Result<()> {
    if src.width != width || src.height != height {
        return Err(Error::codec(format!(
            "frame geometry {}x{} does not match encoder {}x{}",
            src.width, src.height, width, height
        )));
    }
    let (w, h) = (width as usize, height as usize);

    match src.format {
        PixelFormat::Bgra32 | PixelFormat::Rgba32 | PixelFormat::Bgr24 | PixelFormat::Rgb24 => {
            let bpp = src.format.packed_bpp().unwrap();
            let (r_off, g_off, b_off) = match src.format {
                PixelFormat::Rgb24 | PixelFormat::Rgba32 => (0, 1, 2),
                _ => (2, 1, 0),
            };
            let stride = src.stride as usize;
            if src.data.len() < stride * h {
                return Err(Error::codec("raw frame buffer too small for its geometry"));
            }

            // Luma plane, full resolution.
            {
                let mut planes = dst.planes_mut();
                let y_plane = planes[0].data_mut();
                let y_stride = y_plane.len() / h;
                for row in 0..h {
                    for col in 0..w {
                        let p = row * stride + col * bpp;
                        let (r, g, b) =
                            (src.data[p + r_off] as f32, src.data[p + g_off] as f32, src.data[p + b_off] as f32);
                        let y = 16.0 + 0.257 * r + 0.504 * g + 0.098 * b;
                        y_plane[row * y_stride + col] = y as u8;
                    }
                }
            }
            // Chroma planes, quarter resolution, sampled at even pixels.
            for (plane_idx, is_u) in [(1usize, true), (2usize, false)] {
                let mut planes = dst.planes_mut();
                let c_plane = planes[plane_idx].data_mut();
                let c_stride = c_plane.len() / h.div_ceil(2);
                for row in (0..h).step_by(2) {
                    for col in (0..w).step_by(2) {
                        let p = row * stride + col * bpp;
                        let (r, g, b) =
                            (src.data[p + r_off] as f32, src.data[p + g_off] as f32, src.data[p + b_off] as f32);
                        let value = if is_u {
                            128.0 - 0.148 * r - 0.291 * g + 0.439 * b
                        } else {
                            128.0 + 0.439 * r - 0.368 * g - 0.071 * b
                        };
                        c_plane[(row / 2) * c_stride + col / 2] = value as u8;
                    }
                }
            }
        }
        PixelFormat::Yuv420p => {
            let y_size = w * h;
            let c_size = (w / 2) * (h / 2);
            if src.data.len() < y_size + 2 * c_size {
                return Err(Error::codec("yuv420p frame buffer too small"));
            }
            copy_plane(dst, 0, &src.data[..y_size], w, h);
            copy_plane(dst, 1, &src.data[y_size..y_size + c_size], w / 2, h / 2);
            copy_plane(dst, 2, &src.data[y_size + c_size..y_size + 2 * c_size], w / 2, h / 2);
        }
        PixelFormat::Nv12 => {
            let y_size = w * h;
            let uv_size = w * (h / 2);
            if src.data.len() < y_size + uv_size {
                return Err(Error::codec("nv12 frame buffer too small"));
            }
            copy_plane(dst, 0, &src.data[..y_size], w, h);
            // Deinterleave UV into separate planes.
            let uv = &src.data[y_size..y_size + uv_size];
            let mut planes = dst.planes_mut();
            let u_stride = planes[1].data_mut().len() / (h / 2);
            for row in 0..h / 2 {
                for col in 0..w / 2 {
                    planes[1].data_mut()[row * u_stride + col] = uv[row * w + col * 2];
                }
            }
            let v_stride = planes[2].data_mut().len() / (h / 2);
            for row in 0..h / 2 {
                for col in 0..w / 2 {
                    planes[2].data_mut()[row * v_stride + col] = uv[row * w + col * 2 + 1];
                }
            }
        }
        PixelFormat::Yuv444p => {
            // 4:4:4 input downsamples chroma 2x2 by point sampling.
            let plane = w * h;
            if src.data.len() < plane * 3 {
                return Err(Error::codec("yuv444p frame buffer too small"));
            }
            copy_plane(dst, 0, &src.data[..plane], w, h);
            for (idx, offset) in [(1usize, plane), (2usize, plane * 2)] {
                let chroma = &src.data[offset..offset + plane];
                let mut planes = dst.planes_mut();
                let stride = planes[idx].data_mut().len() / (h / 2);
                for row in (0..h).step_by(2) {
                    for col in (0..w).step_by(2) {
                        planes[idx].data_mut()[(row / 2) * stride + col / 2] = chroma[row * w + col];
                    }
                }
            }
        }
    }
    Ok(())
}

fn copy_plane(dst: &mut video::VideoFrameMut, plane: usize, src: &[u8], width: usize, rows: usize) {
    let mut planes = dst.planes_mut();
    let data = planes[plane].data_mut();
    let stride = data.len() / rows;
    if stride == width {
        data[..width * rows].copy_from_slice(&src[..width * rows]);
        return;
    }
    for row in 0..rows {
        data[row * stride..row * stride + width]
            .copy_from_slice(&src[row * width..(row + 1) * width]);
    }
}
