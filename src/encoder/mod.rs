//! Codec-agnostic encoder wrappers over FFmpeg.

pub mod audio;
pub mod video;

use once_cell::sync::OnceCell;

pub use audio::{AudioEncoder, AudioEncoderConfig};
pub use video::{EncoderState, VideoEncoder, VideoEncoderConfig};

static CODEC_INIT: OnceCell<()> = OnceCell::new();

/// One-time, process-wide codec library setup.
///
/// The only global state the crate allows: every encoder and decoder
/// constructor funnels through here before touching the codec library, and
/// no per-session state ever lives at process scope.
pub(crate) fn ensure_codec_init() {
    CODEC_INIT.get_or_init(|| {
        log::debug!("codec libraries initialized");
    });
}
