//! Receiver-side decoders and audio playout primitives.

pub mod audio;
pub mod video;

pub use audio::{AudioDecoder, AudioPlayoutQueue, AudioSink};
pub use video::{DecodedVideoFrame, VideoDecoder};
