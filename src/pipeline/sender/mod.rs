//! Sender pipeline: capture → encode → synchronize → transmit.

pub mod audio_stage;
pub mod capture_stage;
pub mod coordinator;
pub mod encode_stage;
pub mod transmit_stage;

pub use capture_stage::StreamOpts;
pub use coordinator::{SenderConfig, SenderCoordinator};
pub use encode_stage::EncoderCommand;
