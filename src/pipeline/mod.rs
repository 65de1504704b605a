//! Media pipeline: stages, clocks, queues, and the A/V synchronizer.
//!
//! The sender side is a DAG of tasks — screen capture and audio capture
//! feed their encoders, encoded streams meet in the synchronizer, and
//! synchronized tuples leave through the transport. The receiver mirrors
//! it: demux, decode, then presentation scheduling against a master clock.
//! Stages hand frames to each other through bounded queues with per-stream
//! overflow policy; the supervisor owns lifecycle and restart decisions.

pub mod clock;
pub mod handoff;
pub mod health;
pub mod jitter;
pub mod receiver;
pub mod sender;
pub mod stage;
pub mod state;
pub mod sync;
pub mod types;

pub use clock::{ClockSource, MasterClock, StreamClock};
pub use handoff::{BoundedHandoff, OverflowPolicy};
pub use health::{HealthSummary, PipelineHealth};
pub use stage::{PipelineStage, PipelineSupervisor};
pub use state::PipelineState;
pub use sync::{AvSynchronizer, SyncConfig, SyncStats};
pub use types::{
    EncodedAudioFrame, EncodedVideoFrame, RawAudioFrame, RawVideoFrame, StreamKind, SyncedFrames,
    Timestamp,
};
