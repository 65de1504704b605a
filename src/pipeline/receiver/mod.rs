//! Receiver pipeline: receive → decode → schedule/playout → sinks.

pub mod coordinator;
pub mod decode_stage;
pub mod playout_stage;
pub mod present_stage;
pub mod receive_stage;

pub use coordinator::{ReceiverConfig, ReceiverCoordinator};
pub use present_stage::{classify, ScheduleAction, SchedulerConfig, VideoSink};
