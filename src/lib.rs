//! streamcast: low-latency desktop A/V streaming core.
//!
//! The crate is organized around one sender pipeline and one receiver
//! pipeline:
//!
//! - Capture sources (behind traits in [`capture`]) produce timestamped raw
//!   frames.
//! - [`encoder`] wraps FFmpeg codecs behind low-latency contracts.
//! - [`pipeline::sync`] pairs the two encoded streams into presentation-
//!   timestamped tuples with jitter compensation and drift tracking.
//! - [`transport`] defines the envelope that carries timed media and the
//!   session trait the pipeline sends through.
//! - On the receiving side, [`decoder`] and
//!   [`pipeline::receiver`] rebuild, schedule, and play the streams against
//!   a master clock with frame drop/repeat policy.
//! - [`control`] applies runtime parameter changes from the authorized
//!   peer.

pub mod capture;
pub mod cli;
pub mod config;
pub mod control;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod pipeline;
pub mod transport;

pub use error::{Error, ErrorKind, Result};
