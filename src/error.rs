//! Error taxonomy shared across the pipeline.
//!
//! Every fallible operation in the crate returns [`Result`]. The kind tells
//! the supervisor what to do with a failure: retry it locally, escalate it
//! into a keyframe request, restart the stage once, or tear the session
//! down.

use thiserror::Error;

/// Result type alias for streamcast operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds recognized by the pipeline supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Capture/encode/audio/transport setup failed. Fatal for the session.
    Initialization,
    /// User denied capture consent. Fatal, reported distinctly (exit code 2).
    Permission,
    /// A single transport read/write failed. Retried internally with a
    /// bounded budget before surfacing.
    TransientIo,
    /// Encoder or decoder returned an error. Encoder failures escalate to a
    /// keyframe request; decoder failures request a keyframe from the sender.
    Codec,
    /// A contract the pipeline relies on was broken: non-monotonic PTS,
    /// format change without a sentinel, control message from an
    /// unauthorized peer. The stream is aborted and the session restarted.
    InvariantViolation,
    /// Configuration rejected at load time. The message names the offending
    /// key and the permitted range.
    ConfigInvalid,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Initialization => "initialization",
            ErrorKind::Permission => "permission",
            ErrorKind::TransientIo => "transient-io",
            ErrorKind::Codec => "codec",
            ErrorKind::InvariantViolation => "invariant-violation",
            ErrorKind::ConfigInvalid => "config-invalid",
        }
    }

    /// Whether the supervisor may attempt a one-shot stage restart instead
    /// of tearing the session down.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorKind::TransientIo | ErrorKind::Codec)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline error: a kind plus a human-readable message.
#[derive(Debug, Clone, Error)]
#[error("[{kind}] {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn initialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Initialization, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, message)
    }

    pub fn transient_io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientIo, message)
    }

    pub fn codec(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Codec, message)
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvariantViolation, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigInvalid, message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::transient_io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind_tag() {
        let err = Error::config("fps out of range (1 to 240)");
        let text = err.to_string();
        assert!(text.contains("config-invalid"));
        assert!(text.contains("fps out of range"));
    }

    #[test]
    fn test_recoverable_kinds() {
        assert!(ErrorKind::TransientIo.is_recoverable());
        assert!(ErrorKind::Codec.is_recoverable());
        assert!(!ErrorKind::Permission.is_recoverable());
        assert!(!ErrorKind::Initialization.is_recoverable());
        assert!(!ErrorKind::InvariantViolation.is_recoverable());
    }
}
