//! Control plane: runtime parameter changes carried over the transport's
//! control channel.
//!
//! Messages are JSON text objects `{type, sequence?, timestamp, payload?}`
//! no larger than 64 KiB. Every inbound message is checked against the one
//! peer authorized at session start; anything else is dropped without a
//! reply. Valid messages become [`PipelineCommand`]s for the sender
//! coordinator to apply.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::error::{Error, Result};

/// Upper bound on a serialized control message.
pub const MAX_CONTROL_MESSAGE_BYTES: usize = 64 * 1024;

/// Resolution bounds accepted from the wire.
pub const MIN_DIMENSION: u32 = 64;
pub const MAX_WIDTH: u32 = 7680;
pub const MAX_HEIGHT: u32 = 4320;
/// Bitrate bounds in bits per second.
pub const MIN_BITRATE: u32 = 100_000;
pub const MAX_BITRATE: u32 = 100_000_000;

/// Quality presets mapping to (width, height, bitrate, fps).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    #[default]
    Auto,
    Low,
    Medium,
    High,
    Ultra,
}

impl QualityPreset {
    /// Concrete stream parameters for a preset; `None` for `Auto`.
    pub fn parameters(&self) -> Option<(u32, u32, u32, u32)> {
        match self {
            QualityPreset::Auto => None,
            QualityPreset::Low => Some((1280, 720, 2_000_000, 30)),
            QualityPreset::Medium => Some((1920, 1080, 5_000_000, 30)),
            QualityPreset::High => Some((1920, 1080, 10_000_000, 60)),
            QualityPreset::Ultra => Some((3840, 2160, 20_000_000, 60)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityPreset::Auto => "auto",
            QualityPreset::Low => "low",
            QualityPreset::Medium => "medium",
            QualityPreset::High => "high",
            QualityPreset::Ultra => "ultra",
        }
    }
}

impl std::str::FromStr for QualityPreset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(QualityPreset::Auto),
            "low" => Ok(QualityPreset::Low),
            "medium" => Ok(QualityPreset::Medium),
            "high" => Ok(QualityPreset::High),
            "ultra" => Ok(QualityPreset::Ultra),
            other => Err(Error::config(format!(
                "quality must be one of auto/low/medium/high/ultra, got '{other}'"
            ))),
        }
    }
}

/// Payload variants, selected by the message `type` tag.
///
/// Deserialization is untagged, so variants are ordered most-specific
/// first: `State` carries a superset of `Resolution`/`Bitrate` fields and
/// must be tried before them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlPayload {
    State { paused: bool, width: u32, height: u32, bitrate: u32, fps: u32 },
    Resolution { width: u32, height: u32 },
    Bitrate { bitrate: u32 },
    Quality { preset: QualityPreset },
    Monitor { id: i32 },
    Pong { echo_sequence: u64 },
    Error { message: String },
}

/// A control-channel message as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Sender's wall-clock milliseconds; informational only.
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<ControlPayload>,
}

impl ControlMessage {
    pub fn new(kind: &str, sequence: Option<u64>, payload: Option<ControlPayload>) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self { kind: kind.to_string(), sequence, timestamp, payload }
    }

    pub fn to_json(&self) -> Result<String> {
        let text = serde_json::to_string(self)?;
        if text.len() > MAX_CONTROL_MESSAGE_BYTES {
            return Err(Error::invariant("control message exceeds 64 KiB"));
        }
        Ok(text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        if text.len() > MAX_CONTROL_MESSAGE_BYTES {
            return Err(Error::invariant("control message exceeds 64 KiB"));
        }
        Ok(serde_json::from_str(text)?)
    }
}

/// Effect of an accepted control message on the sender pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineCommand {
    Pause,
    /// Resume also forces the next video frame to a keyframe.
    Resume,
    SetResolution { width: u32, height: u32 },
    SetBitrate { bitrate: u32 },
    SetQuality { preset: QualityPreset },
    SelectMonitor { id: i32 },
    RequestKeyframe,
}

impl PipelineCommand {
    /// Whether applying this command must force a keyframe so the receiver
    /// can re-synchronize its decoder.
    pub fn forces_keyframe(&self) -> bool {
        match self {
            PipelineCommand::Resume
            | PipelineCommand::SetResolution { .. }
            | PipelineCommand::SelectMonitor { .. }
            | PipelineCommand::RequestKeyframe => true,
            // A quality change only reconfigures the stream when the preset
            // maps to concrete parameters; `Auto` changes nothing and must
            // not cost an IDR frame.
            PipelineCommand::SetQuality { preset } => preset.parameters().is_some(),
            PipelineCommand::Pause | PipelineCommand::SetBitrate { .. } => false,
        }
    }
}

/// What the control plane decided about one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlAction {
    /// Apply this command to the pipeline.
    Command(PipelineCommand),
    /// Send this reply back to the peer.
    Reply(ControlMessage),
    /// Message handled internally (e.g. pong matched to a ping).
    Handled,
    /// Message ignored (unauthorized peer or unknown type).
    Ignored,
}

/// Per-session control state: authorization, ping bookkeeping.
pub struct ControlPlane {
    authorized_peer: String,
    ping_sequence: u64,
    last_ping: Option<(u64, Instant)>,
    rtt_ms: f64,
}

impl ControlPlane {
    /// The authorized peer identity is fixed when the session starts.
    pub fn new(authorized_peer: impl Into<String>) -> Self {
        Self {
            authorized_peer: authorized_peer.into(),
            ping_sequence: 0,
            last_ping: None,
            rtt_ms: 0.0,
        }
    }

    pub fn authorized_peer(&self) -> &str {
        &self.authorized_peer
    }

    pub fn rtt_ms(&self) -> f64 {
        self.rtt_ms
    }

    /// Build the next outbound ping.
    pub fn make_ping(&mut self) -> ControlMessage {
        self.ping_sequence += 1;
        self.last_ping = Some((self.ping_sequence, Instant::now()));
        ControlMessage::new("ping", Some(self.ping_sequence), None)
    }

    /// Validate, authorize, and translate one inbound message.
    ///
    /// Messages from any peer other than the authorized one are silently
    /// dropped: no reply, no state change, a debug line only.
    pub fn process(&mut self, sender_peer: &str, raw: &str) -> ControlAction {
        if sender_peer != self.authorized_peer {
            debug!("control: dropping message from unauthorized peer '{sender_peer}'");
            return ControlAction::Ignored;
        }

        let msg = match ControlMessage::from_json(raw) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("control: rejected malformed message: {err}");
                return ControlAction::Ignored;
            }
        };

        match self.dispatch(&msg) {
            Ok(action) => action,
            Err(err) => {
                warn!("control: rejected '{}' message: {err}", msg.kind);
                ControlAction::Reply(ControlMessage::new(
                    "error",
                    None,
                    Some(ControlPayload::Error { message: err.to_string() }),
                ))
            }
        }
    }

    fn dispatch(&mut self, msg: &ControlMessage) -> Result<ControlAction> {
        let action = match msg.kind.as_str() {
            "pause" => ControlAction::Command(PipelineCommand::Pause),
            "resume" => ControlAction::Command(PipelineCommand::Resume),
            "request_keyframe" => ControlAction::Command(PipelineCommand::RequestKeyframe),
            "set_resolution" => {
                let Some(&ControlPayload::Resolution { width, height }) = msg.payload.as_ref() else {
                    return Err(Error::config("set_resolution requires {width, height}"));
                };
                if !(MIN_DIMENSION..=MAX_WIDTH).contains(&width) {
                    return Err(Error::config(format!(
                        "width out of range ({MIN_DIMENSION} to {MAX_WIDTH}): {width}"
                    )));
                }
                if !(MIN_DIMENSION..=MAX_HEIGHT).contains(&height) {
                    return Err(Error::config(format!(
                        "height out of range ({MIN_DIMENSION} to {MAX_HEIGHT}): {height}"
                    )));
                }
                ControlAction::Command(PipelineCommand::SetResolution { width, height })
            }
            "set_bitrate" => {
                let Some(&ControlPayload::Bitrate { bitrate }) = msg.payload.as_ref() else {
                    return Err(Error::config("set_bitrate requires {bitrate}"));
                };
                if !(MIN_BITRATE..=MAX_BITRATE).contains(&bitrate) {
                    return Err(Error::config(format!(
                        "bitrate out of range ({MIN_BITRATE} to {MAX_BITRATE}): {bitrate}"
                    )));
                }
                ControlAction::Command(PipelineCommand::SetBitrate { bitrate })
            }
            "set_quality" => {
                let Some(&ControlPayload::Quality { preset }) = msg.payload.as_ref() else {
                    return Err(Error::config("set_quality requires {preset}"));
                };
                ControlAction::Command(PipelineCommand::SetQuality { preset })
            }
            "select_monitor" => {
                let Some(&ControlPayload::Monitor { id }) = msg.payload.as_ref() else {
                    return Err(Error::config("select_monitor requires {id}"));
                };
                if !(-1..=255).contains(&id) {
                    return Err(Error::config(format!("monitor id out of range (-1 to 255): {id}")));
                }
                ControlAction::Command(PipelineCommand::SelectMonitor { id })
            }
            "ping" => ControlAction::Reply(ControlMessage::new(
                "pong",
                msg.sequence,
                Some(ControlPayload::Pong { echo_sequence: msg.sequence.unwrap_or(0) }),
            )),
            "pong" => {
                if let Some(&ControlPayload::Pong { echo_sequence }) = msg.payload.as_ref()
                    && let Some((seq, sent_at)) = self.last_ping
                    && echo_sequence == seq
                {
                    self.rtt_ms = sent_at.elapsed().as_secs_f64() * 1_000.0;
                }
                ControlAction::Handled
            }
            "state" | "error" => ControlAction::Handled,
            other => {
                debug!("control: unknown message type '{other}'");
                ControlAction::Ignored
            }
        };
        Ok(action)
    }

    /// Outbound state report.
    pub fn make_state(
        &self,
        paused: bool,
        width: u32,
        height: u32,
        bitrate: u32,
        fps: u32,
    ) -> ControlMessage {
        ControlMessage::new(
            "state",
            None,
            Some(ControlPayload::State { paused, width, height, bitrate, fps }),
        )
    }

    /// Outbound error report.
    pub fn make_error(&self, message: impl Into<String>) -> ControlMessage {
        ControlMessage::new("error", None, Some(ControlPayload::Error { message: message.into() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(kind: &str, payload: &str) -> String {
        if payload.is_empty() {
            format!(r#"{{"type":"{kind}","timestamp":0}}"#)
        } else {
            format!(r#"{{"type":"{kind}","timestamp":0,"payload":{payload}}}"#)
        }
    }

    #[test]
    fn test_unauthorized_peer_silently_dropped() {
        let mut plane = ControlPlane::new("peer-1");
        let msg = raw("pause", "");

        assert_eq!(plane.process("peer-2", &msg), ControlAction::Ignored);
        // The identical message from the authorized peer is applied.
        assert_eq!(
            plane.process("peer-1", &msg),
            ControlAction::Command(PipelineCommand::Pause)
        );
    }

    #[test]
    fn test_resolution_bounds() {
        let mut plane = ControlPlane::new("p");

        let ok = raw("set_resolution", r#"{"width":1920,"height":1080}"#);
        assert_eq!(
            plane.process("p", &ok),
            ControlAction::Command(PipelineCommand::SetResolution { width: 1920, height: 1080 })
        );

        let too_small = raw("set_resolution", r#"{"width":32,"height":1080}"#);
        assert!(matches!(plane.process("p", &too_small), ControlAction::Reply(m) if m.kind == "error"));

        let too_big = raw("set_resolution", r#"{"width":1920,"height":9000}"#);
        assert!(matches!(plane.process("p", &too_big), ControlAction::Reply(m) if m.kind == "error"));
    }

    #[test]
    fn test_bitrate_bounds() {
        let mut plane = ControlPlane::new("p");
        let low = raw("set_bitrate", r#"{"bitrate":50000}"#);
        assert!(matches!(plane.process("p", &low), ControlAction::Reply(m) if m.kind == "error"));

        let ok = raw("set_bitrate", r#"{"bitrate":5000000}"#);
        assert_eq!(
            plane.process("p", &ok),
            ControlAction::Command(PipelineCommand::SetBitrate { bitrate: 5_000_000 })
        );
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let mut plane = ControlPlane::new("p");
        let ping = r#"{"type":"ping","sequence":7,"timestamp":0}"#;
        match plane.process("p", ping) {
            ControlAction::Reply(reply) => {
                assert_eq!(reply.kind, "pong");
                assert_eq!(reply.payload, Some(ControlPayload::Pong { echo_sequence: 7 }));
            }
            other => panic!("expected pong reply, got {other:?}"),
        }
    }

    #[test]
    fn test_pong_updates_rtt() {
        let mut plane = ControlPlane::new("p");
        let ping = plane.make_ping();
        let seq = ping.sequence.unwrap();

        let pong = format!(
            r#"{{"type":"pong","timestamp":0,"payload":{{"echo_sequence":{seq}}}}}"#
        );
        assert_eq!(plane.process("p", &pong), ControlAction::Handled);
        assert!(plane.rtt_ms() >= 0.0);
    }

    #[test]
    fn test_quality_preset_table() {
        assert_eq!(QualityPreset::Low.parameters(), Some((1280, 720, 2_000_000, 30)));
        assert_eq!(QualityPreset::Ultra.parameters(), Some((3840, 2160, 20_000_000, 60)));
        assert_eq!(QualityPreset::Auto.parameters(), None);
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut plane = ControlPlane::new("p");
        let huge = format!(
            r#"{{"type":"pause","timestamp":0,"junk":"{}"}}"#,
            "x".repeat(MAX_CONTROL_MESSAGE_BYTES)
        );
        assert_eq!(plane.process("p", &huge), ControlAction::Ignored);
    }

    #[test]
    fn test_keyframe_forcing_commands() {
        assert!(PipelineCommand::Resume.forces_keyframe());
        assert!(PipelineCommand::SetResolution { width: 640, height: 480 }.forces_keyframe());
        assert!(PipelineCommand::SelectMonitor { id: 1 }.forces_keyframe());
        assert!(PipelineCommand::RequestKeyframe.forces_keyframe());
        assert!(!PipelineCommand::Pause.forces_keyframe());
        assert!(!PipelineCommand::SetBitrate { bitrate: 1_000_000 }.forces_keyframe());
        // A concrete preset reconfigures the stream; Auto is a no-op and
        // must not force anything.
        assert!(PipelineCommand::SetQuality { preset: QualityPreset::High }.forces_keyframe());
        assert!(!PipelineCommand::SetQuality { preset: QualityPreset::Auto }.forces_keyframe());
    }

    #[test]
    fn test_message_round_trip() {
        let msg = ControlMessage::new(
            "set_resolution",
            Some(3),
            Some(ControlPayload::Resolution { width: 1280, height: 720 }),
        );
        let json = msg.to_json().unwrap();
        let back = ControlMessage::from_json(&json).unwrap();
        assert_eq!(msg, back);
    }
}
