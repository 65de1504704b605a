//! Transport boundary.
//!
//! The real datagram transport (DTLS/SCTP, QUIC, whatever carries the
//! session) lives outside this crate; the pipeline only depends on the
//! [`MediaTransport`] trait and the wire envelope in [`envelope`]. The
//! contract: PTS values are preserved exactly, receive order may differ
//! from send order, delivery is lossy, and per-stream sequence numbers make
//! loss observable. An in-memory implementation backs tests and loopback
//! runs.

pub mod envelope;

use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::control::ControlMessage;
use crate::error::{Error, Result};
use crate::pipeline::types::SyncedFrames;

pub use envelope::{MediaPacket, PacketFramer, SequenceTracker};

/// Connection lifecycle as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Counters the adaptive buffer and control plane read each tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub bytes_sent: u64,
    pub rtt_ms: f64,
}

/// Inbound traffic handed to the receiver pipeline.
#[derive(Debug)]
pub enum TransportEvent {
    Media(MediaPacket),
    /// Control text plus the sending peer's identity.
    Control { peer: String, text: String },
    StateChanged(ConnectionState),
}

/// Sending half of the session transport.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Ship one synchronized tuple as its wire packets.
    async fn send_synced(&self, frames: &SyncedFrames) -> Result<()>;

    /// Ship a control message on the control channel.
    async fn send_control(&self, msg: &ControlMessage) -> Result<()>;

    fn connection_state(&self) -> ConnectionState;

    fn stats(&self) -> TransportStats;

    /// Close the session. Idempotent.
    fn close(&self);
}

/// In-memory duplex transport: the sender half frames tuples into packets
/// and pushes them to the paired receiver's event channel.
pub struct ChannelTransport {
    peer_id: String,
    framer: Mutex<PacketFramer>,
    events: mpsc::Sender<TransportEvent>,
    state: Mutex<ConnectionState>,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl ChannelTransport {
    /// Build a connected pair: the transport handle and the stream of
    /// events a receiver pipeline consumes.
    pub fn pair(peer_id: &str, depth: usize) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(depth);
        let transport = Self {
            peer_id: peer_id.to_string(),
            framer: Mutex::new(PacketFramer::new()),
            events: tx,
            state: Mutex::new(ConnectionState::Connected),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        };
        (transport, rx)
    }

    /// Install the codec configuration for the next epoch (see
    /// [`PacketFramer::set_codec_config`]).
    pub fn set_codec_config(&self, config: bytes::Bytes) {
        self.framer.lock().unwrap().set_codec_config(config);
    }
}

#[async_trait]
impl MediaTransport for ChannelTransport {
    async fn send_synced(&self, frames: &SyncedFrames) -> Result<()> {
        if self.connection_state() != ConnectionState::Connected {
            return Err(Error::transient_io("transport not connected"));
        }
        let packets = self.framer.lock().unwrap().frame(frames);
        for packet in packets {
            self.bytes_sent.fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
            self.packets_sent.fetch_add(1, Ordering::Relaxed);
            self.events
                .send(TransportEvent::Media(packet))
                .await
                .map_err(|_| Error::transient_io("transport channel closed"))?;
        }
        Ok(())
    }

    async fn send_control(&self, msg: &ControlMessage) -> Result<()> {
        let text = msg.to_json()?;
        self.events
            .send(TransportEvent::Control { peer: self.peer_id.clone(), text })
            .await
            .map_err(|_| Error::transient_io("transport channel closed"))
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            ..Default::default()
        }
    }

    fn close(&self) {
        *self.state.lock().unwrap() = ConnectionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{EncodedAudioFrame, StreamKind, Timestamp};
    use bytes::Bytes;

    #[tokio::test]
    async fn test_pair_delivers_media() {
        let (transport, mut rx) = ChannelTransport::pair("peer", 16);
        let tuple = SyncedFrames {
            audio: Some(EncodedAudioFrame {
                data: Bytes::from_static(b"opus"),
                pts: Timestamp::from_micros(20_000),
            }),
            presentation_time: Timestamp::from_micros(20_000),
            ..Default::default()
        };

        transport.send_synced(&tuple).await.unwrap();
        match rx.recv().await.unwrap() {
            TransportEvent::Media(packet) => {
                assert_eq!(packet.stream, StreamKind::Audio);
                assert_eq!(packet.pts.as_micros(), 20_000);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(transport.stats().packets_sent, 1);
    }

    #[tokio::test]
    async fn test_control_carries_peer_identity() {
        let (transport, mut rx) = ChannelTransport::pair("peer-1", 4);
        let msg = ControlMessage::new("ping", Some(1), None);
        transport.send_control(&msg).await.unwrap();

        match rx.recv().await.unwrap() {
            TransportEvent::Control { peer, text } => {
                assert_eq!(peer, "peer-1");
                assert!(text.contains("\"ping\""));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_fails_after_close() {
        let (transport, _rx) = ChannelTransport::pair("peer", 4);
        transport.close();
        let tuple = SyncedFrames {
            audio: Some(EncodedAudioFrame { data: Bytes::new(), pts: Timestamp::ZERO }),
            ..Default::default()
        };
        assert!(transport.send_synced(&tuple).await.is_err());
        assert_eq!(transport.connection_state(), ConnectionState::Closed);
    }
}
