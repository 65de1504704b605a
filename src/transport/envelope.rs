//! Wire envelope for timed media.
//!
//! Each encoded frame travels as one datagram-sized packet carrying the
//! fields the receiver cannot reconstruct: stream id, a per-stream 32-bit
//! sequence number, the PTS in microseconds (preserved exactly), and the
//! keyframe flag. Delivery may reorder or lose packets; sequence gaps are
//! how loss becomes visible.
//!
//! Video keyframe payloads are self-contained: the codec configuration
//! (H.264 SPS/PPS) is prepended in Annex B start-code form to the first
//! keyframe of every configuration epoch.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::pipeline::types::{
    EncodedAudioFrame, EncodedVideoFrame, StreamKind, SyncedFrames, Timestamp, VideoCodec,
};

/// Magic prefix of every media packet.
const PACKET_MAGIC: u16 = 0x53C0;
/// Current wire version.
const PACKET_VERSION: u8 = 1;
/// Fixed header size in bytes.
pub const PACKET_HEADER_SIZE: usize = 2 + 1 + 1 + 1 + 4 + 8 + 4;

const FLAG_KEYFRAME: u8 = 0b0000_0001;

/// Annex B start code used to delimit prepended parameter sets.
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// One media frame as it crosses the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPacket {
    pub stream: StreamKind,
    pub sequence: u32,
    pub pts: Timestamp,
    pub keyframe: bool,
    pub payload: Bytes,
}

impl MediaPacket {
    /// Serialize header + payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + self.payload.len());
        buf.put_u16(PACKET_MAGIC);
        buf.put_u8(PACKET_VERSION);
        buf.put_u8(self.stream.wire_id());
        buf.put_u8(if self.keyframe { FLAG_KEYFRAME } else { 0 });
        buf.put_u32(self.sequence);
        buf.put_i64(self.pts.as_micros());
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a packet produced by [`encode`](Self::encode).
    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.len() < PACKET_HEADER_SIZE {
            return Err(Error::transient_io(format!("short media packet: {} bytes", data.len())));
        }
        let magic = data.get_u16();
        if magic != PACKET_MAGIC {
            return Err(Error::invariant(format!("bad packet magic {magic:#06x}")));
        }
        let version = data.get_u8();
        if version != PACKET_VERSION {
            return Err(Error::invariant(format!("unsupported packet version {version}")));
        }
        let stream = StreamKind::from_wire_id(data.get_u8())
            .ok_or_else(|| Error::invariant("unknown stream id"))?;
        let flags = data.get_u8();
        let sequence = data.get_u32();
        let pts = Timestamp::from_micros(data.get_i64());
        let len = data.get_u32() as usize;
        if data.remaining() < len {
            return Err(Error::transient_io(format!(
                "truncated media packet: want {len}, have {}",
                data.remaining()
            )));
        }
        let payload = data.split_to(len);

        Ok(Self { stream, sequence, pts, keyframe: flags & FLAG_KEYFRAME != 0, payload })
    }
}

/// Scan an Annex B stream for SPS (7) or PPS (8) NAL units.
pub fn contains_parameter_sets(data: &[u8]) -> bool {
    let mut i = 0usize;
    while i + 4 < data.len() {
        if data[i..i + 4] == START_CODE {
            let nal_type = data[i + 4] & 0x1F;
            if nal_type == 7 || nal_type == 8 {
                return true;
            }
            i += 4;
        } else {
            i += 1;
        }
    }
    false
}

/// Splits synchronized tuples into wire packets, assigning per-stream
/// sequence numbers and prepending the codec configuration to the first
/// keyframe of each configuration epoch.
pub struct PacketFramer {
    video_seq: u32,
    audio_seq: u32,
    codec_config: Option<Bytes>,
    config_pending: bool,
}

impl PacketFramer {
    pub fn new() -> Self {
        Self { video_seq: 0, audio_seq: 0, codec_config: None, config_pending: false }
    }

    /// Install codec configuration (e.g. SPS/PPS) and open a new epoch: the
    /// next keyframe gets it prepended.
    pub fn set_codec_config(&mut self, config: Bytes) {
        self.codec_config = Some(config);
        self.config_pending = true;
    }

    /// Turn one tuple into zero, one, or two packets.
    pub fn frame(&mut self, tuple: &SyncedFrames) -> Vec<MediaPacket> {
        let mut packets = Vec::with_capacity(2);

        if let Some(video) = &tuple.video {
            let payload = if video.keyframe {
                self.keyframe_payload(video)
            } else {
                video.data.clone()
            };
            packets.push(MediaPacket {
                stream: StreamKind::Video,
                sequence: self.video_seq,
                pts: video.pts,
                keyframe: video.keyframe,
                payload,
            });
            self.video_seq = self.video_seq.wrapping_add(1);
        }

        if let Some(audio) = &tuple.audio {
            packets.push(MediaPacket {
                stream: StreamKind::Audio,
                sequence: self.audio_seq,
                pts: audio.pts,
                keyframe: false,
                payload: audio.data.clone(),
            });
            self.audio_seq = self.audio_seq.wrapping_add(1);
        }

        packets
    }

    fn keyframe_payload(&mut self, video: &EncodedVideoFrame) -> Bytes {
        // Encoders often emit SPS/PPS in-band already; only prepend when
        // the epoch's configuration has not gone out and the frame lacks it.
        if self.config_pending
            && let Some(config) = &self.codec_config
            && !contains_parameter_sets(&video.data)
        {
            let mut buf = BytesMut::with_capacity(config.len() + video.data.len());
            buf.extend_from_slice(config);
            buf.extend_from_slice(&video.data);
            self.config_pending = false;
            return buf.freeze();
        }
        self.config_pending = false;
        video.data.clone()
    }
}

impl Default for PacketFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-stream sequence bookkeeping on the receive side.
///
/// Order may differ from send order; a gap above the highest sequence seen
/// counts the missing packets as (provisionally) lost, and stragglers that
/// later fill a gap reduce the count again.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    highest: Option<u32>,
    received: u64,
    lost: u64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an arrival; returns packets newly presumed lost.
    pub fn observe(&mut self, sequence: u32) -> u64 {
        self.received += 1;
        match self.highest {
            None => {
                self.highest = Some(sequence);
                0
            }
            Some(highest) => {
                let ahead = sequence.wrapping_sub(highest);
                if ahead > 0 && ahead < u32::MAX / 2 {
                    // Moving forward: anything skipped is provisionally lost.
                    let gap = (ahead - 1) as u64;
                    self.lost += gap;
                    self.highest = Some(sequence);
                    gap
                } else if ahead != 0 {
                    // Reordered straggler filling an earlier gap.
                    self.lost = self.lost.saturating_sub(1);
                    0
                } else {
                    0
                }
            }
        }
    }

    pub fn lost(&self) -> u64 {
        self.lost
    }

    pub fn received(&self) -> u64 {
        self.received
    }
}

/// Convenience constructors for the receive side.
impl MediaPacket {
    pub fn into_video_frame(self, codec: VideoCodec) -> EncodedVideoFrame {
        EncodedVideoFrame {
            data: self.payload,
            pts: self.pts,
            dts: self.pts,
            keyframe: self.keyframe,
            codec,
        }
    }

    pub fn into_audio_frame(self) -> EncodedAudioFrame {
        EncodedAudioFrame { data: self.payload, pts: self.pts }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_frame(pts: i64, keyframe: bool, data: &'static [u8]) -> EncodedVideoFrame {
        EncodedVideoFrame {
            data: Bytes::from_static(data),
            pts: Timestamp::from_micros(pts),
            dts: Timestamp::from_micros(pts),
            keyframe,
            codec: VideoCodec::H264,
        }
    }

    #[test]
    fn test_packet_round_trip() {
        let packet = MediaPacket {
            stream: StreamKind::Video,
            sequence: 41,
            pts: Timestamp::from_micros(1_234_567),
            keyframe: true,
            payload: Bytes::from_static(b"frame-bytes"),
        };
        let decoded = MediaPacket::decode(packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_pts_preserved_exactly() {
        for pts in [0i64, -1, i64::MAX, i64::MIN, 16_667] {
            let packet = MediaPacket {
                stream: StreamKind::Audio,
                sequence: 0,
                pts: Timestamp::from_micros(pts),
                keyframe: false,
                payload: Bytes::new(),
            };
            let decoded = MediaPacket::decode(packet.encode()).unwrap();
            assert_eq!(decoded.pts.as_micros(), pts);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(MediaPacket::decode(Bytes::from_static(b"xx")).is_err());
        let mut bad = BytesMut::new();
        bad.put_u16(0xFFFF);
        bad.put_bytes(0, PACKET_HEADER_SIZE);
        assert!(MediaPacket::decode(bad.freeze()).is_err());
    }

    #[test]
    fn test_framer_assigns_per_stream_sequences() {
        let mut framer = PacketFramer::new();
        let tuple = SyncedFrames {
            video: Some(video_frame(0, true, b"v0")),
            audio: Some(EncodedAudioFrame {
                data: Bytes::from_static(b"a0"),
                pts: Timestamp::ZERO,
            }),
            presentation_time: Timestamp::ZERO,
        };

        let first = framer.frame(&tuple);
        let second = framer.frame(&tuple);
        assert_eq!(first[0].sequence, 0);
        assert_eq!(first[1].sequence, 0);
        assert_eq!(second[0].sequence, 1);
        assert_eq!(second[1].sequence, 1);
        assert_eq!(first[0].stream, StreamKind::Video);
        assert_eq!(first[1].stream, StreamKind::Audio);
    }

    #[test]
    fn test_config_prepended_once_per_epoch() {
        let mut framer = PacketFramer::new();
        // SPS (type 7) + PPS (type 8) in start-code form.
        let config: &[u8] = &[0, 0, 0, 1, 0x67, 0xAA, 0, 0, 0, 1, 0x68, 0xBB];
        framer.set_codec_config(Bytes::from_static(config));

        let keyframe_tuple = SyncedFrames {
            video: Some(video_frame(0, true, &[0, 0, 0, 1, 0x65, 0x11])),
            ..Default::default()
        };

        let packets = framer.frame(&keyframe_tuple);
        assert!(contains_parameter_sets(&packets[0].payload));
        assert!(packets[0].payload.starts_with(&START_CODE));

        // Second keyframe of the same epoch: no duplicate config.
        let packets = framer.frame(&keyframe_tuple);
        assert!(!contains_parameter_sets(&packets[0].payload));

        // New epoch re-arms the prepend.
        framer.set_codec_config(Bytes::from_static(config));
        let packets = framer.frame(&keyframe_tuple);
        assert!(contains_parameter_sets(&packets[0].payload));
    }

    #[test]
    fn test_inband_config_not_duplicated() {
        let mut framer = PacketFramer::new();
        framer.set_codec_config(Bytes::from_static(&[0, 0, 0, 1, 0x67, 0xAA]));

        // Keyframe that already carries its SPS in-band.
        let tuple = SyncedFrames {
            video: Some(video_frame(0, true, &[0, 0, 0, 1, 0x67, 0xCC, 0, 0, 0, 1, 0x65, 0x11])),
            ..Default::default()
        };
        let packets = framer.frame(&tuple);
        assert_eq!(&packets[0].payload[..], &tuple.video.as_ref().unwrap().data[..]);
    }

    #[test]
    fn test_sequence_tracker_counts_gaps() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.observe(0), 0);
        assert_eq!(tracker.observe(1), 0);
        // 2 and 3 missing.
        assert_eq!(tracker.observe(4), 2);
        assert_eq!(tracker.lost(), 2);
        // A straggler fills one gap.
        tracker.observe(2);
        assert_eq!(tracker.lost(), 1);
    }

    #[test]
    fn test_sequence_tracker_wraps() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(u32::MAX - 1);
        assert_eq!(tracker.observe(u32::MAX), 0);
        assert_eq!(tracker.observe(0), 0);
        assert_eq!(tracker.observe(1), 0);
        assert_eq!(tracker.lost(), 0);
    }
}
