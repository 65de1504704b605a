//! Receive stage: transport events into per-stream queues.
//!
//! Demultiplexes media packets by stream id, tracks per-stream sequence
//! numbers for loss accounting, and forwards control text to the session
//! layer. Video uses a drop-oldest queue; audio is only dropped here if the
//! decoder stops consuming entirely.

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::pipeline::handoff::BoundedHandoff;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::stage::PipelineStage;
use crate::pipeline::types::{EncodedAudioFrame, EncodedVideoFrame, StreamKind, VideoCodec};
use crate::transport::envelope::SequenceTracker;
use crate::transport::TransportEvent;

/// Transport demux pipeline stage.
pub struct ReceiveStage {
    events: mpsc::Receiver<TransportEvent>,
    video_out: BoundedHandoff<EncodedVideoFrame>,
    audio_out: BoundedHandoff<EncodedAudioFrame>,
    control_out: mpsc::Sender<(String, String)>,
    codec: VideoCodec,
    video_seq: SequenceTracker,
    audio_seq: SequenceTracker,
    health: Arc<PipelineHealth>,
}

impl ReceiveStage {
    pub fn new(
        events: mpsc::Receiver<TransportEvent>,
        video_out: BoundedHandoff<EncodedVideoFrame>,
        audio_out: BoundedHandoff<EncodedAudioFrame>,
        control_out: mpsc::Sender<(String, String)>,
        codec: VideoCodec,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self {
            events,
            video_out,
            audio_out,
            control_out,
            codec,
            video_seq: SequenceTracker::new(),
            audio_seq: SequenceTracker::new(),
            health,
        }
    }
}

#[async_trait]
impl PipelineStage for ReceiveStage {
    async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        info!("receive: started");
        let mut packets = 0u64;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.events.recv() => event,
            };
            let Some(event) = event else { break };

            match event {
                TransportEvent::Media(packet) => {
                    packets += 1;
                    match packet.stream {
                        StreamKind::Video => {
                            let lost = self.video_seq.observe(packet.sequence);
                            if lost > 0 {
                                self.health.record_packet_loss(lost);
                            }
                            let frame = packet.into_video_frame(self.codec);
                            let _ = self.video_out.try_push(frame);
                        }
                        StreamKind::Audio => {
                            let lost = self.audio_seq.observe(packet.sequence);
                            if lost > 0 {
                                self.health.record_packet_loss(lost);
                            }
                            if self.audio_out.try_push(packet.into_audio_frame()).is_err() {
                                warn!("receive: audio queue stalled");
                                self.health.record_drop();
                            }
                        }
                    }
                }
                TransportEvent::Control { peer, text } => {
                    let _ = self.control_out.send((peer, text)).await;
                }
                TransportEvent::StateChanged(state) => {
                    info!("receive: connection state {state:?}");
                }
            }
        }

        self.video_out.close();
        self.audio_out.close();
        info!(
            "receive: finished ({packets} packets, {} lost)",
            self.video_seq.lost() + self.audio_seq.lost()
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "receive"
    }
}
