//! Video encode stage.
//!
//! Drains capture events, drives the encoder, and pushes encoded frames
//! into the synchronizer. Format-change sentinels reconfigure the encoder
//! before the next frame; bitrate commands arrive on a side channel and
//! take effect at the next keyframe boundary.

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::capture::CaptureEvent;
use crate::encoder::VideoEncoder;
use crate::pipeline::handoff::BoundedHandoff;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::stage::PipelineStage;
use crate::pipeline::sync::AvSynchronizer;

/// Commands the coordinator can send mid-session.
#[derive(Debug, Clone)]
pub enum EncoderCommand {
    SetBitrate(u32),
}

/// Video encode pipeline stage.
pub struct EncodeStage {
    encoder: VideoEncoder,
    input: BoundedHandoff<CaptureEvent>,
    sync: Arc<AvSynchronizer>,
    commands: mpsc::Receiver<EncoderCommand>,
    health: Arc<PipelineHealth>,
}

impl EncodeStage {
    pub fn new(
        encoder: VideoEncoder,
        input: BoundedHandoff<CaptureEvent>,
        sync: Arc<AvSynchronizer>,
        commands: mpsc::Receiver<EncoderCommand>,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self { encoder, input, sync, commands, health }
    }

    fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                EncoderCommand::SetBitrate(bps) => {
                    info!("encode: bitrate change to {bps} bps queued");
                    self.encoder.set_bitrate(bps);
                }
            }
        }
    }
}

#[async_trait]
impl PipelineStage for EncodeStage {
    async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        info!("encode: started with {}", self.encoder.codec_name());
        let mut encoded = 0u64;

        loop {
            self.apply_commands();

            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.input.recv(Duration::from_millis(100)) => event,
            };

            let Some(event) = event else {
                if self.input.is_closed() {
                    break;
                }
                continue;
            };

            match event {
                CaptureEvent::FormatChange { width, height, .. } => {
                    self.encoder.reconfigure(width, height)?;
                    info!("encode: reconfigured to {}x{}", width, height);
                }
                CaptureEvent::Frame(frame) => {
                    let frames = match self.encoder.encode(&frame) {
                        Ok(frames) => frames,
                        Err(err) => {
                            // A transient codec error escalates into a
                            // keyframe request so the stream can recover.
                            warn!("encode: {err}, requesting keyframe");
                            self.encoder.request_keyframe();
                            self.health.record_encode_failure();
                            continue;
                        }
                    };
                    for encoded_frame in frames {
                        self.health.record_frame(encoded_frame.data.len(), encoded_frame.keyframe);
                        encoded += 1;
                        self.sync.push_video(encoded_frame)?;
                    }
                }
            }
        }

        // Flush remaining frames on the way out.
        if let Ok(frames) = self.encoder.flush() {
            for frame in frames {
                let _ = self.sync.push_video(frame);
            }
        }
        self.input.drain();
        info!("encode: finished ({encoded} frames)");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "video-encode"
    }
}
