//! Video decode stage.
//!
//! Feeds encoded frames to the decoder, starting only at a keyframe (the
//! first keyframe of each configuration epoch carries SPS/PPS in-band).
//! When the decoder signals `keyframe_needed`, the request goes out through
//! the coordinator so the sender can produce a fresh IDR.

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::decoder::{DecodedVideoFrame, VideoDecoder};
use crate::pipeline::handoff::BoundedHandoff;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::stage::PipelineStage;
use crate::pipeline::types::EncodedVideoFrame;

/// Video decode pipeline stage.
pub struct DecodeStage {
    decoder: VideoDecoder,
    input: BoundedHandoff<EncodedVideoFrame>,
    output: BoundedHandoff<DecodedVideoFrame>,
    keyframe_requests: mpsc::Sender<()>,
    health: Arc<PipelineHealth>,
    waiting_for_keyframe: bool,
}

impl DecodeStage {
    pub fn new(
        decoder: VideoDecoder,
        input: BoundedHandoff<EncodedVideoFrame>,
        output: BoundedHandoff<DecodedVideoFrame>,
        keyframe_requests: mpsc::Sender<()>,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self {
            decoder,
            input,
            output,
            keyframe_requests,
            health,
            waiting_for_keyframe: true,
        }
    }
}

#[async_trait]
impl PipelineStage for DecodeStage {
    async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        info!("video-decode: started");
        let mut decoded = 0u64;

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = self.input.recv(Duration::from_millis(100)) => frame,
            };
            let Some(frame) = frame else {
                if self.input.is_closed() {
                    break;
                }
                continue;
            };

            if self.waiting_for_keyframe {
                if !frame.keyframe {
                    continue;
                }
                info!("video-decode: first keyframe");
                self.waiting_for_keyframe = false;
            }

            match self.decoder.decode(&frame) {
                Ok(Some(picture)) => {
                    decoded += 1;
                    let _ = self.output.try_push(picture);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("video-decode: {err}");
                    self.health.record_decode_failure();
                    if self.decoder.take_keyframe_needed() {
                        // Resync: flush state and wait for a fresh IDR.
                        self.decoder.flush()?;
                        self.waiting_for_keyframe = true;
                        let _ = self.keyframe_requests.try_send(());
                    }
                }
            }
        }

        self.input.drain();
        self.output.close();
        info!("video-decode: finished ({decoded} frames)");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "video-decode"
    }
}
