//! Audio capture + encode stage.
//!
//! One stage covers the audio path up to the synchronizer: the capture
//! source's fixed-duration frames feed the Opus encoder, and every packet
//! is pushed into the synchronizer under the no-silent-drop rule. On
//! overflow the push blocks for at most one frame duration; if the buffer
//! is still full the error surfaces to the supervisor.

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::capture::{AudioCaptureConfig, AudioCaptureSource};
use crate::encoder::AudioEncoder;
use crate::error::ErrorKind;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::stage::PipelineStage;
use crate::pipeline::sync::AvSynchronizer;

use super::capture_stage::StreamOpts;

/// Audio pipeline stage: capture, encode, hand to the synchronizer.
pub struct AudioStage {
    source: Box<dyn AudioCaptureSource>,
    encoder: AudioEncoder,
    config: AudioCaptureConfig,
    sync: Arc<AvSynchronizer>,
    opts: watch::Receiver<StreamOpts>,
    health: Arc<PipelineHealth>,
}

impl AudioStage {
    pub fn new(
        source: Box<dyn AudioCaptureSource>,
        encoder: AudioEncoder,
        config: AudioCaptureConfig,
        sync: Arc<AvSynchronizer>,
        opts: watch::Receiver<StreamOpts>,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self { source, encoder, config, sync, opts, health }
    }
}

#[async_trait]
impl PipelineStage for AudioStage {
    async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        self.source.initialize(&self.config)?;
        self.source.start()?;
        info!("audio: started ({} Hz, {} ch)", self.config.sample_rate, self.config.channels);

        let frame_duration = Duration::from_millis(self.config.frame_size_ms as u64);
        let mut packets = 0u64;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if self.opts.borrow().paused {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(50)) => continue,
                }
            }

            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = self.source.capture_frame(frame_duration * 2) => frame?,
            };
            let Some(frame) = frame else { continue };

            for packet in self.encoder.encode(&frame)? {
                let size = packet.data.len();
                // Audio is never dropped silently: block briefly on
                // overflow, then surface sustained backpressure.
                match self.sync.push_audio(packet.clone()) {
                    Ok(()) => {}
                    Err(err) if err.kind == ErrorKind::TransientIo => {
                        warn!("audio: synchronizer full, blocking one frame interval");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(frame_duration) => {}
                        }
                        self.sync.push_audio(packet)?;
                    }
                    Err(err) => return Err(err.into()),
                }
                self.health.record_frame(size, false);
                packets += 1;
            }
        }

        self.source.stop()?;
        info!("audio: finished ({packets} packets)");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "audio"
    }
}
