//! Audio decode + playout stage.
//!
//! Opus packets decode into the playout ring, and the ring's read position
//! (what the speaker is emitting right now) drives the master clock
//! whenever audio is the clock source. The jitter ring sizes the adaptive
//! playout buffer each tick.

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::decoder::{AudioDecoder, AudioPlayoutQueue};
use crate::pipeline::clock::{ClockSource, MasterClock};
use crate::pipeline::handoff::BoundedHandoff;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::jitter::{AdaptiveBuffer, JitterEstimator};
use crate::pipeline::stage::PipelineStage;
use crate::pipeline::types::{EncodedAudioFrame, Timestamp};

/// Audio playout pipeline stage.
pub struct PlayoutStage {
    decoder: AudioDecoder,
    input: BoundedHandoff<EncodedAudioFrame>,
    queue: Arc<AudioPlayoutQueue>,
    clock: MasterClock,
    jitter: JitterEstimator,
    adaptive: AdaptiveBuffer,
    health: Arc<PipelineHealth>,
    arrival_base: Instant,
}

impl PlayoutStage {
    pub fn new(
        decoder: AudioDecoder,
        input: BoundedHandoff<EncodedAudioFrame>,
        queue: Arc<AudioPlayoutQueue>,
        clock: MasterClock,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self {
            decoder,
            input,
            queue,
            clock,
            jitter: JitterEstimator::new(),
            adaptive: AdaptiveBuffer::new(),
            health,
            arrival_base: Instant::now(),
        }
    }

    /// Current adaptive playout buffer target in microseconds.
    pub fn target_buffer_us(&self) -> i64 {
        self.adaptive.size_us()
    }
}

#[async_trait]
impl PipelineStage for PlayoutStage {
    async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        info!("audio-playout: started");
        let mut packets = 0u64;

        loop {
            let packet = tokio::select! {
                _ = cancel.cancelled() => break,
                packet = self.input.recv(Duration::from_millis(100)) => packet,
            };

            // The speaker position advances between packets too; keep the
            // clock fed even on idle ticks.
            self.clock.observe(ClockSource::Audio, self.queue.position());

            let Some(packet) = packet else {
                if self.input.is_closed() {
                    break;
                }
                continue;
            };

            let arrival = Timestamp::from_instant(Instant::now(), self.arrival_base);
            self.jitter.add_sample(packet.pts, arrival);
            self.adaptive.update(self.jitter.jitter_us(), self.health.packets_lost());

            match self.decoder.decode(&packet) {
                Ok(frames) => {
                    for frame in frames {
                        self.health.record_frame(frame.samples.len() * 4, false);
                        self.queue.push(&frame);
                    }
                    packets += 1;
                }
                Err(err) => {
                    warn!("audio-playout: {err}");
                    self.health.record_decode_failure();
                }
            }
        }

        self.input.drain();
        info!("audio-playout: finished ({packets} packets)");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "audio-playout"
    }
}
