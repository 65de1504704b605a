//! Receiver pipeline coordinator.
//!
//! Wires receive → decode → present for video and receive → decode →
//! playout for audio around one master clock. Keyframe requests raised by
//! the video decoder and control text from the transport are surfaced to
//! the session layer through channels.

use anyhow::Result;
use log::warn;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::decoder::{AudioDecoder, AudioPlayoutQueue, AudioSink, VideoDecoder};
use crate::pipeline::clock::MasterClock;
use crate::pipeline::handoff::{BoundedHandoff, OverflowPolicy};
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::stage::PipelineSupervisor;
use crate::pipeline::types::VideoCodec;
use crate::transport::TransportEvent;

use super::decode_stage::DecodeStage;
use super::playout_stage::PlayoutStage;
use super::present_stage::{PresentStage, SchedulerConfig, VideoSink};
use super::receive_stage::ReceiveStage;

/// Receiver session configuration.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub codec: VideoCodec,
    pub sample_rate: u32,
    pub channels: u16,
    pub scheduler: SchedulerConfig,
    /// Open a real audio output device. Off in tests and headless runs.
    pub enable_audio_sink: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            sample_rate: 48_000,
            channels: 2,
            scheduler: SchedulerConfig::default(),
            enable_audio_sink: true,
        }
    }
}

/// Owns the receiver pipeline for one session.
pub struct ReceiverCoordinator {
    supervisor: PipelineSupervisor,
    clock: MasterClock,
    playout: Arc<AudioPlayoutQueue>,
    control_rx: Option<mpsc::Receiver<(String, String)>>,
    keyframe_rx: Option<mpsc::Receiver<()>>,
    _audio_sink: Option<AudioSink>,
}

impl ReceiverCoordinator {
    /// Build and start all receiver stages.
    pub fn start(
        config: ReceiverConfig,
        events: mpsc::Receiver<TransportEvent>,
        video_sink: Box<dyn VideoSink>,
    ) -> Result<Self> {
        let health = Arc::new(PipelineHealth::new());
        let mut supervisor = PipelineSupervisor::new(health.clone());
        supervisor.begin_initializing();

        let clock = MasterClock::new();
        let playout = Arc::new(AudioPlayoutQueue::new(config.sample_rate, config.channels));

        let video_encoded = BoundedHandoff::new(64, OverflowPolicy::DropOldest);
        let audio_encoded = BoundedHandoff::new(128, OverflowPolicy::Block);
        let video_decoded = BoundedHandoff::new(8, OverflowPolicy::DropOldest);

        let (control_tx, control_rx) = mpsc::channel(32);
        let (keyframe_tx, keyframe_rx) = mpsc::channel(4);

        supervisor.spawn(Box::new(ReceiveStage::new(
            events,
            video_encoded.clone(),
            audio_encoded.clone(),
            control_tx,
            config.codec,
            health.clone(),
        )));
        supervisor.spawn(Box::new(DecodeStage::new(
            VideoDecoder::new(config.codec)?,
            video_encoded,
            video_decoded.clone(),
            keyframe_tx,
            health.clone(),
        )));
        supervisor.spawn(Box::new(PresentStage::new(
            video_decoded,
            video_sink,
            clock.clone(),
            config.scheduler.clone(),
            health.clone(),
        )));
        supervisor.spawn(Box::new(PlayoutStage::new(
            AudioDecoder::new(config.sample_rate, config.channels)?,
            audio_encoded,
            playout.clone(),
            clock.clone(),
            health,
        )));

        let audio_sink = if config.enable_audio_sink {
            match AudioSink::new(playout.clone()) {
                Ok(sink) => Some(sink),
                Err(err) => {
                    warn!("receiver: audio device unavailable ({err}), continuing without");
                    None
                }
            }
        } else {
            None
        };

        supervisor.mark_running();

        Ok(Self {
            supervisor,
            clock,
            playout,
            control_rx: Some(control_rx),
            keyframe_rx: Some(keyframe_rx),
            _audio_sink: audio_sink,
        })
    }

    /// Control messages from the transport: (peer, json text).
    pub fn take_control_events(&mut self) -> Option<mpsc::Receiver<(String, String)>> {
        self.control_rx.take()
    }

    /// Fires when the video decoder needs a keyframe from the sender.
    pub fn take_keyframe_requests(&mut self) -> Option<mpsc::Receiver<()>> {
        self.keyframe_rx.take()
    }

    pub fn clock(&self) -> MasterClock {
        self.clock.clone()
    }

    pub fn playout(&self) -> Arc<AudioPlayoutQueue> {
        self.playout.clone()
    }

    pub fn health(&self) -> Arc<PipelineHealth> {
        self.supervisor.health()
    }

    pub fn has_failed(&self) -> bool {
        self.supervisor.has_failed()
    }

    /// Stop the pipeline; a new session needs a fresh coordinator.
    pub async fn stop(&mut self) {
        self.supervisor.stop().await;
    }
}
