//! Sender pipeline coordinator.
//!
//! Wires capture → encode → synchronize → transmit, owns the runtime
//! option channels, and applies control-plane commands to the running
//! stages.

use anyhow::Result;
use log::{info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};

use crate::capture::{AudioCaptureConfig, AudioCaptureSource, ScreenCaptureSource};
use crate::control::{ControlAction, ControlPlane, PipelineCommand, QualityPreset};
use crate::encoder::{AudioEncoder, AudioEncoderConfig, VideoEncoder, VideoEncoderConfig};
use crate::pipeline::handoff::{BoundedHandoff, OverflowPolicy};
use crate::pipeline::clock::StreamClock;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::stage::PipelineSupervisor;
use crate::pipeline::sync::{AvSynchronizer, SyncConfig, SyncStats};
use crate::transport::MediaTransport;

use super::audio_stage::AudioStage;
use super::capture_stage::{CaptureStage, StreamOpts};
use super::encode_stage::{EncodeStage, EncoderCommand};
use super::transmit_stage::TransmitStage;

/// Everything a sender session needs up front.
pub struct SenderConfig {
    pub video: VideoEncoderConfig,
    pub audio: AudioEncoderConfig,
    pub sync: SyncConfig,
    pub authorized_peer: String,
}

/// Owns the sender pipeline for one session.
pub struct SenderCoordinator {
    supervisor: PipelineSupervisor,
    sync: Arc<AvSynchronizer>,
    transport: Arc<dyn MediaTransport>,
    control: ControlPlane,
    opts: watch::Sender<StreamOpts>,
    keyframe: Arc<AtomicBool>,
    encoder_commands: mpsc::Sender<EncoderCommand>,
    paused: bool,
    bitrate: u32,
}

impl SenderCoordinator {
    /// Build and start all sender stages.
    pub fn start(
        config: SenderConfig,
        video_source: Box<dyn ScreenCaptureSource>,
        audio_source: Box<dyn AudioCaptureSource>,
        transport: Arc<dyn MediaTransport>,
    ) -> Result<Self> {
        let health = Arc::new(PipelineHealth::new());
        let mut supervisor = PipelineSupervisor::new(health.clone());
        supervisor.begin_initializing();

        let clock = StreamClock::new();
        let sync = Arc::new(AvSynchronizer::new(config.sync, clock.clone()));
        sync.start();

        let opts = StreamOpts {
            paused: false,
            width: config.video.width,
            height: config.video.height,
            fps: config.video.fps,
            monitor: -1,
        };
        let (opts_tx, opts_rx) = watch::channel(opts);

        let capture_out = BoundedHandoff::new(8, OverflowPolicy::DropOldest);
        let encoder = VideoEncoder::new(config.video.clone())?;
        let keyframe = encoder.keyframe_handle();
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let audio_config = AudioCaptureConfig {
            sample_rate: config.audio.sample_rate,
            channels: config.audio.channels,
            frame_size_ms: config.audio.frame_size_ms,
        };
        let audio_encoder = AudioEncoder::new(config.audio)?;

        supervisor.spawn(Box::new(CaptureStage::new(
            video_source,
            capture_out.clone(),
            opts_rx.clone(),
            health.clone(),
        )));
        supervisor.spawn(Box::new(EncodeStage::new(
            encoder,
            capture_out,
            sync.clone(),
            cmd_rx,
            health.clone(),
        )));
        supervisor.spawn(Box::new(AudioStage::new(
            audio_source,
            audio_encoder,
            audio_config,
            sync.clone(),
            opts_rx,
            health.clone(),
        )));
        supervisor.spawn(Box::new(TransmitStage::new(
            sync.clone(),
            transport.clone(),
            health,
        )));
        supervisor.mark_running();

        let bitrate = config.video.bitrate_bps;
        Ok(Self {
            supervisor,
            sync,
            transport,
            control: ControlPlane::new(config.authorized_peer),
            opts: opts_tx,
            keyframe,
            encoder_commands: cmd_tx,
            paused: false,
            bitrate,
        })
    }

    /// Apply one pipeline command.
    pub fn apply(&mut self, command: PipelineCommand) {
        info!("sender: applying {command:?}");
        match &command {
            PipelineCommand::Pause => {
                self.paused = true;
                self.opts.send_modify(|o| o.paused = true);
                self.supervisor.mark_paused();
            }
            PipelineCommand::Resume => {
                self.paused = false;
                self.opts.send_modify(|o| o.paused = false);
                self.supervisor.mark_resumed();
            }
            PipelineCommand::SetResolution { width, height } => {
                let (width, height) = (*width, *height);
                self.opts.send_modify(|o| {
                    o.width = width;
                    o.height = height;
                });
            }
            PipelineCommand::SetBitrate { bitrate } => {
                self.bitrate = *bitrate;
                if self
                    .encoder_commands
                    .try_send(EncoderCommand::SetBitrate(*bitrate))
                    .is_err()
                {
                    warn!("sender: encoder command queue full, bitrate change delayed");
                }
            }
            PipelineCommand::SetQuality { preset } => {
                if let Some((width, height, bitrate, fps)) = preset.parameters() {
                    self.bitrate = bitrate;
                    self.opts.send_modify(|o| {
                        o.width = width;
                        o.height = height;
                        o.fps = fps;
                    });
                    let _ = self.encoder_commands.try_send(EncoderCommand::SetBitrate(bitrate));
                }
            }
            PipelineCommand::SelectMonitor { id } => {
                let id = *id;
                self.opts.send_modify(|o| o.monitor = id);
            }
            PipelineCommand::RequestKeyframe => {}
        }

        if command.forces_keyframe() {
            self.keyframe.store(true, Ordering::Release);
        }
    }

    /// Feed one raw control message from the transport.
    pub async fn handle_control(&mut self, peer: &str, text: &str) {
        match self.control.process(peer, text) {
            ControlAction::Command(command) => {
                self.apply(command);
                let opts = self.opts.borrow().clone();
                let state = self.control.make_state(
                    self.paused,
                    opts.width,
                    opts.height,
                    self.bitrate,
                    opts.fps,
                );
                if let Err(err) = self.transport.send_control(&state).await {
                    warn!("sender: state report failed: {err}");
                }
            }
            ControlAction::Reply(reply) => {
                if let Err(err) = self.transport.send_control(&reply).await {
                    warn!("sender: control reply failed: {err}");
                }
            }
            ControlAction::Handled | ControlAction::Ignored => {}
        }
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.sync.stats()
    }

    pub fn health(&self) -> Arc<PipelineHealth> {
        self.supervisor.health()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn has_failed(&self) -> bool {
        self.supervisor.has_failed()
    }

    /// Set a quality preset directly (local CLI path, not control plane).
    pub fn set_quality(&mut self, preset: QualityPreset) {
        self.apply(PipelineCommand::SetQuality { preset });
    }

    /// Stop the whole pipeline. The session cannot be restarted.
    pub async fn stop(&mut self) {
        self.sync.stop();
        self.supervisor.stop().await;
        self.transport.close();
    }
}
