//! Video capture stage.
//!
//! Pulls frames from the screen source and hands them to the encode stage
//! through a bounded queue. Backpressure rule: when the encoder's input
//! queue holds more than two frames, new captures are dropped here rather
//! than queued, so encoder lag costs freshness instead of latency.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::capture::{CaptureEvent, ScreenCaptureSource, VideoCaptureConfig};
use crate::pipeline::handoff::BoundedHandoff;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::stage::PipelineStage;

/// Encoder input depth above which fresh captures are discarded.
const ENCODER_LAG_FRAMES: usize = 2;

/// Runtime-adjustable stream options, updated by the coordinator.
#[derive(Debug, Clone)]
pub struct StreamOpts {
    pub paused: bool,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub monitor: i32,
}

impl Default for StreamOpts {
    fn default() -> Self {
        Self { paused: false, width: 1920, height: 1080, fps: 60, monitor: -1 }
    }
}

/// Screen capture pipeline stage.
pub struct CaptureStage {
    source: Box<dyn ScreenCaptureSource>,
    output: BoundedHandoff<CaptureEvent>,
    opts: watch::Receiver<StreamOpts>,
    health: Arc<PipelineHealth>,
}

impl CaptureStage {
    pub fn new(
        source: Box<dyn ScreenCaptureSource>,
        output: BoundedHandoff<CaptureEvent>,
        opts: watch::Receiver<StreamOpts>,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self { source, output, opts, health }
    }

    fn reconfigure(&mut self, opts: &StreamOpts) -> crate::error::Result<()> {
        let was_running = self.source.is_running();
        if was_running {
            self.source.stop()?;
        }
        self.source.select_monitor(opts.monitor)?;
        self.source.initialize(&VideoCaptureConfig {
            target_fps: opts.fps,
            monitor: opts.monitor,
            ..Default::default()
        })?;
        if was_running {
            self.source.start()?;
        }
        info!("capture: reconfigured ({}x{} @{} fps)", opts.width, opts.height, opts.fps);
        Ok(())
    }
}

#[async_trait]
impl PipelineStage for CaptureStage {
    async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let mut opts = self.opts.borrow().clone();
        self.source.initialize(&VideoCaptureConfig {
            target_fps: opts.fps,
            monitor: opts.monitor,
            ..Default::default()
        })?;
        self.source.start()?;
        info!("capture: started at {} fps", opts.fps);

        let mut captured = 0u64;
        loop {
            if cancel.is_cancelled() {
                break;
            }

            // Pick up runtime option changes between frames.
            if self.opts.has_changed().unwrap_or(false) {
                let new_opts = self.opts.borrow_and_update().clone();
                let needs_reconfigure = new_opts.monitor != opts.monitor
                    || new_opts.width != opts.width
                    || new_opts.height != opts.height
                    || new_opts.fps != opts.fps;
                opts = new_opts;
                if needs_reconfigure {
                    self.reconfigure(&opts)?;
                }
            }

            if opts.paused {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(50)) => continue,
                }
            }

            let frame_interval = Duration::from_micros(1_000_000 / opts.fps.max(1) as u64);
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.source.capture_frame(frame_interval * 2) => event?,
            };

            let Some(event) = event else { continue };

            match &event {
                CaptureEvent::FormatChange { width, height, .. } => {
                    info!("capture: format change to {}x{}", width, height);
                    // Sentinels always go through; the encoder must see them
                    // before the first frame in the new geometry.
                    let _ = self.output.try_push(event);
                }
                CaptureEvent::Frame(_) => {
                    if self.output.len() > ENCODER_LAG_FRAMES {
                        self.health.record_drop();
                        debug!("capture: encoder behind, dropping frame");
                        continue;
                    }
                    captured += 1;
                    if self.output.try_push(event).is_err() {
                        warn!("capture: output closed, stopping");
                        break;
                    }
                }
            }
        }

        self.source.stop()?;
        self.output.close();
        info!("capture: finished ({captured} frames)");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "capture"
    }
}
