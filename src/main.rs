use clap::Parser;
use log::{error, info};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use streamcast::capture::{PatternVideoSource, ToneAudioSource};
use streamcast::cli::Cli;
use streamcast::config::Options;
use streamcast::control::PipelineCommand;
use streamcast::decoder::DecodedVideoFrame;
use streamcast::encoder::{AudioEncoderConfig, VideoEncoderConfig};
use streamcast::error::ErrorKind;
use streamcast::pipeline::clock::StreamClock;
use streamcast::pipeline::receiver::{ReceiverConfig, ReceiverCoordinator, VideoSink};
use streamcast::pipeline::sender::{SenderConfig, SenderCoordinator};
use streamcast::pipeline::sync::SyncConfig;
use streamcast::transport::{ChannelTransport, MediaTransport};

/// Renders by counting; stands in for a platform surface.
struct StatsVideoSink {
    frames: u64,
}

impl VideoSink for StatsVideoSink {
    fn render(&mut self, frame: &DecodedVideoFrame) -> streamcast::error::Result<()> {
        self.frames += 1;
        if self.frames % 300 == 0 {
            info!("render: {} frames, last pts {}", self.frames, frame.pts);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let options = match Options::load(cli.config.as_deref()).and_then(|o| cli.apply(o)) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("streamcast: {err}");
            return ExitCode::from(1);
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if options.logging.verbose { "debug" } else { "info" },
    ))
    .init();

    if cli.list_monitors {
        // Only the built-in source is compiled into the core; platform
        // backends enumerate real monitors through the same trait.
        let source = PatternVideoSource::new(1920, 1080, StreamClock::new());
        use streamcast::capture::traits::ScreenCaptureSource;
        for monitor in source.monitors() {
            println!(
                "{}: {} ({}x{}){}",
                monitor.id,
                monitor.name,
                monitor.width,
                monitor.height,
                if monitor.primary { " primary" } else { "" }
            );
        }
        return ExitCode::SUCCESS;
    }

    let cancel = CancellationToken::new();
    let ctrlc_cancel = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || ctrlc_cancel.cancel()) {
        eprintln!("streamcast: cannot install signal handler: {err}");
        return ExitCode::from(1);
    }

    match run_session(&options, cli.duration, cancel.clone()).await {
        Ok(()) => {
            if cancel.is_cancelled() {
                ExitCode::from(130)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            error!("session failed: {err}");
            let code = err
                .downcast_ref::<streamcast::error::Error>()
                .map(|e| if e.kind == ErrorKind::Permission { 2 } else { 1 })
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

/// Run a loopback session: synthetic sources through the full sender
/// pipeline, across the in-memory transport, through the full receiver
/// pipeline.
async fn run_session(
    options: &Options,
    duration_secs: u64,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    info!("starting loopback session ({} fps)", options.video.fps);

    let (transport, events) = ChannelTransport::pair("local-peer", 256);
    let transport: Arc<dyn MediaTransport> = Arc::new(transport);

    let clock = StreamClock::new();
    let video_source = Box::new(PatternVideoSource::new(1280, 720, clock.clone()));
    let audio_source = Box::new(ToneAudioSource::new(clock));

    let bitrate = if options.video.bitrate == 0 { 5_000_000 } else { options.video.bitrate };
    let sender_config = SenderConfig {
        video: VideoEncoderConfig {
            codec: options.video.codec,
            width: 1280,
            height: 720,
            fps: options.video.fps,
            bitrate_bps: bitrate,
            hw_accel: options.video.hw_accel,
            ..Default::default()
        },
        audio: AudioEncoderConfig::default(),
        sync: SyncConfig::default(),
        authorized_peer: "local-peer".to_string(),
    };

    let mut sender =
        SenderCoordinator::start(sender_config, video_source, audio_source, transport)?;

    let mut receiver = ReceiverCoordinator::start(
        ReceiverConfig {
            codec: options.video.codec,
            enable_audio_sink: options.audio.enabled,
            ..Default::default()
        },
        events,
        Box::new(StatsVideoSink { frames: 0 }),
    )?;

    let mut keyframe_requests = receiver.take_keyframe_requests().expect("fresh receiver");
    let mut control_events = receiver.take_control_events().expect("fresh receiver");

    let deadline = if duration_secs == 0 {
        None
    } else {
        Some(tokio::time::Instant::now() + Duration::from_secs(duration_secs))
    };
    let mut stats_tick = tokio::time::interval(Duration::from_secs(10));

    loop {
        let timeout = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("interrupted, shutting down");
                break;
            }
            _ = timeout => {
                info!("session duration reached");
                break;
            }
            _ = stats_tick.tick() => {
                let stats = sender.sync_stats();
                info!(
                    "sync: offset {}us, drift a/v {:.0}/{:.0} ppm, {} dropped | {}",
                    stats.audio_video_offset_us,
                    stats.audio_drift_ppm,
                    stats.video_drift_ppm,
                    stats.frames_dropped,
                    receiver.health().summary(),
                );
            }
            Some(()) = keyframe_requests.recv() => {
                sender.apply(PipelineCommand::RequestKeyframe);
            }
            Some((peer, text)) = control_events.recv() => {
                // Control text arriving on the transport goes to the sender
                // coordinator, which authorizes the peer and applies the
                // command (or answers pings).
                sender.handle_control(&peer, &text).await;
            }
        }

        if sender.has_failed() || receiver.has_failed() {
            sender.stop().await;
            receiver.stop().await;
            anyhow::bail!("pipeline failure, see log");
        }
    }

    sender.stop().await;
    receiver.stop().await;
    Ok(())
}
