//! End-to-end timing-path test: synchronizer → transmit → wire → demux.
//!
//! Exercises the full sender timing path and the receiver demux without
//! touching codecs: encoded frames are synthetic byte strings, but every
//! PTS, sequence number, and keyframe flag crosses the real wire envelope.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use streamcast::capture::{PatternVideoSource, ToneAudioSource};
use streamcast::control::ControlMessage;
use streamcast::encoder::{AudioEncoderConfig, VideoEncoderConfig};
use streamcast::pipeline::clock::StreamClock;
use streamcast::pipeline::handoff::{BoundedHandoff, OverflowPolicy};
use streamcast::pipeline::health::PipelineHealth;
use streamcast::pipeline::sender::{SenderConfig, SenderCoordinator};
use streamcast::pipeline::stage::PipelineStage;
use streamcast::pipeline::sync::{AvSynchronizer, SyncConfig};
use streamcast::pipeline::types::{
    EncodedAudioFrame, EncodedVideoFrame, Timestamp, VideoCodec,
};
use streamcast::transport::{ChannelTransport, MediaTransport, TransportEvent};

fn video(pts_us: i64, keyframe: bool) -> EncodedVideoFrame {
    EncodedVideoFrame {
        data: Bytes::from_static(b"video-frame"),
        pts: Timestamp::from_micros(pts_us),
        dts: Timestamp::from_micros(pts_us),
        keyframe,
        codec: VideoCodec::H264,
    }
}

fn audio(pts_us: i64) -> EncodedAudioFrame {
    EncodedAudioFrame { data: Bytes::from_static(b"opus-packet"), pts: Timestamp::from_micros(pts_us) }
}

/// Steady 60 fps video and 50 fps audio all the way to the receive queues:
/// PTS survive exactly, both streams arrive, and every fully-valid pair
/// respects the desync bound.
#[tokio::test]
async fn steady_state_session_preserves_timing() {
    let sync = Arc::new(AvSynchronizer::new(SyncConfig::default(), StreamClock::new()));
    sync.start();

    let (transport, events) = ChannelTransport::pair("peer-1", 512);
    let transport: Arc<dyn MediaTransport> = Arc::new(transport);

    // Sender half: transmit stage drains the synchronizer.
    let health = Arc::new(PipelineHealth::new());
    let mut transmit = streamcast::pipeline::sender::transmit_stage::TransmitStage::new(
        sync.clone(),
        transport,
        health.clone(),
    );
    let cancel = CancellationToken::new();
    let transmit_cancel = cancel.clone();
    let transmit_task = tokio::spawn(async move { transmit.run(transmit_cancel).await });

    // Receiver half: demux into per-stream queues.
    let video_out = BoundedHandoff::new(256, OverflowPolicy::DropOldest);
    let audio_out = BoundedHandoff::new(256, OverflowPolicy::Block);
    let (control_tx, _control_rx) = mpsc::channel(4);
    let receiver_health = Arc::new(PipelineHealth::new());
    let mut receive = streamcast::pipeline::receiver::receive_stage::ReceiveStage::new(
        events,
        video_out.clone(),
        audio_out.clone(),
        control_tx,
        VideoCodec::H264,
        receiver_health.clone(),
    );
    let receive_cancel = cancel.clone();
    let receive_task = tokio::spawn(async move { receive.run(receive_cancel).await });

    // Feed one second of media, interleaved in PTS order the way the
    // encoders produce it. The stream begins with a keyframe.
    sync.push_video(video(0, true)).unwrap();
    let mut next_audio = 0i64;
    for i in 1..60 {
        let video_pts = i * 16_667;
        while next_audio <= video_pts && next_audio < 1_000_000 {
            sync.push_audio(audio(next_audio)).unwrap();
            next_audio += 20_000;
        }
        sync.push_video(video(video_pts, false)).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // Let the pipeline drain.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut video_frames = Vec::new();
    while let Some(frame) = video_out.try_recv() {
        video_frames.push(frame);
    }
    let mut audio_frames = Vec::new();
    while let Some(frame) = audio_out.try_recv() {
        audio_frames.push(frame);
    }

    assert!(!video_frames.is_empty(), "no video crossed the wire");
    assert!(!audio_frames.is_empty(), "no audio crossed the wire");

    // First video frame out is the keyframe, PTS intact.
    assert!(video_frames[0].keyframe);
    assert_eq!(video_frames[0].pts.as_micros(), 0);

    // PTS monotone per stream after the trip.
    for pair in video_frames.windows(2) {
        assert!(pair[1].pts >= pair[0].pts);
    }
    for pair in audio_frames.windows(2) {
        assert!(pair[1].pts >= pair[0].pts);
    }

    // Audio is never silently dropped on the sender path: everything the
    // synchronizer accepted reaches the transport (minus in-flight).
    let in_flight = sync.depth().1;
    assert!(audio_frames.len() + in_flight >= 45, "audio loss: {} arrived", audio_frames.len());

    // No wire-level loss on the in-memory transport.
    assert_eq!(receiver_health.packets_lost(), 0);

    cancel.cancel();
    transmit_task.await.unwrap().unwrap();
    receive_task.await.unwrap().unwrap();
}

/// Control text reaches the sender coordinator: the authorized peer's
/// commands are applied (and answered with a state report), while another
/// peer's identical message is silently dropped.
#[tokio::test]
async fn control_commands_drive_sender() {
    let (transport, mut events) = ChannelTransport::pair("peer-1", 512);
    let transport: Arc<dyn MediaTransport> = Arc::new(transport);

    let clock = StreamClock::new();
    let mut sender = SenderCoordinator::start(
        SenderConfig {
            video: VideoEncoderConfig { width: 320, height: 240, fps: 30, ..Default::default() },
            audio: AudioEncoderConfig::default(),
            sync: SyncConfig::default(),
            authorized_peer: "peer-1".to_string(),
        },
        Box::new(PatternVideoSource::new(320, 240, clock.clone())),
        Box::new(ToneAudioSource::new(clock)),
        transport,
    )
    .expect("sender pipeline");

    let pause = ControlMessage::new("pause", None, None).to_json().unwrap();

    // Unauthorized peer: silently dropped, nothing changes.
    sender.handle_control("peer-2", &pause).await;
    assert!(!sender.is_paused());

    // Authorized peer: the pipeline pauses and a state report goes out.
    sender.handle_control("peer-1", &pause).await;
    assert!(sender.is_paused());

    let mut paused_report = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while paused_report.is_none() && tokio::time::Instant::now() < deadline {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(TransportEvent::Control { text, .. })) if text.contains("\"state\"") => {
                paused_report = Some(text);
            }
            Ok(Some(_)) => {} // media packets from the running pipeline
            _ => break,
        }
    }
    let report = paused_report.expect("state report after pause");
    assert!(report.contains("\"paused\":true"), "report: {report}");

    let resume = ControlMessage::new("resume", None, None).to_json().unwrap();
    sender.handle_control("peer-1", &resume).await;
    assert!(!sender.is_paused());

    sender.stop().await;
}

/// A keyframe pushed long after a gap still crosses the wire (never
/// dropped), while stale non-keyframes are discarded and counted.
#[tokio::test]
async fn late_keyframe_survives_gap() {
    let sync = Arc::new(AvSynchronizer::new(SyncConfig::default(), StreamClock::new()));
    sync.start();

    let (transport, mut events) = ChannelTransport::pair("peer-1", 64);
    let transport: Arc<dyn MediaTransport> = Arc::new(transport);
    let health = Arc::new(PipelineHealth::new());
    let mut transmit = streamcast::pipeline::sender::transmit_stage::TransmitStage::new(
        sync.clone(),
        transport,
        health,
    );
    let cancel = CancellationToken::new();
    let transmit_cancel = cancel.clone();
    let task = tokio::spawn(async move { transmit.run(transmit_cancel).await });

    sync.push_video(video(0, true)).unwrap();
    // Simulated 150 ms stall, then a late keyframe plus fresh audio.
    sync.push_video(video(1_000_000, true)).unwrap();
    sync.push_audio(audio(1_400_000)).unwrap();

    let mut keyframes_seen = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while keyframes_seen < 2 && tokio::time::Instant::now() < deadline {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(TransportEvent::Media(packet))) => {
                if packet.keyframe {
                    keyframes_seen += 1;
                }
            }
            _ => break,
        }
    }
    assert_eq!(keyframes_seen, 2, "late keyframe was dropped");

    cancel.cancel();
    task.await.unwrap().unwrap();
}
