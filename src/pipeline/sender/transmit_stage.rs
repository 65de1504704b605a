//! Transmit stage: synchronizer output onto the transport.
//!
//! Pulls synchronized tuples and ships them. Transport write failures are
//! retried within a small budget (transient network errors are normal);
//! exhausting the budget surfaces the error to the supervisor.

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::pipeline::health::PipelineHealth;
use crate::pipeline::stage::PipelineStage;
use crate::pipeline::sync::AvSynchronizer;
use crate::transport::MediaTransport;

/// Transport write attempts per tuple before giving up.
const SEND_RETRY_BUDGET: u32 = 3;

/// Synchronizer-to-transport pipeline stage.
pub struct TransmitStage {
    sync: Arc<AvSynchronizer>,
    transport: Arc<dyn MediaTransport>,
    health: Arc<PipelineHealth>,
}

impl TransmitStage {
    pub fn new(
        sync: Arc<AvSynchronizer>,
        transport: Arc<dyn MediaTransport>,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self { sync, transport, health }
    }
}

#[async_trait]
impl PipelineStage for TransmitStage {
    async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        info!("transmit: started");
        let mut tuples = 0u64;

        loop {
            let tuple = tokio::select! {
                _ = cancel.cancelled() => break,
                tuple = self.sync.get_next(Duration::from_millis(100)) => tuple,
            };

            let Some(tuple) = tuple else {
                if !self.sync.is_running() {
                    break;
                }
                continue;
            };

            let mut attempt = 0;
            loop {
                attempt += 1;
                match self.transport.send_synced(&tuple).await {
                    Ok(()) => break,
                    Err(err) if attempt < SEND_RETRY_BUDGET => {
                        self.health.record_transport_error();
                        warn!("transmit: send failed (attempt {attempt}): {err}");
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    Err(err) => {
                        self.health.record_transport_error();
                        return Err(err.into());
                    }
                }
            }
            tuples += 1;
        }

        info!("transmit: finished ({tuples} tuples)");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "transmit"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::clock::StreamClock;
    use crate::pipeline::sync::SyncConfig;
    use crate::pipeline::types::{EncodedVideoFrame, Timestamp, VideoCodec};
    use crate::transport::{ChannelTransport, TransportEvent};
    use bytes::Bytes;

    #[tokio::test]
    async fn test_tuples_reach_transport() {
        let sync = Arc::new(AvSynchronizer::new(SyncConfig::default(), StreamClock::new()));
        sync.start();
        let (transport, mut rx) = ChannelTransport::pair("peer", 32);
        let transport: Arc<dyn MediaTransport> = Arc::new(transport);
        let health = Arc::new(PipelineHealth::new());

        let mut stage = TransmitStage::new(sync.clone(), transport, health);
        let cancel = CancellationToken::new();
        let stage_cancel = cancel.clone();
        let task = tokio::spawn(async move { stage.run(stage_cancel).await });

        sync.push_video(EncodedVideoFrame {
            data: Bytes::from_static(b"key"),
            pts: Timestamp::ZERO,
            dts: Timestamp::ZERO,
            keyframe: true,
            codec: VideoCodec::H264,
        })
        .unwrap();

        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(TransportEvent::Media(packet))) => {
                assert!(packet.keyframe);
            }
            other => panic!("expected media packet, got {other:?}"),
        }

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
