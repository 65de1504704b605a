//! Stage trait and pipeline supervisor.
//!
//! Every stage runs on its own task, connected to its neighbors by bounded
//! handoffs, and reacts to one shared [`CancellationToken`]. The supervisor
//! owns the lifecycle: it spawns stages, applies the restart policy (one
//! attempt for recoverable failures, then teardown), and enforces the
//! shutdown deadline.

use anyhow::Result;
use async_trait::async_trait;
use log::{error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::health::PipelineHealth;
use super::state::PipelineState;

/// A unit of pipeline work driving frames from its input to its output.
#[async_trait]
pub trait PipelineStage: Send {
    /// Process until the input ends or `cancel` fires. Stages must drain
    /// their input (discarding) and return within one frame interval of
    /// cancellation.
    async fn run(&mut self, cancel: CancellationToken) -> Result<()>;

    /// Stage name for logging.
    fn name(&self) -> &'static str;
}

/// How long the supervisor waits for stages after cancelling them.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

/// Owns the stage tasks of one pipeline and their restart policy.
pub struct PipelineSupervisor {
    cancel: CancellationToken,
    health: Arc<PipelineHealth>,
    state: PipelineState,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    failed: Arc<AtomicBool>,
}

impl PipelineSupervisor {
    pub fn new(health: Arc<PipelineHealth>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            health,
            state: PipelineState::Idle,
            tasks: Vec::new(),
            failed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn health(&self) -> Arc<PipelineHealth> {
        self.health.clone()
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// True once any stage has failed terminally.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn transition(&mut self, target: PipelineState) {
        if self.state.can_transition_to(&target) {
            info!("pipeline: {} -> {}", self.state, target);
            self.state = target;
        } else {
            warn!("pipeline: refusing transition {} -> {}", self.state, target);
        }
    }

    pub fn begin_initializing(&mut self) {
        self.transition(PipelineState::Initializing);
    }

    pub fn mark_running(&mut self) {
        self.transition(PipelineState::running_now());
    }

    pub fn mark_paused(&mut self) {
        self.transition(PipelineState::paused_now());
    }

    pub fn mark_resumed(&mut self) {
        self.transition(PipelineState::running_now());
    }

    /// Spawn a stage under the restart policy.
    ///
    /// A failure whose kind is recoverable gets exactly one more attempt on
    /// the same stage instance; anything else (or a second failure) cancels
    /// the whole pipeline.
    pub fn spawn(&mut self, mut stage: Box<dyn PipelineStage>) {
        let name = stage.name();
        let cancel = self.cancel.clone();
        let failed = self.failed.clone();

        let handle = tokio::spawn(async move {
            let mut attempts = 0u32;
            loop {
                attempts += 1;
                match stage.run(cancel.clone()).await {
                    Ok(()) => {
                        info!("stage {}: finished", name);
                        return;
                    }
                    Err(err) if cancel.is_cancelled() => {
                        // Errors racing shutdown are expected noise.
                        info!("stage {}: exited during shutdown ({err:#})", name);
                        return;
                    }
                    Err(err) => {
                        let recoverable = err
                            .downcast_ref::<crate::error::Error>()
                            .map(|e| e.kind.is_recoverable())
                            .unwrap_or(false);
                        if recoverable && attempts == 1 {
                            warn!("stage {}: failed ({err:#}), restarting once", name);
                            continue;
                        }
                        error!("stage {}: failed ({err:#}), tearing pipeline down", name);
                        failed.store(true, Ordering::Release);
                        cancel.cancel();
                        return;
                    }
                }
            }
        });

        self.tasks.push((name, handle));
    }

    /// Cancel every stage and wait for them within the shutdown grace.
    pub async fn stop(&mut self) {
        self.transition(PipelineState::Stopping);
        self.cancel.cancel();

        for (name, handle) in self.tasks.drain(..) {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => error!("stage {}: task panicked: {join_err}", name),
                Err(_) => {
                    error!("stage {}: did not stop within {:?}, abandoning", name, SHUTDOWN_GRACE)
                }
            }
        }

        self.transition(PipelineState::Stopped);
        info!("pipeline stopped: {}", self.health.summary());
    }

    /// Wait until every stage ends on its own (input exhausted) or a
    /// failure cancels the pipeline.
    pub async fn join(&mut self) {
        for (_, handle) in self.tasks.drain(..) {
            let _ = handle.await;
        }
        self.transition(PipelineState::Stopping);
        self.transition(PipelineState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::AtomicU32;

    struct FlakyStage {
        attempts: Arc<AtomicU32>,
        fail_times: u32,
        kind: ErrorKind,
    }

    #[async_trait]
    impl PipelineStage for FlakyStage {
        async fn run(&mut self, _cancel: CancellationToken) -> Result<()> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_times {
                return Err(crate::error::Error::new(self.kind, "boom").into());
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_recoverable_failure_restarts_once() {
        let health = Arc::new(PipelineHealth::new());
        let mut supervisor = PipelineSupervisor::new(health);
        let attempts = Arc::new(AtomicU32::new(0));

        supervisor.spawn(Box::new(FlakyStage {
            attempts: attempts.clone(),
            fail_times: 1,
            kind: ErrorKind::TransientIo,
        }));
        supervisor.join().await;

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(!supervisor.has_failed());
    }

    #[tokio::test]
    async fn test_second_failure_is_fatal() {
        let health = Arc::new(PipelineHealth::new());
        let mut supervisor = PipelineSupervisor::new(health);
        let attempts = Arc::new(AtomicU32::new(0));

        supervisor.spawn(Box::new(FlakyStage {
            attempts: attempts.clone(),
            fail_times: 5,
            kind: ErrorKind::TransientIo,
        }));
        supervisor.join().await;

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(supervisor.has_failed());
    }

    #[tokio::test]
    async fn test_unrecoverable_failure_skips_restart() {
        let health = Arc::new(PipelineHealth::new());
        let mut supervisor = PipelineSupervisor::new(health);
        let attempts = Arc::new(AtomicU32::new(0));

        supervisor.spawn(Box::new(FlakyStage {
            attempts: attempts.clone(),
            fail_times: 5,
            kind: ErrorKind::InvariantViolation,
        }));
        supervisor.join().await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(supervisor.has_failed());
    }

    struct BlockingStage;

    #[async_trait]
    impl PipelineStage for BlockingStage {
        async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
            cancel.cancelled().await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "blocking"
        }
    }

    #[tokio::test]
    async fn test_stop_cancels_blocking_stage() {
        let health = Arc::new(PipelineHealth::new());
        let mut supervisor = PipelineSupervisor::new(health);
        supervisor.begin_initializing();
        supervisor.spawn(Box::new(BlockingStage));
        supervisor.mark_running();

        supervisor.stop().await;
        assert_eq!(supervisor.state(), PipelineState::Stopped);
    }
}
