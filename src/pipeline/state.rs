//! Pipeline lifecycle state machine.
//!
//! A session moves strictly forward: once `Stopped`, a pipeline is done and
//! a new session constructs a fresh one. Pause keeps the connection and all
//! stages alive; only the producing side goes quiet.

use std::time::Instant;

/// Lifecycle state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Constructed, nothing running yet.
    Idle,
    /// Stages are being wired and started.
    Initializing,
    /// Media is flowing.
    Running { started_at: Instant },
    /// Producing side quiesced; connection stays open.
    Paused { paused_at: Instant },
    /// Shutdown in progress: stages drain and exit.
    Stopping,
    /// Terminal. Re-entry is not supported.
    Stopped,
}

impl PipelineState {
    pub fn running_now() -> Self {
        PipelineState::Running { started_at: Instant::now() }
    }

    pub fn paused_now() -> Self {
        PipelineState::Paused { paused_at: Instant::now() }
    }

    /// Validity of `self → target`.
    pub fn can_transition_to(&self, target: &PipelineState) -> bool {
        use PipelineState::*;
        match (self, target) {
            (Idle, Initializing) => true,
            (Initializing, Running { .. }) => true,
            // Initialization may be aborted.
            (Initializing, Stopping) => true,
            (Running { .. }, Paused { .. }) => true,
            (Running { .. }, Stopping) => true,
            (Paused { .. }, Running { .. }) => true,
            (Paused { .. }, Stopping) => true,
            (Stopping, Stopped) => true,
            (Stopped, _) => false,
            (a, b) if std::mem::discriminant(a) == std::mem::discriminant(b) => true,
            _ => false,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, PipelineState::Running { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, PipelineState::Paused { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Stopping | PipelineState::Stopped)
    }

    pub fn label(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Initializing => "initializing",
            PipelineState::Running { .. } => "running",
            PipelineState::Paused { .. } => "paused",
            PipelineState::Stopping => "stopping",
            PipelineState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_path() {
        let running = PipelineState::running_now();
        let paused = PipelineState::paused_now();

        assert!(PipelineState::Idle.can_transition_to(&PipelineState::Initializing));
        assert!(PipelineState::Initializing.can_transition_to(&running));
        assert!(running.can_transition_to(&paused));
        assert!(paused.can_transition_to(&running));
        assert!(running.can_transition_to(&PipelineState::Stopping));
        assert!(PipelineState::Stopping.can_transition_to(&PipelineState::Stopped));
    }

    #[test]
    fn test_no_restart_after_stopped() {
        let stopped = PipelineState::Stopped;
        assert!(!stopped.can_transition_to(&PipelineState::Idle));
        assert!(!stopped.can_transition_to(&PipelineState::Initializing));
        assert!(!stopped.can_transition_to(&PipelineState::running_now()));
    }

    #[test]
    fn test_no_shortcuts() {
        assert!(!PipelineState::Idle.can_transition_to(&PipelineState::running_now()));
        assert!(!PipelineState::Idle.can_transition_to(&PipelineState::Stopped));
        assert!(!PipelineState::Initializing.can_transition_to(&PipelineState::paused_now()));
    }

    #[test]
    fn test_self_transition_allowed() {
        let running = PipelineState::running_now();
        assert!(running.can_transition_to(&PipelineState::running_now()));
    }
}
