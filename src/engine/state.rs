//! Engine state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of an execution engine.
///
/// The declaration order is meaningful: lifecycle checks compare states
/// (`Idle < Running < Stopped`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// The engine has never started.
    NotStarted,
    /// The loop is alive but the last tick reported no remaining work.
    Idle,
    /// The loop is alive and processing work.
    Running,
    /// The engine was stopped.
    Stopped,
    /// The last tick failed; the loop is sleeping before it resumes.
    Faulted,
}

impl EngineState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: EngineState) -> bool {
        use EngineState::*;

        matches!(
            (self, target),
            // Start
            (NotStarted, Running) | (Stopped, Running) |
            // Ticks
            (Idle, Running) | (Running, Idle) |
            // Tick failure and recovery
            (Idle, Faulted) | (Running, Faulted) | (Faulted, Running) |
            // Stop
            (Running, Stopped)
        )
    }

    /// Check if a loop in this state keeps ticking.
    pub fn is_ticking(&self) -> bool {
        matches!(self, Self::Idle | Self::Running)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Faulted => "faulted",
        };
        write!(f, "{s}")
    }
}

/// A recorded state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineTransition {
    /// Previous state.
    pub from: EngineState,
    /// New state.
    pub to: EngineState,
    /// When the transition occurred.
    pub timestamp: DateTime<Utc>,
}

/// Bounded history of state changes for one engine.
#[derive(Debug, Default)]
pub struct TransitionLog {
    entries: Vec<EngineTransition>,
}

impl TransitionLog {
    const MAX_TRANSITIONS: usize = 200;

    /// Record a change. Self-transitions are not recorded.
    pub fn record(&mut self, from: EngineState, to: EngineState) {
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            tracing::warn!(%from, %to, "Engine transition outside the state machine");
        }

        self.entries.push(EngineTransition {
            from,
            to,
            timestamp: Utc::now(),
        });

        if self.entries.len() > Self::MAX_TRANSITIONS {
            let drain_count = self.entries.len() - Self::MAX_TRANSITIONS;
            self.entries.drain(..drain_count);
        }
    }

    pub fn entries(&self) -> &[EngineTransition] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        assert!(EngineState::NotStarted.can_transition_to(EngineState::Running));
        assert!(EngineState::Running.can_transition_to(EngineState::Idle));
        assert!(EngineState::Idle.can_transition_to(EngineState::Running));
        assert!(EngineState::Running.can_transition_to(EngineState::Faulted));
        assert!(EngineState::Faulted.can_transition_to(EngineState::Running));
        assert!(EngineState::Running.can_transition_to(EngineState::Stopped));
        assert!(EngineState::Stopped.can_transition_to(EngineState::Running));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!EngineState::NotStarted.can_transition_to(EngineState::Idle));
        assert!(!EngineState::Idle.can_transition_to(EngineState::Stopped));
        assert!(!EngineState::Stopped.can_transition_to(EngineState::Idle));
        assert!(!EngineState::Faulted.can_transition_to(EngineState::Stopped));
    }

    #[test]
    fn ordering_matches_lifecycle() {
        assert!(EngineState::NotStarted < EngineState::Idle);
        assert!(EngineState::Idle < EngineState::Running);
        assert!(EngineState::Running < EngineState::Stopped);
        assert!(EngineState::Stopped < EngineState::Faulted);
    }

    #[test]
    fn transition_history_capped() {
        let mut log = TransitionLog::default();
        log.record(EngineState::NotStarted, EngineState::Running);
        for _ in 0..250 {
            log.record(EngineState::Running, EngineState::Idle);
            log.record(EngineState::Idle, EngineState::Running);
        }
        assert!(log.entries().len() <= 200);
    }

    #[test]
    fn self_transitions_not_recorded() {
        let mut log = TransitionLog::default();
        log.record(EngineState::Idle, EngineState::Idle);
        assert!(log.entries().is_empty());
    }

    #[test]
    fn engine_state_display() {
        assert_eq!(EngineState::NotStarted.to_string(), "not_started");
        assert_eq!(EngineState::Faulted.to_string(), "faulted");
    }

    #[test]
    fn engine_state_serde() {
        let json = serde_json::to_string(&EngineState::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }
}
