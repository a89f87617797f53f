//! Supervisor lifecycle states and the allowed transitions between them.

use std::fmt;

/// Lifecycle state of the backend supervisor.
///
/// The happy path runs strictly forward:
/// `Idle → ClearingPort → Validating → Spawning → AwaitingReady → Ready → Terminating → Terminated`.
/// `Failed` and `Terminated` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupervisorState {
    Idle,
    ClearingPort,
    Validating,
    Spawning,
    AwaitingReady,
    Ready,
    Terminating,
    Terminated,
    Failed,
}

impl SupervisorState {
    /// Returns true for states that accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ClearingPort => "clearing_port",
            Self::Validating => "validating",
            Self::Spawning => "spawning",
            Self::AwaitingReady => "awaiting_ready",
            Self::Ready => "ready",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns true if the supervisor may move from `from` to `to`.
///
/// `Idle → Terminating` covers a quit before startup began and
/// `AwaitingReady → Terminating` a quit observed between readiness probes.
pub fn can_transition(from: SupervisorState, to: SupervisorState) -> bool {
    use SupervisorState::{
        AwaitingReady, ClearingPort, Failed, Idle, Ready, Spawning, Terminated, Terminating,
        Validating,
    };

    matches!(
        (from, to),
        (Idle, ClearingPort)
            | (Idle, Terminating)
            | (ClearingPort, Validating)
            | (Validating, Spawning)
            | (Validating, Failed)
            | (Spawning, AwaitingReady)
            | (Spawning, Failed)
            | (AwaitingReady, Ready)
            | (AwaitingReady, Failed)
            | (AwaitingReady, Terminating)
            | (Ready, Terminating)
            | (Ready, Failed)
            | (Terminating, Terminated)
    )
}

#[cfg(test)]
mod tests {
    use super::SupervisorState::{
        AwaitingReady, ClearingPort, Failed, Idle, Ready, Spawning, Terminated, Terminating,
        Validating,
    };
    use super::*;

    const ALL: [SupervisorState; 9] = [
        Idle,
        ClearingPort,
        Validating,
        Spawning,
        AwaitingReady,
        Ready,
        Terminating,
        Terminated,
        Failed,
    ];

    #[test]
    fn happy_path_is_allowed_in_order() {
        let path = [
            Idle,
            ClearingPort,
            Validating,
            Spawning,
            AwaitingReady,
            Ready,
            Terminating,
            Terminated,
        ];
        for pair in path.windows(2) {
            assert!(
                can_transition(pair[0], pair[1]),
                "{} -> {} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn failed_is_reachable_only_from_validating_spawning_awaiting_and_ready() {
        let sources: Vec<SupervisorState> = ALL
            .iter()
            .copied()
            .filter(|from| can_transition(*from, Failed))
            .collect();
        assert_eq!(sources, vec![Validating, Spawning, AwaitingReady, Ready]);
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for to in ALL {
            assert!(!can_transition(Failed, to), "failed -> {to}");
            assert!(!can_transition(Terminated, to), "terminated -> {to}");
        }
        assert!(Failed.is_terminal());
        assert!(Terminated.is_terminal());
        assert!(!Ready.is_terminal());
    }

    #[test]
    fn no_backward_transitions() {
        assert!(!can_transition(Ready, AwaitingReady));
        assert!(!can_transition(AwaitingReady, Spawning));
        assert!(!can_transition(Validating, ClearingPort));
        assert!(!can_transition(Terminating, Ready));
    }

    #[test]
    fn displays_as_snake_case() {
        assert_eq!(AwaitingReady.to_string(), "awaiting_ready");
        assert_eq!(ClearingPort.as_str(), "clearing_port");
    }
}
