/// Role state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentState {
    Init,
    Connecting,
    Negotiating,
    /// Holds the leadership key, schedules and publishes jobs, also executes
    Scheduler,
    /// Executes offered jobs and watches the leader
    Executor,
    /// Terminal
    Recovery,
}

impl AgentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Recovery)
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Init => write!(f, "init"),
            AgentState::Connecting => write!(f, "connecting"),
            AgentState::Negotiating => write!(f, "negotiating"),
            AgentState::Scheduler => write!(f, "scheduler"),
            AgentState::Executor => write!(f, "executor"),
            AgentState::Recovery => write!(f, "recovery"),
        }
    }
}

/// What happened while running a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    Start,
    Connected,
    ConnectFailed,
    /// The leadership key was created by this agent
    Elected,
    /// Another agent holds the leadership key
    LeaderExists,
    ElectionFailed,
    /// Leadership key expired, was deleted or is held by someone else
    Failover,
    TaskFailed,
    ShutdownRequested,
}

impl std::fmt::Display for AgentEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentEvent::Start => write!(f, "start"),
            AgentEvent::Connected => write!(f, "connected"),
            AgentEvent::ConnectFailed => write!(f, "connect_failed"),
            AgentEvent::Elected => write!(f, "elected"),
            AgentEvent::LeaderExists => write!(f, "leader_exists"),
            AgentEvent::ElectionFailed => write!(f, "election_failed"),
            AgentEvent::Failover => write!(f, "failover"),
            AgentEvent::TaskFailed => write!(f, "task_failed"),
            AgentEvent::ShutdownRequested => write!(f, "shutdown_requested"),
        }
    }
}

/// Next state after `event` occurred in `state`.
///
/// Pairs with no meaning (an election result while connecting, say) lead to
/// `Recovery`, as does a shutdown request from any state.
pub fn transition(state: AgentState, event: AgentEvent) -> AgentState {
    use AgentEvent as E;
    use AgentState as S;

    match (state, event) {
        (S::Recovery, _) => S::Recovery,
        (_, E::ShutdownRequested) => S::Recovery,

        (S::Init, E::Start) => S::Connecting,

        (S::Connecting, E::Connected) => S::Negotiating,
        (S::Connecting, E::ConnectFailed) => S::Recovery,

        (S::Negotiating, E::Elected) => S::Scheduler,
        (S::Negotiating, E::LeaderExists) => S::Executor,
        (S::Negotiating, E::ElectionFailed) => S::Recovery,

        (S::Scheduler | S::Executor, E::Failover) => S::Negotiating,
        (S::Scheduler | S::Executor, E::TaskFailed) => S::Recovery,

        _ => S::Recovery,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_to_scheduler() {
        let mut state = AgentState::Init;
        for event in [AgentEvent::Start, AgentEvent::Connected, AgentEvent::Elected] {
            state = transition(state, event);
        }
        assert_eq!(state, AgentState::Scheduler);
    }

    #[test]
    fn test_leader_exists_makes_executor() {
        assert_eq!(
            transition(AgentState::Negotiating, AgentEvent::LeaderExists),
            AgentState::Executor
        );
    }

    #[test]
    fn test_connect_failure_is_fatal() {
        assert_eq!(
            transition(AgentState::Connecting, AgentEvent::ConnectFailed),
            AgentState::Recovery
        );
    }

    #[test]
    fn test_failover_returns_to_negotiating() {
        assert_eq!(
            transition(AgentState::Executor, AgentEvent::Failover),
            AgentState::Negotiating
        );
        assert_eq!(
            transition(AgentState::Scheduler, AgentEvent::Failover),
            AgentState::Negotiating
        );
    }

    #[test]
    fn test_task_failure_goes_to_recovery() {
        assert_eq!(
            transition(AgentState::Scheduler, AgentEvent::TaskFailed),
            AgentState::Recovery
        );
        assert_eq!(
            transition(AgentState::Negotiating, AgentEvent::ElectionFailed),
            AgentState::Recovery
        );
    }

    #[test]
    fn test_shutdown_from_any_state() {
        for state in [
            AgentState::Init,
            AgentState::Connecting,
            AgentState::Negotiating,
            AgentState::Scheduler,
            AgentState::Executor,
        ] {
            assert_eq!(
                transition(state, AgentEvent::ShutdownRequested),
                AgentState::Recovery
            );
        }
    }

    #[test]
    fn test_recovery_is_terminal() {
        assert!(AgentState::Recovery.is_terminal());
        assert_eq!(
            transition(AgentState::Recovery, AgentEvent::Start),
            AgentState::Recovery
        );
        assert_eq!(
            transition(AgentState::Recovery, AgentEvent::Failover),
            AgentState::Recovery
        );
    }

    #[test]
    fn test_unexpected_events_go_to_recovery() {
        assert_eq!(
            transition(AgentState::Init, AgentEvent::Elected),
            AgentState::Recovery
        );
        assert_eq!(
            transition(AgentState::Connecting, AgentEvent::Failover),
            AgentState::Recovery
        );
    }
}
