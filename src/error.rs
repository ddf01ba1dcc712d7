use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChronosError {
    #[error("Failed to connect to the coordination store: {0}")]
    ConnectionFailed(String),

    #[error("Coordination store error: {0}")]
    Cluster(String),

    #[error("Coordination store unavailable")]
    StoreUnavailable,

    #[error("No scheduler detected in the cluster")]
    NoSchedulerDetected,

    #[error("Scheduler leadership held by {0}")]
    LeadershipLost(String),

    #[error("Task canceled by user")]
    Canceled,

    #[error("Exceeded the number of max retries for job {0}")]
    ExhaustedRetries(String),

    #[error("Invalid schedule expression: {0}")]
    InvalidSchedule(String),

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("All role tasks exited without reporting an error")]
    RoleTasksExited,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChronosError {
    /// Errors that send an agent back to leadership negotiation instead of
    /// into recovery.
    pub fn is_failover(&self) -> bool {
        matches!(
            self,
            ChronosError::NoSchedulerDetected | ChronosError::LeadershipLost(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ChronosError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failover_errors() {
        assert!(ChronosError::NoSchedulerDetected.is_failover());
        assert!(ChronosError::LeadershipLost("10.0.0.2".into()).is_failover());
        assert!(!ChronosError::Canceled.is_failover());
        assert!(!ChronosError::StoreUnavailable.is_failover());
    }

    #[test]
    fn canceled_message() {
        assert_eq!(ChronosError::Canceled.to_string(), "Task canceled by user");
    }
}
