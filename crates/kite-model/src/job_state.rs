use std::fmt;

use serde::{Deserialize, Serialize};

/// Job state as reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for an agent.
    Scheduled,
    /// Assigned to an agent but not yet acknowledged.
    Assigned,
    /// Acknowledged by the agent.
    Accepted,
    /// Process is running.
    Running,
    /// Cancellation was requested; the agent must stop the process.
    Canceling,
    /// Cancellation completed.
    Canceled,
    /// Process finished (any exit status).
    Finished,
    /// Any state this agent does not know about.
    #[serde(other)]
    Unknown,
}

impl JobState {
    /// Returns `true` if the control plane wants the job stopped.
    pub fn is_cancel_requested(&self) -> bool {
        matches!(self, JobState::Canceling | JobState::Canceled)
    }

    /// Returns `true` if the job won't transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Canceled | JobState::Finished)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Assigned => "assigned",
            JobState::Accepted => "accepted",
            JobState::Running => "running",
            JobState::Canceling => "canceling",
            JobState::Canceled => "canceled",
            JobState::Finished => "finished",
            JobState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response body of a job state query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStateResponse {
    pub state: JobState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_requested_states() {
        assert!(JobState::Canceling.is_cancel_requested());
        assert!(JobState::Canceled.is_cancel_requested());

        assert!(!JobState::Running.is_cancel_requested());
        assert!(!JobState::Finished.is_cancel_requested());
        assert!(!JobState::Unknown.is_cancel_requested());
    }

    #[test]
    fn unknown_state_from_wire() {
        let resp: JobStateResponse =
            serde_json::from_str(r#"{"state":"timing_out"}"#).unwrap();
        assert_eq!(resp.state, JobState::Unknown);
    }

    #[test]
    fn serde_lowercase() {
        let json = serde_json::to_string(&JobState::Canceling).unwrap();
        assert_eq!(json, r#""canceling""#);
        assert_eq!(JobState::Canceling.to_string(), "canceling");
    }
}
