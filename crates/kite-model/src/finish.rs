use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Why the agent stopped a job's process early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalReason {
    /// The control plane (or an operator) canceled the job.
    Cancel,
    /// The agent itself is shutting down.
    AgentStop,
    /// The process could not be started at all.
    ProcessRunError,
}

impl SignalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalReason::Cancel => "cancel",
            SignalReason::AgentStop => "agent_stop",
            SignalReason::ProcessRunError => "process_run_error",
        }
    }
}

impl fmt::Display for SignalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final report sent when the job's process has exited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFinish {
    /// Exit code of the process, `-1` if it never ran or died by signal.
    pub exit_status: i32,
    /// Name of the terminating signal (e.g. `SIGKILL`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_reason: Option<SignalReason>,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    /// Number of log chunks that could not be delivered.
    pub chunks_failed_count: u64,
}
