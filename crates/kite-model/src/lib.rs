//! Domain types shared between the job runner, the process layer and the
//! control-plane client.

mod job;
pub use job::{Job, JobEnv};

mod job_state;
pub use job_state::{JobState, JobStateResponse};

mod chunk;
pub use chunk::LogChunk;

mod header_times;
pub use header_times::HeaderTimeBatch;

mod finish;
pub use finish::{JobFinish, SignalReason};

/// Identifier of a job as assigned by the control plane.
pub type JobId = String;
