//! Single-job agent: starts a job on the control plane, runs its process and
//! streams its telemetry until it finishes.

mod config;
pub use config::AgentConfig;

mod error;
pub use error::RunnerError;

pub mod runner;
pub use runner::JobRunner;
