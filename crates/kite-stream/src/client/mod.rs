//! Control-plane API used by the streaming pipelines and the job runner.
use std::time::Duration;

use async_trait::async_trait;
use kite_core::RetryPolicy;
use kite_model::{HeaderTimeBatch, JobFinish, JobStateResponse, LogChunk};
use time::OffsetDateTime;

use crate::error::ApiError;

mod http;
pub use http::HttpControlPlane;

#[cfg(test)]
pub(crate) mod mock;

#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    /// Mark the job as running.
    async fn start_job(&self, job_id: &str, started_at: OffsetDateTime) -> Result<(), ApiError>;

    async fn job_state(&self, job_id: &str) -> Result<JobStateResponse, ApiError>;

    async fn save_header_times(&self, job_id: &str, batch: &HeaderTimeBatch)
    -> Result<(), ApiError>;

    async fn upload_chunk(&self, job_id: &str, chunk: &LogChunk) -> Result<(), ApiError>;

    async fn finish_job(&self, job_id: &str, finish: &JobFinish) -> Result<(), ApiError>;
}

/// 7 attempts, 2s doubling up to 60s.
pub fn start_job_policy() -> RetryPolicy {
    RetryPolicy::exponential(Duration::from_secs(2), Duration::from_secs(60)).with_max_attempts(7)
}

/// Retries forever, 1s plus up to 1s of jitter.
pub fn finish_job_policy() -> RetryPolicy {
    RetryPolicy::constant(Duration::from_secs(1)).with_jitter(Duration::from_secs(1))
}
