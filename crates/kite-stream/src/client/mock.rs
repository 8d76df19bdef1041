use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use kite_model::{HeaderTimeBatch, JobFinish, JobState, JobStateResponse, LogChunk};
use time::OffsetDateTime;

use super::ControlPlane;
use crate::error::ApiError;

/// Scriptable in-memory control plane.
#[derive(Default)]
pub(crate) struct MockControlPlane {
    /// Status codes returned for successive attempts of each chunk sequence;
    /// an exhausted script means success.
    pub chunk_script: Mutex<HashMap<u64, VecDeque<u16>>>,
    pub chunk_attempts: Mutex<HashMap<u64, u32>>,
    pub chunks: Mutex<Vec<LogChunk>>,
    pub header_script: Mutex<VecDeque<u16>>,
    pub header_attempts: Mutex<u32>,
    pub batches: Mutex<Vec<HeaderTimeBatch>>,
    /// Returned in order by `job_state`; the last one repeats.
    pub states: Mutex<VecDeque<Result<JobState, u16>>>,
    pub state_polls: Mutex<u32>,
}

fn status(code: u16) -> ApiError {
    ApiError::Status {
        status: code,
        message: format!("scripted {code}"),
    }
}

impl MockControlPlane {
    pub fn script_chunk(&self, sequence: u64, codes: &[u16]) {
        self.chunk_script
            .lock()
            .unwrap()
            .insert(sequence, codes.iter().copied().collect());
    }

    pub fn uploaded_sequences(&self) -> Vec<u64> {
        let mut seqs: Vec<_> = self.chunks.lock().unwrap().iter().map(|c| c.sequence).collect();
        seqs.sort_unstable();
        seqs
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn start_job(&self, _job_id: &str, _started_at: OffsetDateTime) -> Result<(), ApiError> {
        Ok(())
    }

    async fn job_state(&self, _job_id: &str) -> Result<JobStateResponse, ApiError> {
        *self.state_polls.lock().unwrap() += 1;
        let mut states = self.states.lock().unwrap();
        let next = if states.len() > 1 {
            states.pop_front()
        } else {
            states.front().cloned()
        };
        match next.unwrap_or(Ok(JobState::Running)) {
            Ok(state) => Ok(JobStateResponse { state }),
            Err(code) => Err(status(code)),
        }
    }

    async fn save_header_times(
        &self,
        _job_id: &str,
        batch: &HeaderTimeBatch,
    ) -> Result<(), ApiError> {
        *self.header_attempts.lock().unwrap() += 1;
        if let Some(code) = self.header_script.lock().unwrap().pop_front() {
            return Err(status(code));
        }
        self.batches.lock().unwrap().push(batch.clone());
        Ok(())
    }

    async fn upload_chunk(&self, _job_id: &str, chunk: &LogChunk) -> Result<(), ApiError> {
        *self
            .chunk_attempts
            .lock()
            .unwrap()
            .entry(chunk.sequence)
            .or_default() += 1;
        let scripted = self
            .chunk_script
            .lock()
            .unwrap()
            .get_mut(&chunk.sequence)
            .and_then(VecDeque::pop_front);
        if let Some(code) = scripted {
            return Err(status(code));
        }
        self.chunks.lock().unwrap().push(chunk.clone());
        Ok(())
    }

    async fn finish_job(&self, _job_id: &str, _finish: &JobFinish) -> Result<(), ApiError> {
        Ok(())
    }
}
