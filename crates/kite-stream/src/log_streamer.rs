//! Chunked log upload.
//!
//! [`LogStreamer::process`] cuts incoming output into sequenced chunks and
//! queues them for a small pool of upload workers. Chunks may complete in any
//! order; the control plane reassembles them by sequence and offset.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use kite_core::{RetryPolicy, retry};
use kite_model::{Job, LogChunk};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ControlPlane;
use crate::error::{ApiError, StreamError};

#[derive(Debug, Clone)]
pub struct LogStreamerConfig {
    pub workers: usize,
    /// Chunks waiting for a worker; `process` waits while it is full.
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for LogStreamerConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            queue_capacity: 1024,
            retry: RetryPolicy::constant(Duration::from_secs(5))
                .with_jitter(Duration::from_secs(1))
                .with_deadline(Duration::from_secs(48 * 60 * 60)),
        }
    }
}

struct Splitter {
    sequence: u64,
    offset: u64,
    truncated: bool,
    tx: Option<mpsc::Sender<LogChunk>>,
}

pub struct LogStreamer {
    job_id: String,
    api: Arc<dyn ControlPlane>,
    cfg: LogStreamerConfig,
    max_chunk: usize,
    max_log: u64,
    cancel: CancellationToken,
    splitter: tokio::sync::Mutex<Splitter>,
    workers: Mutex<Option<JoinSet<()>>>,
    failed: Arc<AtomicU64>,
}

impl LogStreamer {
    pub fn new(
        job: &Job,
        api: Arc<dyn ControlPlane>,
        cfg: LogStreamerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id: job.id.clone(),
            api,
            cfg,
            max_chunk: usize::try_from(job.chunks_max_size_bytes)
                .unwrap_or(usize::MAX)
                .max(1),
            max_log: job.log_max_size_bytes,
            cancel,
            splitter: tokio::sync::Mutex::new(Splitter {
                sequence: 0,
                offset: 0,
                truncated: false,
                tx: None,
            }),
            workers: Mutex::new(None),
            failed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn the upload workers.
    pub async fn start(&self) {
        let mut splitter = self.splitter.lock().await;
        let mut workers = lock(&self.workers);
        if splitter.tx.is_some() || workers.is_some() {
            return;
        }

        let (tx, rx) = mpsc::channel(self.cfg.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut set = JoinSet::new();
        for id in 0..self.cfg.workers.max(1) {
            let worker = Worker {
                id,
                job_id: self.job_id.clone(),
                api: Arc::clone(&self.api),
                retry: self.cfg.retry.clone(),
                cancel: self.cancel.clone(),
                failed: Arc::clone(&self.failed),
                rx: Arc::clone(&rx),
            };
            set.spawn(worker.run());
        }

        splitter.tx = Some(tx);
        *workers = Some(set);
        debug!(target: "kite.stream.chunks", job_id = %self.job_id, workers = self.cfg.workers, "log streamer started");
    }

    /// Split `data` into chunks and queue them for upload.
    ///
    /// Bytes past the job's log size limit are dropped.
    pub async fn process(&self, data: &[u8]) -> Result<(), StreamError> {
        if data.is_empty() {
            return Ok(());
        }
        let mut s = self.splitter.lock().await;
        let Some(tx) = s.tx.clone() else {
            return Err(StreamError::Closed);
        };

        let room = self.max_log.saturating_sub(s.offset);
        let keep = usize::try_from(room).map_or(data.len(), |room| data.len().min(room));
        if keep < data.len() && !s.truncated {
            s.truncated = true;
            warn!(
                target: "kite.stream.chunks",
                job_id = %self.job_id,
                limit = self.max_log,
                "job log exceeded size limit; further output is not uploaded"
            );
        }

        for piece in data[..keep].chunks(self.max_chunk) {
            let chunk = LogChunk::new(s.sequence, s.offset, piece.to_vec());
            s.sequence += 1;
            s.offset = chunk.end();

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(StreamError::Canceled),
                res = tx.send(chunk) => res.map_err(|_| StreamError::Closed)?,
            }
        }
        Ok(())
    }

    /// Close the queue and wait for the workers to finish what is queued.
    pub async fn stop(&self) {
        let tx = self.splitter.lock().await.tx.take();
        drop(tx);

        let workers = lock(&self.workers).take();
        if let Some(mut workers) = workers {
            while let Some(res) = workers.join_next().await {
                if let Err(e) = res {
                    warn!(target: "kite.stream.chunks", job_id = %self.job_id, error = %e, "chunk worker failed");
                }
            }
        }

        let s = self.splitter.lock().await;
        info!(
            target: "kite.stream.chunks",
            job_id = %self.job_id,
            chunks = s.sequence,
            bytes = s.offset,
            failed = self.failed_chunks(),
            "log streamer stopped"
        );
    }

    /// Chunks given up on so far.
    pub fn failed_chunks(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }
}

struct Worker {
    id: usize,
    job_id: String,
    api: Arc<dyn ControlPlane>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    failed: Arc<AtomicU64>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<LogChunk>>>,
}

impl Worker {
    async fn run(self) {
        loop {
            let next = {
                let mut rx = self.rx.lock().await;
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    chunk = rx.recv() => chunk,
                }
            };
            let Some(chunk) = next else { break };
            self.upload(chunk).await;
        }
        debug!(target: "kite.stream.chunks", job_id = %self.job_id, worker = self.id, "chunk worker exiting");
    }

    async fn upload(&self, chunk: LogChunk) {
        let (api, job_id, c) = (&self.api, self.job_id.as_str(), &chunk);
        let res = retry("upload_chunk", &self.retry, &self.cancel, |_| async move {
            api.upload_chunk(job_id, c)
                .await
                .map_err(ApiError::into_attempt)
        })
        .await;

        match res {
            Ok(()) => debug!(
                target: "kite.stream.chunks",
                job_id,
                sequence = chunk.sequence,
                size = chunk.size,
                "uploaded chunk"
            ),
            Err(e) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                warn!(
                    target: "kite.stream.chunks",
                    job_id,
                    sequence = chunk.sequence,
                    attempts = e.attempts(),
                    error = %e,
                    "giving up on chunk"
                );
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
