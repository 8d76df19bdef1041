//! Section header timestamps.
//!
//! The output pipeline offers every line to [`HeaderTimesStreamer::scan`].
//! Header lines get a wall-clock timestamp that is queued, batched and
//! uploaded in the background so the log viewer can show per-section timings.
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;

use kite_core::{LineScanner, RetryPolicy, retry};
use kite_model::HeaderTimeBatch;
use regex::Regex;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ControlPlane;
use crate::error::ApiError;

static ANSI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b_[^\x07]*\x07")
        .expect("valid ansi escape regex")
});

static HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:---|\+\+\+|~~~)\s").expect("valid header regex"));

static HEADER_EXPANSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\^\^\^\s+\+\+\+").expect("valid header expansion regex"));

/// `--- `, `+++ ` or `~~~ ` at the start of the line, ignoring escapes.
pub fn is_header(line: &str) -> bool {
    HEADER.is_match(&ANSI.replace_all(line, ""))
}

/// `^^^ +++`: re-opens the previous section.
pub fn is_header_expansion(line: &str) -> bool {
    HEADER_EXPANSION.is_match(&ANSI.replace_all(line, ""))
}

#[derive(Debug, Clone)]
pub struct HeaderTimesConfig {
    /// How long to keep collecting timestamps before uploading a batch.
    pub batch_window: Duration,
    /// Pending timestamps; a full queue blocks the scanner.
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for HeaderTimesConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_secs(1),
            queue_capacity: 1000,
            retry: RetryPolicy::constant(Duration::from_secs(5)).with_max_attempts(10),
        }
    }
}

pub struct HeaderTimesStreamer {
    job_id: String,
    api: Arc<dyn ControlPlane>,
    cfg: HeaderTimesConfig,
    cancel: CancellationToken,
    /// `None` when not streaming. Held across the blocking send so that
    /// `stop` cannot close the queue under a sender.
    tx: Mutex<Option<mpsc::Sender<String>>>,
    run: Mutex<Option<JoinHandle<()>>>,
}

impl HeaderTimesStreamer {
    pub fn new(
        job_id: impl Into<String>,
        api: Arc<dyn ControlPlane>,
        cfg: HeaderTimesConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            job_id: job_id.into(),
            api,
            cfg,
            cancel,
            tx: Mutex::new(None),
            run: Mutex::new(None),
        })
    }

    /// Start accepting timestamps and spawn the upload loop.
    pub fn start(self: &Arc<Self>) {
        let mut run = lock(&self.run);
        if run.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel(self.cfg.queue_capacity.max(1));
        *lock(&self.tx) = Some(tx);

        let this = Arc::clone(self);
        *run = Some(tokio::spawn(async move { this.run(rx).await }));
        debug!(target: "kite.stream.headers", job_id = %self.job_id, "header time streamer started");
    }

    /// Close the queue, then wait for queued timestamps to be uploaded.
    ///
    /// Call once output has stopped flowing.
    pub async fn stop(&self) {
        drop(lock(&self.tx).take());

        let run = lock(&self.run).take();
        if let Some(run) = run
            && let Err(e) = run.await
        {
            warn!(target: "kite.stream.headers", job_id = %self.job_id, error = %e, "header time loop failed");
        }
    }

    fn record(&self, line: &str) {
        let tx = lock(&self.tx);
        let Some(tx) = tx.as_ref() else {
            return;
        };
        let now = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        if tx.blocking_send(now).is_err() {
            debug!(target: "kite.stream.headers", job_id = %self.job_id, %line, "header time loop gone; dropping");
        }
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<String>) {
        let mut next = 0u64;
        let mut uploads = JoinSet::new();

        loop {
            let first = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                t = rx.recv() => t,
            };
            let Some(first) = first else { break };

            let mut times = vec![first];
            let mut closed = false;
            let flush_at = Instant::now() + self.cfg.batch_window;
            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => { closed = true; break }
                    t = rx.recv() => match t {
                        Some(t) => times.push(t),
                        None => { closed = true; break }
                    },
                    _ = tokio::time::sleep_until(flush_at) => break,
                }
            }

            let batch = HeaderTimeBatch::new(next, times);
            next = batch.end;
            uploads.spawn(Arc::clone(&self).upload(batch));

            while let Some(res) = uploads.try_join_next() {
                if let Err(e) = res {
                    warn!(target: "kite.stream.headers", job_id = %self.job_id, error = %e, "header upload task failed");
                }
            }
            if closed {
                break;
            }
        }

        while let Some(res) = uploads.join_next().await {
            if let Err(e) = res {
                warn!(target: "kite.stream.headers", job_id = %self.job_id, error = %e, "header upload task failed");
            }
        }
        info!(target: "kite.stream.headers", job_id = %self.job_id, headers = next, "header time streamer stopped");
    }

    async fn upload(self: Arc<Self>, batch: HeaderTimeBatch) {
        let (api, job_id, b) = (&self.api, self.job_id.as_str(), &batch);
        let res = retry("save_header_times", &self.cfg.retry, &self.cancel, |_| async move {
            api.save_header_times(job_id, b)
                .await
                .map_err(ApiError::into_attempt)
        })
        .await;

        match res {
            Ok(()) => debug!(
                target: "kite.stream.headers",
                job_id,
                start = batch.start,
                end = batch.end,
                "uploaded header times"
            ),
            Err(e) => warn!(
                target: "kite.stream.headers",
                job_id,
                start = batch.start,
                end = batch.end,
                error = %e,
                "giving up on header times"
            ),
        }
    }
}

impl LineScanner for HeaderTimesStreamer {
    fn scan(&self, line: &str) -> bool {
        let header = is_header(line);
        if !header && !is_header_expansion(line) {
            return false;
        }
        if header {
            self.record(line);
        }
        true
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockControlPlane;

    #[test]
    fn detects_headers() {
        assert!(is_header("--- Running tests"));
        assert!(is_header("+++ Collapsed"));
        assert!(is_header("~~~ Setup"));
        assert!(is_header("\x1b[32m--- \x1b[0mgreen header"));
        assert!(is_header("\x1b_bk;t=1700000000000\x07--- stamped"));

        assert!(!is_header("---no space"));
        assert!(!is_header("  --- indented"));
        assert!(!is_header("-- two dashes"));
        assert!(!is_header("plain output"));
    }

    #[test]
    fn detects_header_expansions() {
        assert!(is_header_expansion("^^^ +++"));
        assert!(is_header_expansion("\x1b[1m^^^ +++\x1b[0m"));
        assert!(!is_header_expansion("^^^ ---"));
        assert!(!is_header_expansion("^^^+++"));
        assert!(!is_header("^^^ +++"));
    }

    fn streamer(api: Arc<MockControlPlane>, retry: RetryPolicy) -> Arc<HeaderTimesStreamer> {
        HeaderTimesStreamer::new(
            "job-1",
            api,
            HeaderTimesConfig {
                batch_window: Duration::from_millis(50),
                retry,
                ..Default::default()
            },
            CancellationToken::new(),
        )
    }

    async fn scan_all(s: &Arc<HeaderTimesStreamer>, lines: &'static [&'static str]) -> Vec<bool> {
        let s = Arc::clone(s);
        tokio::task::spawn_blocking(move || lines.iter().map(|l| s.scan(l)).collect())
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn not_streaming_only_classifies() {
        let api = Arc::new(MockControlPlane::default());
        let s = streamer(Arc::clone(&api), RetryPolicy::constant(Duration::ZERO));

        let verdicts = scan_all(&s, &["--- a", "x", "^^^ +++"]).await;
        assert_eq!(verdicts, vec![true, false, true]);
        s.stop().await;
        assert!(api.batches.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn batches_cover_contiguous_indices() {
        let api = Arc::new(MockControlPlane::default());
        let s = streamer(Arc::clone(&api), RetryPolicy::constant(Duration::ZERO));
        s.start();

        scan_all(&s, &["--- one", "noise", "+++ two", "^^^ +++"]).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        scan_all(&s, &["~~~ three"]).await;
        s.stop().await;

        let mut batches = api.batches.lock().unwrap().clone();
        batches.sort_by_key(|b| b.start);
        let ranges: Vec<_> = batches.iter().map(|b| b.range()).collect();
        assert_eq!(ranges, vec![0..2, 2..3]);
        assert!(batches[0].header_times.contains_key("1"));
        assert!(batches[1].header_times["2"].ends_with('Z'));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retries_transient_failures_and_stops_on_rejection() {
        let api = Arc::new(MockControlPlane::default());
        api.header_script.lock().unwrap().extend([500, 429]);
        let s = streamer(
            Arc::clone(&api),
            RetryPolicy::constant(Duration::from_millis(1)).with_max_attempts(10),
        );
        s.start();
        scan_all(&s, &["--- one"]).await;
        s.stop().await;

        assert_eq!(*api.header_attempts.lock().unwrap(), 3);
        assert_eq!(api.batches.lock().unwrap().len(), 1);

        let api = Arc::new(MockControlPlane::default());
        api.header_script.lock().unwrap().extend([422]);
        let s = streamer(
            Arc::clone(&api),
            RetryPolicy::constant(Duration::from_millis(1)).with_max_attempts(10),
        );
        s.start();
        scan_all(&s, &["--- one"]).await;
        s.stop().await;

        assert_eq!(*api.header_attempts.lock().unwrap(), 1);
        assert!(api.batches.lock().unwrap().is_empty());
    }

    #[test]
    fn queue_is_bounded_by_default() {
        assert_eq!(HeaderTimesConfig::default().queue_capacity, 1000);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn full_queue_blocks_scanner_until_drained() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let api = Arc::new(MockControlPlane::default());
        let s = HeaderTimesStreamer::new(
            "job-1",
            Arc::clone(&api) as Arc<dyn ControlPlane>,
            HeaderTimesConfig {
                batch_window: Duration::from_millis(10),
                queue_capacity: 3,
                retry: RetryPolicy::constant(Duration::ZERO),
            },
            CancellationToken::new(),
        );
        s.start();

        let scanned = Arc::new(AtomicUsize::new(0));
        let scanner = std::thread::spawn({
            let (s, scanned) = (Arc::clone(&s), Arc::clone(&scanned));
            move || {
                for i in 0..5 {
                    s.scan(&format!("--- section {i}"));
                    scanned.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        // The run loop shares this thread, so nothing drains while it sleeps.
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(scanned.load(Ordering::SeqCst), 3);
        assert!(!scanner.is_finished());

        for _ in 0..200 {
            if scanner.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(scanner.is_finished());
        scanner.join().unwrap();
        s.stop().await;

        assert_eq!(scanned.load(Ordering::SeqCst), 5);
        let uploaded: u64 = api.batches.lock().unwrap().iter().map(|b| b.end - b.start).sum();
        assert_eq!(uploaded, 5);
    }
}
