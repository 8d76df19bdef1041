//! Remote cancellation.
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ControlPlane;

/// The running job as seen by the watcher.
#[async_trait]
pub trait JobHandle: Send + Sync + 'static {
    /// Resolves once the job's process has started.
    async fn started(&self);
    /// Resolves once the job's process has exited.
    async fn done(&self);
    /// Stop the job because the control plane asked for it.
    async fn cancel(&self);
}

pub struct CancellationWatcher {
    job_id: String,
    api: Arc<dyn ControlPlane>,
    handle: Arc<dyn JobHandle>,
    interval: Duration,
    fired: Mutex<bool>,
}

impl CancellationWatcher {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new(
        job_id: impl Into<String>,
        api: Arc<dyn ControlPlane>,
        handle: Arc<dyn JobHandle>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            api,
            handle,
            interval: Self::DEFAULT_INTERVAL,
            fired: Mutex::new(false),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.interval = interval;
        }
        self
    }

    /// Returns `true` once the handle has been canceled.
    pub fn fired(&self) -> bool {
        *self.fired.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Poll until the job is done or `ctx` is cancelled.
    pub async fn run(&self, ctx: CancellationToken) {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => return,
            _ = self.handle.started() => {}
        }
        debug!(target: "kite.stream.cancel", job_id = %self.job_id, interval_ms = self.interval.as_millis() as u64, "watching for cancellation");

        let mut done = self.handle.done();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                _ = &mut done => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                _ = self.poll() => {}
            }
        }
        debug!(target: "kite.stream.cancel", job_id = %self.job_id, "cancellation watcher stopped");
    }

    async fn poll(&self) {
        let state = match self.api.job_state(&self.job_id).await {
            Ok(resp) => resp.state,
            Err(e) => {
                warn!(target: "kite.stream.cancel", job_id = %self.job_id, error = %e, "job state poll failed");
                return;
            }
        };
        if !state.is_cancel_requested() {
            return;
        }

        {
            let mut fired = self.fired.lock().unwrap_or_else(PoisonError::into_inner);
            if *fired {
                return;
            }
            *fired = true;
        }
        info!(target: "kite.stream.cancel", job_id = %self.job_id, %state, "cancellation requested by control plane");
        self.handle.cancel().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use kite_model::JobState;

    use super::*;
    use crate::client::mock::MockControlPlane;

    #[derive(Default)]
    struct FakeJob {
        started: CancellationToken,
        done: CancellationToken,
        cancels: AtomicU32,
    }

    #[async_trait]
    impl JobHandle for FakeJob {
        async fn started(&self) {
            self.started.cancelled().await
        }

        async fn done(&self) {
            self.done.cancelled().await
        }

        async fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup(states: Vec<Result<JobState, u16>>) -> (Arc<MockControlPlane>, Arc<FakeJob>, Arc<CancellationWatcher>) {
        let api = Arc::new(MockControlPlane::default());
        api.states.lock().unwrap().extend(states);
        let job = Arc::new(FakeJob::default());
        let watcher = Arc::new(CancellationWatcher::new(
            "job-1",
            Arc::clone(&api) as Arc<dyn ControlPlane>,
            Arc::clone(&job) as Arc<dyn JobHandle>,
        ));
        (api, job, watcher)
    }

    #[tokio::test(start_paused = true)]
    async fn cancels_exactly_once() {
        use JobState::*;
        let (api, job, watcher) = setup(vec![Ok(Running), Ok(Canceling), Ok(Canceling), Ok(Canceled)]);
        let ctx = CancellationToken::new();

        let w = Arc::clone(&watcher);
        let c = ctx.clone();
        let task = tokio::spawn(async move { w.run(c).await });

        job.started.cancel();
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        job.done.cancel();
        task.await.unwrap();

        assert!(*api.state_polls.lock().unwrap() >= 4);
        assert_eq!(job.cancels.load(Ordering::SeqCst), 1);
        assert!(watcher.fired());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_errors_do_not_stop_watching() {
        let (api, job, watcher) = setup(vec![Err(500), Err(503), Ok(JobState::Canceling)]);
        let ctx = CancellationToken::new();

        let w = Arc::clone(&watcher);
        let c = ctx.clone();
        let task = tokio::spawn(async move { w.run(c).await });

        job.started.cancel();
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        ctx.cancel();
        task.await.unwrap();

        assert!(*api.state_polls.lock().unwrap() >= 3);
        assert_eq!(job.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_start_and_honors_context() {
        let (api, _job, watcher) = setup(vec![Ok(JobState::Canceling)]);
        let ctx = CancellationToken::new();

        let w = Arc::clone(&watcher);
        let c = ctx.clone();
        let task = tokio::spawn(async move { w.run(c).await });

        tokio::time::sleep(Duration::from_secs(10)).await;
        ctx.cancel();
        task.await.unwrap();

        assert_eq!(*api.state_polls.lock().unwrap(), 0);
        assert!(!watcher.fired());
    }

    #[tokio::test(start_paused = true)]
    async fn status_interval_overrides_default() {
        let (api, job, watcher) = setup(vec![Ok(JobState::Running)]);
        let watcher = Arc::new(
            Arc::try_unwrap(watcher)
                .ok()
                .unwrap()
                .with_interval(Duration::from_secs(5)),
        );
        let ctx = CancellationToken::new();

        let w = Arc::clone(&watcher);
        let c = ctx.clone();
        let task = tokio::spawn(async move { w.run(c).await });

        job.started.cancel();
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        ctx.cancel();
        task.await.unwrap();

        // Immediate first tick, then at 5s and 10s.
        assert_eq!(*api.state_polls.lock().unwrap(), 3);
    }
}
