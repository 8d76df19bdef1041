//! One job, start to finish.
//!
//! The runner marks the job started, builds its environment and output
//! pipeline, spawns the telemetry tasks and the process, and after the process
//! exits shuts everything down in order before reporting the finish.
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use kite_core::retry;
use kite_exec::{
    ExecError, MultiWriter, OutputBuffer, OutputPipeline, Passthrough, Process, ProcessConfig,
    WaitStatus,
};
use kite_model::{Job, JobFinish, SignalReason};
use kite_stream::{
    ApiError, CancellationWatcher, ControlPlane, HeaderTimesStreamer, JobHandle, LogStreamer,
};
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::error::RunnerError;

#[derive(Default)]
struct CancelState {
    requests: u32,
    reason: Option<SignalReason>,
    process: Option<Arc<Process>>,
}

pub struct JobRunner {
    job: Job,
    cfg: AgentConfig,
    api: Arc<dyn ControlPlane>,
    /// Agent-wide shutdown; firing it stops the job with `agent_stop`.
    shutdown: CancellationToken,
    cancel: Mutex<CancelState>,
    started: CancellationToken,
    done: CancellationToken,
    running: Mutex<bool>,
}

/// How the process part of a job ended.
struct Exit {
    status: WaitStatus,
    run_error: bool,
}

impl JobRunner {
    pub fn new(
        job: Job,
        cfg: AgentConfig,
        api: Arc<dyn ControlPlane>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            job,
            cfg,
            api,
            shutdown,
            cancel: Mutex::new(CancelState::default()),
            started: CancellationToken::new(),
            done: CancellationToken::new(),
            running: Mutex::new(false),
        })
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Stop the job's process.
    ///
    /// The first request interrupts, any further request terminates. A
    /// request made before the process exists keeps it from starting.
    pub fn cancel(&self, reason: SignalReason) {
        let (requests, process) = {
            let mut st = lock(&self.cancel);
            st.requests += 1;
            st.reason.get_or_insert(reason);
            (st.requests, st.process.clone())
        };
        info!(target: "kite.agent.runner", job_id = %self.job.id, %reason, requests, "job cancel requested");

        match process {
            Some(p) if requests == 1 => p.interrupt(),
            Some(p) => p.terminate(),
            None => {}
        }
    }

    /// Run the job and report its finish.
    ///
    /// Only an invalid configuration or a job that could not be marked as
    /// started returns an error; everything after that ends in a finish report.
    pub async fn run(self: &Arc<Self>) -> Result<JobFinish, RunnerError> {
        self.cfg.validate()?;
        {
            let mut running = lock(&self.running);
            if *running {
                return Err(RunnerError::AlreadyRunning);
            }
            *running = true;
        }

        let job_id = self.job.id.as_str();
        self.start_job().await?;
        info!(target: "kite.agent.runner", job_id, "job started");

        // Stream tasks outlive the process; only the agent shutdown aborts them.
        let ctx = self.shutdown.child_token();

        let buffer = OutputBuffer::new();
        let mut sinks = MultiWriter::new().with_sink("buffer", buffer.clone());
        let log_file = self.open_log_file(&mut sinks);
        if let Some(format) = self.cfg.log_to_stdout {
            sinks.push("stdout", Passthrough::new(std::io::stdout(), format, job_id));
        }

        let headers = HeaderTimesStreamer::new(
            job_id,
            Arc::clone(&self.api),
            self.cfg.header_times.clone(),
            ctx.clone(),
        );
        let pipeline = OutputPipeline::new(self.cfg.pipeline.clone(), sinks, headers.clone());
        let streamer = Arc::new(LogStreamer::new(
            &self.job,
            Arc::clone(&self.api),
            self.cfg.log_streamer.clone(),
            ctx.clone(),
        ));
        headers.start();
        streamer.start().await;

        let watch_ctx = ctx.child_token();
        let watcher = CancellationWatcher::new(
            job_id,
            Arc::clone(&self.api),
            Arc::clone(self) as Arc<dyn JobHandle>,
        )
        .with_interval(
            self.job
                .status_interval()
                .unwrap_or(self.cfg.cancel_poll_interval),
        );
        let watch_task = tokio::spawn({
            let ctx = watch_ctx.clone();
            async move { watcher.run(ctx).await }
        });

        let flush_stop = CancellationToken::new();
        let flush_task = tokio::spawn(flush_loop(
            buffer.clone(),
            Arc::clone(&streamer),
            self.cfg.log_flush_interval,
            flush_stop.clone(),
        ));

        let stop_task = tokio::spawn({
            let this = Arc::clone(self);
            async move {
                tokio::select! {
                    _ = this.done.cancelled() => {}
                    _ = this.shutdown.cancelled() => this.cancel(SignalReason::AgentStop),
                }
            }
        });

        let exit = self.execute(&pipeline).await;
        self.done.cancel();

        pipeline.close().await;
        headers.stop().await;
        flush_stop.cancel();
        if let Err(e) = flush_task.await {
            warn!(target: "kite.agent.runner", job_id, error = %e, "log flush task failed");
        }
        flush(&buffer, &streamer).await;
        streamer.stop().await;
        watch_ctx.cancel();
        if let Err(e) = watch_task.await {
            warn!(target: "kite.agent.runner", job_id, error = %e, "cancellation watcher failed");
        }
        stop_task.abort();
        drop(log_file);

        let finish = JobFinish {
            exit_status: exit.status.exit_code(),
            signal: exit.status.signal_name(),
            signal_reason: if exit.run_error {
                Some(SignalReason::ProcessRunError)
            } else {
                lock(&self.cancel).reason
            },
            finished_at: OffsetDateTime::now_utc(),
            chunks_failed_count: streamer.failed_chunks(),
        };
        self.finish_job(&finish).await;
        Ok(finish)
    }

    async fn start_job(&self) -> Result<(), RunnerError> {
        let (api, job_id) = (&self.api, self.job.id.as_str());
        let started_at = OffsetDateTime::now_utc();
        retry("start_job", &self.cfg.start_retry, &self.shutdown, |_| async move {
            api.start_job(job_id, started_at)
                .await
                .map_err(ApiError::into_attempt)
        })
        .await
        .map_err(|e| {
            error!(target: "kite.agent.runner", job_id, error = %e, "could not start job");
            RunnerError::Start(e)
        })
    }

    /// Build the environment, then spawn and wait for the process.
    async fn execute(&self, pipeline: &OutputPipeline) -> Exit {
        let job_id = self.job.id.as_str();
        let failed = |pipeline: &OutputPipeline, msg: String| {
            error!(target: "kite.agent.runner", job_id, error = %msg, "process did not run");
            pipeline.write_notice(&format!("kite: {msg}"));
            Exit {
                status: WaitStatus::NOT_RUN,
                run_error: true,
            }
        };

        let env = match self.cfg.env_builder().build(&self.job, &self.cfg.env) {
            Ok(env) => env,
            Err(e) => return failed(pipeline, format!("failed to prepare job environment: {e}")),
        };
        for warning in env.warnings() {
            pipeline.write_notice(&format!("kite: warning: {warning}"));
        }

        let Some(writer) = pipeline.take_writer() else {
            return failed(pipeline, "job output is already in use".into());
        };
        let process = Process::new(
            ProcessConfig {
                argv: self.cfg.bootstrap.clone(),
                env: env.to_pairs(),
                env_remove: env.secret_keys().to_vec(),
                dir: self.cfg.work_dir.clone(),
                pty: self.cfg.pty,
                interrupt_signal: self.cfg.env.cancel_signal,
                grace_period: self.cfg.cancel_grace_period,
                ..Default::default()
            },
            writer,
        );

        {
            let mut st = lock(&self.cancel);
            st.process = Some(Arc::clone(&process));
            if st.reason.is_some() {
                process.interrupt();
            }
        }

        match process.start().await {
            Ok(()) => {
                debug!(target: "kite.agent.runner", job_id, pid = process.pid(), "process running");
                self.started.cancel();
            }
            Err(ExecError::Cancelled) => {
                info!(target: "kite.agent.runner", job_id, "job canceled before its process started");
            }
            Err(e) => return failed(pipeline, format!("failed to start process: {e}")),
        }

        let status = process.wait().await;
        info!(target: "kite.agent.runner", job_id, %status, "process finished");
        drop(env);
        Exit {
            status,
            run_error: false,
        }
    }

    async fn finish_job(&self, finish: &JobFinish) {
        let (api, job_id) = (&self.api, self.job.id.as_str());
        let never = CancellationToken::new();
        let res = retry("finish_job", &self.cfg.finish_retry, &never, |_| async move {
            api.finish_job(job_id, finish)
                .await
                .map_err(ApiError::into_attempt)
        })
        .await;

        match res {
            Ok(()) => info!(
                target: "kite.agent.runner",
                job_id,
                exit_status = finish.exit_status,
                signal = finish.signal.as_deref().unwrap_or(""),
                chunks_failed = finish.chunks_failed_count,
                "job finished"
            ),
            Err(e) => warn!(target: "kite.agent.runner", job_id, error = %e, "could not report job finish"),
        }
    }

    fn open_log_file(&self, sinks: &mut MultiWriter) -> Option<NamedTempFile> {
        if !self.cfg.log_file {
            return None;
        }
        let opened = tempfile::Builder::new()
            .prefix("job-log-")
            .suffix(".log")
            .tempfile()
            .and_then(|file| Ok((file.reopen()?, file)));
        match opened {
            Ok((writer, file)) => {
                debug!(target: "kite.agent.runner", job_id = %self.job.id, path = %file.path().display(), "writing job log file");
                sinks.push("log_file", writer);
                Some(file)
            }
            Err(e) => {
                warn!(target: "kite.agent.runner", job_id = %self.job.id, error = %e, "could not create job log file");
                None
            }
        }
    }
}

#[async_trait]
impl JobHandle for JobRunner {
    async fn started(&self) {
        self.started.cancelled().await
    }

    async fn done(&self) {
        self.done.cancelled().await
    }

    async fn cancel(&self) {
        JobRunner::cancel(self, SignalReason::Cancel)
    }
}

async fn flush_loop(
    buffer: OutputBuffer,
    streamer: Arc<LogStreamer>,
    every: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => flush(&buffer, &streamer).await,
        }
    }
}

async fn flush(buffer: &OutputBuffer, streamer: &LogStreamer) {
    let data = buffer.take();
    if data.is_empty() {
        return;
    }
    if let Err(e) = streamer.process(&data).await {
        warn!(target: "kite.agent.runner", bytes = data.len(), error = %e, "dropping job output");
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
