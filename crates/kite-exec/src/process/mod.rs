//! Child process supervision.
//!
//! A [`Process`] spawns one child, merges its stdout/stderr into a single
//! writer, and exposes one-shot `started` / `done` signals. Interrupts escalate
//! to a forced kill once the grace period runs out.
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{ExecError, ExecResult};
use crate::signal::{DefaultSignaller, Signal, Signaller};

mod status;
pub use status::WaitStatus;

#[cfg(all(unix, feature = "pty"))]
mod pty;

const COPY_BUF_SIZE: usize = 32 * 1024;

/// Process configuration.
#[derive(Clone, Debug)]
pub struct ProcessConfig {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    /// Variables set on top of the inherited agent environment.
    pub env: Vec<(String, String)>,
    /// Inherited variables the child must not see.
    pub env_remove: Vec<String>,
    /// Working directory; `None` inherits the agent's.
    pub dir: Option<PathBuf>,
    /// Run the child attached to a pseudo-terminal.
    pub pty: bool,
    /// Signal sent by [`Process::interrupt`].
    pub interrupt_signal: Signal,
    /// Time between interrupt and forced termination.
    pub grace_period: Duration,
    /// How long to wait for the output pipe to drain after the child exits.
    pub output_drain_timeout: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            argv: Vec::new(),
            env: Vec::new(),
            env_remove: Vec::new(),
            dir: None,
            pty: false,
            interrupt_signal: Signal::Term,
            grace_period: Duration::from_secs(10),
            output_drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Lifecycle of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    Starting,
    Running,
    Interrupting,
    Terminated,
    Done,
}

/// Stop request that arrived while spawning; applied right after spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Interrupt,
    Terminate,
}

struct State {
    phase: Phase,
    pending: Option<Pending>,
}

pub struct Process {
    cfg: ProcessConfig,
    signaller: Arc<dyn Signaller>,
    output: Mutex<Option<Box<dyn Write + Send>>>,
    state: Mutex<State>,
    pid: AtomicU32,
    started: CancellationToken,
    done: CancellationToken,
    kill: Notify,
    status: OnceLock<WaitStatus>,
}

impl Process {
    /// Create a process that writes its combined output into `output`.
    pub fn new(cfg: ProcessConfig, output: Box<dyn Write + Send>) -> Arc<Self> {
        Self::with_signaller(cfg, output, Arc::new(DefaultSignaller))
    }

    pub fn with_signaller(
        cfg: ProcessConfig,
        output: Box<dyn Write + Send>,
        signaller: Arc<dyn Signaller>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            signaller,
            output: Mutex::new(Some(output)),
            state: Mutex::new(State {
                phase: Phase::NotStarted,
                pending: None,
            }),
            pid: AtomicU32::new(0),
            started: CancellationToken::new(),
            done: CancellationToken::new(),
            kill: Notify::new(),
            status: OnceLock::new(),
        })
    }

    /// Spawn the child.
    ///
    /// Returns once the child is running. Spawn failures are returned here and
    /// also complete `done()` so that nobody waits forever.
    pub async fn start(self: &Arc<Self>) -> ExecResult<()> {
        {
            let mut state = self.lock_state();
            match state.phase {
                Phase::NotStarted => state.phase = Phase::Starting,
                Phase::Done => return Err(ExecError::Cancelled),
                _ => return Err(ExecError::AlreadyStarted),
            }
        }

        let spawned = self.spawn();
        let (child, copy) = match spawned {
            Ok(parts) => parts,
            Err(e) => {
                self.finish(WaitStatus::NOT_RUN);
                return Err(e);
            }
        };

        let pid = child.id().unwrap_or(0);
        self.pid.store(pid, Ordering::SeqCst);

        let pending = {
            let mut state = self.lock_state();
            state.phase = Phase::Running;
            state.pending.take()
        };

        info!(target: "kite.exec.process", pid, argv = ?self.cfg.argv, pty = self.cfg.pty, "process started");
        self.started.cancel();

        let this = Arc::clone(self);
        tokio::spawn(async move { this.wait_child(child, copy).await });

        match pending {
            Some(Pending::Interrupt) => {
                debug!(target: "kite.exec.process", pid, "applying interrupt requested during spawn");
                self.interrupt();
            }
            Some(Pending::Terminate) => {
                debug!(target: "kite.exec.process", pid, "applying terminate requested during spawn");
                self.terminate();
            }
            None => {}
        }
        Ok(())
    }

    fn spawn(&self) -> ExecResult<(Child, JoinHandle<()>)> {
        let (program, args) = self.cfg.argv.split_first().ok_or(ExecError::MissingProgram)?;
        if program.is_empty() {
            return Err(ExecError::MissingProgram);
        }

        let output = lock(&self.output)
            .take()
            .ok_or(ExecError::AlreadyStarted)?;

        // The command owns our copies of the write side of the output pipe;
        // it must be dropped after spawn so EOF reaches the reader.
        let (child, reader) = {
            let mut cmd = Command::new(program);
            cmd.args(args).stdin(Stdio::null()).kill_on_drop(false);
            if let Some(dir) = &self.cfg.dir {
                cmd.current_dir(dir);
            }
            for key in &self.cfg.env_remove {
                cmd.env_remove(key);
            }
            cmd.envs(self.cfg.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

            let reader = self.attach_output(&mut cmd)?;

            trace!(target: "kite.exec.process", %program, ?args, "spawn");
            let child = cmd.spawn().map_err(|e| spawn_error(program, e))?;
            (child, reader)
        };

        let copy = tokio::task::spawn_blocking(move || copy_output(reader, output));
        Ok((child, copy))
    }

    fn attach_output(&self, cmd: &mut Command) -> ExecResult<Box<dyn Read + Send>> {
        if self.cfg.pty {
            cfg_if::cfg_if! {
                if #[cfg(all(unix, feature = "pty"))] {
                    return pty::attach(cmd).map_err(|e| ExecError::Pty(e.to_string()));
                } else {
                    return Err(ExecError::Pty("pty is not supported on this platform".into()));
                }
            }
        }

        let (reader, writer) = io::pipe()?;
        cmd.stdout(Stdio::from(writer.try_clone()?));
        cmd.stderr(Stdio::from(writer));
        #[cfg(unix)]
        cmd.process_group(0);
        Ok(Box::new(reader))
    }

    async fn wait_child(self: Arc<Self>, mut child: Child, copy: JoinHandle<()>) {
        let pid = self.pid();
        let status = loop {
            tokio::select! {
                res = child.wait() => break res,
                _ = self.kill.notified() => {
                    if let Err(e) = child.start_kill() {
                        debug!(target: "kite.exec.process", pid, error = %e, "kill after exit request failed");
                    }
                }
            }
        };

        let status = match status {
            Ok(status) => WaitStatus::from(status),
            Err(e) => {
                warn!(target: "kite.exec.process", pid, error = %e, "failed to collect exit status");
                WaitStatus::NOT_RUN
            }
        };

        if tokio::time::timeout(self.cfg.output_drain_timeout, copy)
            .await
            .is_err()
        {
            // A descendant still holds the output pipe open.
            warn!(
                target: "kite.exec.process",
                pid,
                timeout_ms = self.cfg.output_drain_timeout.as_millis() as u64,
                "output still open after exit; continuing without it"
            );
        }

        info!(target: "kite.exec.process", pid, %status, "process exited");
        self.finish(status);
    }

    fn finish(&self, status: WaitStatus) {
        let _ = self.status.set(status);
        self.lock_state().phase = Phase::Done;
        self.done.cancel();
    }

    /// Send the configured interrupt signal, escalating to [`terminate`]
    /// after the grace period.
    ///
    /// No-op once the process is interrupting or gone. Interrupting before
    /// start prevents the start.
    ///
    /// [`terminate`]: Process::terminate
    pub fn interrupt(self: &Arc<Self>) {
        let pid = {
            let mut state = self.lock_state();
            match state.phase {
                Phase::NotStarted => {
                    state.phase = Phase::Done;
                    drop(state);
                    info!(target: "kite.exec.process", "interrupted before start");
                    let _ = self.status.set(WaitStatus::NOT_RUN);
                    self.done.cancel();
                    return;
                }
                Phase::Starting => {
                    state.pending.get_or_insert(Pending::Interrupt);
                    return;
                }
                Phase::Running => state.phase = Phase::Interrupting,
                Phase::Interrupting | Phase::Terminated | Phase::Done => return,
            }
            self.pid()
        };

        let signal = self.cfg.interrupt_signal;
        info!(target: "kite.exec.process", pid, %signal, "interrupting process");
        if let Err(e) = self.signaller.interrupt(pid, signal) {
            warn!(target: "kite.exec.process", pid, %signal, error = %e, "failed to deliver interrupt");
        }

        let this = Arc::clone(self);
        let grace = self.cfg.grace_period;
        tokio::spawn(async move {
            tokio::select! {
                _ = this.done.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    warn!(
                        target: "kite.exec.process",
                        pid,
                        grace_ms = grace.as_millis() as u64,
                        "grace period elapsed; terminating"
                    );
                    this.terminate();
                }
            }
        });
    }

    /// Force-kill the process immediately. No-op once it has exited.
    pub fn terminate(&self) {
        let pid = {
            let mut state = self.lock_state();
            match state.phase {
                Phase::NotStarted => {
                    state.phase = Phase::Done;
                    drop(state);
                    let _ = self.status.set(WaitStatus::NOT_RUN);
                    self.done.cancel();
                    return;
                }
                Phase::Starting => {
                    state.pending = Some(Pending::Terminate);
                    return;
                }
                Phase::Running | Phase::Interrupting => state.phase = Phase::Terminated,
                Phase::Terminated | Phase::Done => return,
            }
            self.pid()
        };

        info!(target: "kite.exec.process", pid, "terminating process");
        if let Err(e) = self.signaller.terminate(pid) {
            warn!(target: "kite.exec.process", pid, error = %e, "failed to deliver terminate");
        }
        self.kill.notify_one();
    }

    /// Resolves once the child has been spawned.
    pub async fn started(&self) {
        self.started.cancelled().await
    }

    /// Resolves once the child has exited and its output has drained, or
    /// once it is known that it will never run.
    pub async fn done(&self) {
        self.done.cancelled().await
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Wait for the process to finish and return its status.
    pub async fn wait(&self) -> WaitStatus {
        self.done().await;
        self.status.get().copied().unwrap_or(WaitStatus::NOT_RUN)
    }

    /// Process id, or `0` if not started.
    #[inline]
    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> Phase {
        self.lock_state().phase
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        lock(&self.state)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn spawn_error(program: &str, err: io::Error) -> ExecError {
    match err.kind() {
        io::ErrorKind::NotFound => ExecError::NotFound(program.to_string()),
        io::ErrorKind::PermissionDenied => ExecError::PermissionDenied(program.to_string()),
        _ => ExecError::Spawn(format!("{program}: {err}")),
    }
}

fn copy_output(mut reader: Box<dyn Read + Send>, mut out: Box<dyn Write + Send>) {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = out.write_all(&buf[..n]) {
                    warn!(target: "kite.exec.process", error = %e, "writing process output failed");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(target: "kite.exec.process", error = %e, "reading process output failed");
                break;
            }
        }
    }
    let _ = out.flush();
}
