//! Output multiplexing.
//!
//! The supervisor writes raw process output into the writer handed out by
//! [`OutputPipeline::take_writer`]. Depending on [`TimestampMode`] the bytes go
//! straight to the sinks, get an inline timestamp escape, or are split into
//! lines and prefixed. Whole lines are offered to a [`LineScanner`] on a
//! dedicated blocking task fed through a bounded channel.
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use kite_core::LineScanner;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

mod buffer;
pub use buffer::OutputBuffer;

mod multi;
pub use multi::MultiWriter;

mod passthrough;
pub use passthrough::{Passthrough, PassthroughFormat};

mod timestamp;
pub use timestamp::{ansi_timestamp, line_prefix};

/// How output is timestamped on its way to the sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampMode {
    /// Inline APC escape before every write; no line scanning.
    Ansi,
    /// `[time] ` prefix on every non-header line.
    PlainLines,
    /// Unmodified output; lines are still scanned for headers.
    #[default]
    Plain,
}

impl FromStr for TimestampMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ansi" | "ansi-timestamps" => Ok(Self::Ansi),
            "lines" | "plain-lines" | "timestamp-lines" => Ok(Self::PlainLines),
            "plain" | "none" | "" => Ok(Self::Plain),
            other => Err(format!("unknown timestamp mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub mode: TimestampMode,
    /// Write batches buffered between the writer and the line scanner.
    pub line_queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: TimestampMode::default(),
            line_queue_capacity: 1024,
        }
    }
}

type Sinks = Arc<Mutex<MultiWriter>>;
type LineSender = Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>;

pub struct OutputPipeline {
    mode: TimestampMode,
    sinks: Sinks,
    lines: LineSender,
    writer: Mutex<Option<PipelineWriter>>,
    scanner: Mutex<Option<JoinHandle<()>>>,
}

impl OutputPipeline {
    /// Build the pipeline and start its scanner task.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(cfg: PipelineConfig, sinks: MultiWriter, scanner: Arc<dyn LineScanner>) -> Self {
        let sinks: Sinks = Arc::new(Mutex::new(sinks));

        let (lines, task) = match cfg.mode {
            TimestampMode::Ansi => (None, None),
            mode => {
                let (tx, rx) = mpsc::channel(cfg.line_queue_capacity.max(1));
                let task = LineTask {
                    rx,
                    scanner,
                    sinks: (mode == TimestampMode::PlainLines).then(|| Arc::clone(&sinks)),
                    pending: Vec::new(),
                };
                (Some(tx), Some(tokio::task::spawn_blocking(move || task.run())))
            }
        };
        let lines: LineSender = Arc::new(Mutex::new(lines));

        let writer = PipelineWriter {
            mode: cfg.mode,
            sinks: Arc::clone(&sinks),
            lines: Arc::clone(&lines),
        };

        debug!(target: "kite.exec.output", mode = ?cfg.mode, "output pipeline ready");
        Self {
            mode: cfg.mode,
            sinks,
            lines,
            writer: Mutex::new(Some(writer)),
            scanner: Mutex::new(task),
        }
    }

    #[inline]
    pub fn mode(&self) -> TimestampMode {
        self.mode
    }

    /// The writer end for the process. Handed out once.
    pub fn take_writer(&self) -> Option<Box<dyn Write + Send>> {
        lock(&self.writer)
            .take()
            .map(|w| Box::new(w) as Box<dyn Write + Send>)
    }

    /// Write an agent-authored line straight to the sinks.
    ///
    /// Bypasses the line scanner, so it is safe to call from async code.
    pub fn write_notice(&self, line: &str) {
        let now = OffsetDateTime::now_utc();
        let prefix = match self.mode {
            TimestampMode::Ansi => ansi_timestamp(now),
            TimestampMode::PlainLines => line_prefix(now),
            TimestampMode::Plain => String::new(),
        };
        let mut sinks = lock(&self.sinks);
        let res = sinks
            .write_all(prefix.as_bytes())
            .and_then(|_| sinks.write_all(line.trim_end_matches('\n').as_bytes()))
            .and_then(|_| sinks.write_all(b"\n"));
        if let Err(e) = res {
            warn!(target: "kite.exec.output", error = %e, "writing notice failed");
        }
    }

    /// Close the line pipe and wait for the scanner to finish.
    ///
    /// Call after the process is done. Any partial trailing line is flushed.
    /// Subsequent calls are no-ops.
    pub async fn close(&self) {
        lock(&self.lines).take();

        let task = lock(&self.scanner).take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(target: "kite.exec.output", error = %e, "line scanner task failed");
        }

        if let Err(e) = lock(&self.sinks).flush() {
            warn!(target: "kite.exec.output", error = %e, "flushing output failed");
        }
    }
}

struct PipelineWriter {
    mode: TimestampMode,
    sinks: Sinks,
    lines: LineSender,
}

impl PipelineWriter {
    /// Hand a copy to the scanner. Blocks while the line queue is full.
    fn send_lines(&self, buf: &[u8]) {
        let tx = lock(&self.lines).clone();
        if let Some(tx) = tx
            && tx.blocking_send(buf.to_vec()).is_err()
        {
            debug!(target: "kite.exec.output", "line scanner gone; dropping copy");
        }
    }
}

impl Write for PipelineWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.mode {
            TimestampMode::Ansi => {
                let mut sinks = lock(&self.sinks);
                sinks.write_all(ansi_timestamp(OffsetDateTime::now_utc()).as_bytes())?;
                sinks.write_all(buf)?;
            }
            TimestampMode::Plain => {
                lock(&self.sinks).write_all(buf)?;
                self.send_lines(buf);
            }
            TimestampMode::PlainLines => self.send_lines(buf),
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        lock(&self.sinks).flush()
    }
}

/// Blocking consumer of the line pipe.
struct LineTask {
    rx: mpsc::Receiver<Vec<u8>>,
    scanner: Arc<dyn LineScanner>,
    /// Present in `PlainLines` mode, where this task owns writing to sinks.
    sinks: Option<Sinks>,
    pending: Vec<u8>,
}

impl LineTask {
    fn run(mut self) {
        while let Some(bytes) = self.rx.blocking_recv() {
            self.pending.extend_from_slice(&bytes);
            let mut start = 0;
            while let Some(pos) = self.pending[start..].iter().position(|&b| b == b'\n') {
                let end = start + pos + 1;
                let line = self.pending[start..end].to_vec();
                self.emit(&line);
                start = end;
            }
            self.pending.drain(..start);
        }

        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.emit(&line);
        }
        debug!(target: "kite.exec.output", "line scanner finished");
    }

    /// `line` includes its `\n` unless it is the trailing partial line.
    fn emit(&self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end_matches(['\n', '\r']);
        let is_header = self.scanner.scan(text);

        let Some(sinks) = &self.sinks else {
            return;
        };
        let mut sinks = lock(sinks);
        let res = if is_header {
            sinks.write_all(line)
        } else {
            sinks
                .write_all(line_prefix(OffsetDateTime::now_utc()).as_bytes())
                .and_then(|_| sinks.write_all(line))
        };
        let res = res.and_then(|_| {
            if line.ends_with(b"\n") {
                Ok(())
            } else {
                sinks.write_all(b"\n")
            }
        });
        if let Err(e) = res {
            warn!(target: "kite.exec.output", error = %e, "writing output line failed");
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
