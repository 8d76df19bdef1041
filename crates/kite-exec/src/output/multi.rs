use std::io::{self, Write};

use tracing::warn;

struct Sink {
    name: &'static str,
    writer: Box<dyn Write + Send>,
    failed: bool,
}

/// Fan-out writer.
///
/// Every write goes to every sink. A failing sink is reported once and the
/// remaining sinks keep receiving bytes; the write itself never fails.
#[derive(Default)]
pub struct MultiWriter {
    sinks: Vec<Sink>,
}

impl MultiWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink; `name` labels log records.
    pub fn with_sink(mut self, name: &'static str, writer: impl Write + Send + 'static) -> Self {
        self.push(name, writer);
        self
    }

    pub fn push(&mut self, name: &'static str, writer: impl Write + Send + 'static) {
        self.sinks.push(Sink {
            name,
            writer: Box::new(writer),
            failed: false,
        });
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for sink in &mut self.sinks {
            if let Err(e) = sink.writer.write_all(buf) {
                if !sink.failed {
                    warn!(target: "kite.exec.output", sink = sink.name, error = %e, "output sink failed");
                }
                sink.failed = true;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for sink in &mut self.sinks {
            if let Err(e) = sink.writer.flush() {
                warn!(target: "kite.exec.output", sink = sink.name, error = %e, "flushing output sink failed");
            }
        }
        Ok(())
    }
}
