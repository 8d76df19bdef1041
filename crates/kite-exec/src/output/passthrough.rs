use std::io::{self, Write};
use std::str::FromStr;

use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// How job output is mirrored to the agent's own stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PassthroughFormat {
    #[default]
    Plain,
    Json,
}

impl FromStr for PassthroughFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" | "text" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown passthrough format: {other}")),
        }
    }
}

#[derive(Serialize)]
struct Record<'a> {
    timestamp: String,
    job_id: &'a str,
    source: &'static str,
    message: &'a str,
}

/// Mirrors job output into another writer, optionally as JSON records.
pub struct Passthrough<W> {
    inner: W,
    format: PassthroughFormat,
    job_id: String,
}

impl<W: Write> Passthrough<W> {
    pub fn new(inner: W, format: PassthroughFormat, job_id: impl Into<String>) -> Self {
        Self {
            inner,
            format,
            job_id: job_id.into(),
        }
    }

    fn write_record(&mut self, buf: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(buf);
        let message = text.trim_end_matches(['\n', '\r']);
        if message.is_empty() {
            return Ok(());
        }
        let record = Record {
            timestamp: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
            job_id: &self.job_id,
            source: "job",
            message,
        };
        serde_json::to_writer(&mut self.inner, &record).map_err(io::Error::other)?;
        self.inner.write_all(b"\n")
    }
}

impl<W: Write> Write for Passthrough<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.format {
            PassthroughFormat::Plain => self.inner.write_all(buf)?,
            PassthroughFormat::Json => self.write_record(buf)?,
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_is_verbatim() {
        let mut p = Passthrough::new(Vec::new(), PassthroughFormat::Plain, "job-1");
        p.write_all(b"hello\n").unwrap();
        assert_eq!(p.inner, b"hello\n");
    }

    #[test]
    fn json_emits_one_record_per_write() {
        let mut p = Passthrough::new(Vec::new(), PassthroughFormat::Json, "job-1");
        p.write_all(b"hello\n\n").unwrap();
        p.write_all(b"\n").unwrap();

        let out = String::from_utf8(p.inner).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 1);

        let v: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(v["message"], "hello");
        assert_eq!(v["job_id"], "job-1");
        assert_eq!(v["source"], "job");
        assert!(v["timestamp"].is_string());
    }

    #[test]
    fn format_parses() {
        assert_eq!("JSON".parse::<PassthroughFormat>().unwrap(), PassthroughFormat::Json);
        assert!("xml".parse::<PassthroughFormat>().is_err());
    }
}
