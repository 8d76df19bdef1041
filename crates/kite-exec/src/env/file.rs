use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

/// Escape a value for the inside of a double-quoted env file entry.
pub(crate) fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() && (c as u32) < 0x80 => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Write `env` as `KEY="value"` lines to a new temp file.
///
/// The file is removed when the returned handle drops.
pub(crate) fn write_env_file(
    env: &BTreeMap<String, String>,
    dir: Option<&Path>,
) -> io::Result<NamedTempFile> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("job-env-");
    let mut file = match dir {
        Some(dir) => builder.tempfile_in(dir)?,
        None => builder.tempfile()?,
    };

    {
        let mut w = io::BufWriter::new(file.as_file_mut());
        for (key, value) in env {
            writeln!(w, "{key}=\"{}\"", escape_value(value))?;
        }
        w.flush()?;
    }
    Ok(file)
}
