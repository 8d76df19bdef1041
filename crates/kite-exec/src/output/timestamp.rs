use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Zero-width APC escape carrying the epoch milliseconds of `now`.
///
/// Terminals ignore it; the log viewer uses it to timestamp the bytes that
/// follow.
pub fn ansi_timestamp(now: OffsetDateTime) -> String {
    let ms = now.unix_timestamp_nanos() / 1_000_000;
    format!("\x1b_bk;t={ms}\x07")
}

/// `[2024-05-01T12:00:00Z] ` in UTC, second precision.
pub fn line_prefix(now: OffsetDateTime) -> String {
    let now = now
        .to_offset(time::UtcOffset::UTC)
        .replace_nanosecond(0)
        .unwrap_or(now);
    match now.format(&Rfc3339) {
        Ok(ts) => format!("[{ts}] "),
        Err(_) => String::new(),
    }
}
