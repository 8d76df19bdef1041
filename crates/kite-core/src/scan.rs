/// Observer of complete output lines.
///
/// Implemented by the header-time streamer and consumed by the output
/// pipeline. `scan` is called from a blocking thread and may block to apply
/// backpressure.
pub trait LineScanner: Send + Sync + 'static {
    /// Inspect one line (without its terminator).
    ///
    /// Returns `true` when the line is decorative (a section header or header
    /// expansion) and must not be timestamp-prefixed.
    fn scan(&self, line: &str) -> bool;
}
