//! Agent-side logging setup.
//!
//! Job output never flows through here; this is the agent's own diagnostic
//! log (retry/backoff records, signal delivery failures, truncation warnings).
mod logger;
pub use logger::*;
