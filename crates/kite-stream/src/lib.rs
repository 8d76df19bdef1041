//! Telemetry streaming between a running job and the control plane.
//!
//! Three independent pipelines share one [`ControlPlane`]:
//! [`HeaderTimesStreamer`] for section header timestamps, [`LogStreamer`] for
//! raw log chunks, and [`CancellationWatcher`] for remote cancellation.

mod error;
pub use error::{ApiError, StreamError};

pub mod client;
pub use client::{ControlPlane, HttpControlPlane};

pub mod header_times;
pub use header_times::{HeaderTimesConfig, HeaderTimesStreamer, is_header, is_header_expansion};

pub mod log_streamer;
pub use log_streamer::{LogStreamer, LogStreamerConfig};

pub mod cancel_watcher;
pub use cancel_watcher::{CancellationWatcher, JobHandle};
