pub mod retry;
pub use retry::{AttemptError, Backoff, RetryError, RetryPolicy, RetryState, retry};

mod scan;
pub use scan::LineScanner;

mod system;
pub use system::{agent_name, arch, platform, user_agent};
