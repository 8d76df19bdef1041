use kite_core::RetryError;
use kite_stream::ApiError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("could not start job: {0}")]
    Start(#[from] RetryError<ApiError>),

    #[error("control plane client: {0}")]
    Client(#[from] ApiError),

    #[error("job is already running")]
    AlreadyRunning,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
