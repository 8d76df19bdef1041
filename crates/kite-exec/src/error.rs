use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("missing program")]
    MissingProgram,
    #[error("executable not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("pty setup failed: {0}")]
    Pty(String),
    #[error("process already started")]
    AlreadyStarted,
    #[error("io error: {0}")]
    Io(String),
    #[error("cancelled")]
    Cancelled,
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        ExecError::Io(e.to_string())
    }
}

pub type ExecResult<T> = Result<T, ExecError>;

#[derive(Error, Debug)]
pub enum EnvError {
    #[error("writing env file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot truncate {key} to {max} bytes: truncation notice does not fit")]
    TruncationTooShort { key: String, max: usize },
}
