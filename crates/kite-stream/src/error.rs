use kite_core::AttemptError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("control plane responded {status}: {message}")]
    Status { status: u16, message: String },

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            ApiError::Http(e) => e.status().map(|s| s.as_u16()),
            ApiError::InvalidResponse(_) => None,
        }
    }

    /// A client error the control plane will keep rejecting.
    ///
    /// 408 and 429 are client errors too but ask to be retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status(), Some(s) if (400..500).contains(&s) && s != 408 && s != 429)
    }

    /// Tag the error for [`kite_core::retry`].
    pub fn into_attempt(self) -> AttemptError<ApiError> {
        if self.is_terminal() {
            AttemptError::Fatal(self)
        } else {
            AttemptError::Fail(self)
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StreamError {
    #[error("streamer is not running")]
    Closed,
    #[error("canceled")]
    Canceled,
}
