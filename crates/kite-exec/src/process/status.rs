use std::fmt;
use std::process::ExitStatus;

use crate::signal::Signal;

/// How the child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitStatus {
    code: Option<i32>,
    signal: Option<i32>,
}

impl WaitStatus {
    /// Status reported when the process never ran or its status was lost.
    pub const NOT_RUN: WaitStatus = WaitStatus {
        code: None,
        signal: None,
    };

    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn from_signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Exit code, or `-1` when the process was killed or never ran.
    #[inline]
    pub fn exit_code(&self) -> i32 {
        self.code.unwrap_or(-1)
    }

    #[inline]
    pub fn signal(&self) -> Option<i32> {
        self.signal
    }

    pub fn signal_name(&self) -> Option<String> {
        self.signal.map(Signal::raw_name)
    }

    #[inline]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for WaitStatus {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = status.signal() {
                return Self::from_signal(sig);
            }
        }
        Self {
            code: status.code(),
            signal: None,
        }
    }
}

impl fmt::Display for WaitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "killed by {}", Signal::raw_name(sig)),
            (None, None) => f.write_str("not run"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_defaults_to_minus_one() {
        assert_eq!(WaitStatus::NOT_RUN.exit_code(), -1);
        assert_eq!(WaitStatus::from_signal(9).exit_code(), -1);
        assert_eq!(WaitStatus::from_code(3).exit_code(), 3);
        assert!(WaitStatus::from_code(0).success());
    }

    #[cfg(unix)]
    #[test]
    fn display_names_signal() {
        let status = WaitStatus::from_signal(libc::SIGKILL);
        assert_eq!(status.to_string(), "killed by SIGKILL");
        assert_eq!(status.signal_name().as_deref(), Some("SIGKILL"));
    }
}
