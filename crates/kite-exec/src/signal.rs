//! Signal names and the delivery capability used by the supervisor.
//!
//! The supervisor owns the escalation timer; a [`Signaller`] only knows how to
//! deliver "interrupt" and "terminate" to a process id. Platforms without POSIX
//! signals plug in their own implementation.
use std::fmt;
use std::io;
use std::str::FromStr;

use thiserror::Error;

/// Signals the agent is willing to send to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Signal {
    Hup,
    Int,
    Quit,
    Kill,
    Usr1,
    Usr2,
    #[default]
    Term,
}

#[derive(Debug, Error)]
#[error("unknown signal: {0}")]
pub struct UnknownSignal(pub String);

impl Signal {
    const ALL: [Signal; 7] = [
        Signal::Hup,
        Signal::Int,
        Signal::Quit,
        Signal::Kill,
        Signal::Usr1,
        Signal::Usr2,
        Signal::Term,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Signal::Hup => "SIGHUP",
            Signal::Int => "SIGINT",
            Signal::Quit => "SIGQUIT",
            Signal::Kill => "SIGKILL",
            Signal::Usr1 => "SIGUSR1",
            Signal::Usr2 => "SIGUSR2",
            Signal::Term => "SIGTERM",
        }
    }

    #[cfg(unix)]
    pub fn as_raw(&self) -> libc::c_int {
        match self {
            Signal::Hup => libc::SIGHUP,
            Signal::Int => libc::SIGINT,
            Signal::Quit => libc::SIGQUIT,
            Signal::Kill => libc::SIGKILL,
            Signal::Usr1 => libc::SIGUSR1,
            Signal::Usr2 => libc::SIGUSR2,
            Signal::Term => libc::SIGTERM,
        }
    }

    #[cfg(unix)]
    pub fn from_raw(raw: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_raw() == raw)
    }

    #[cfg(not(unix))]
    pub fn from_raw(_raw: i32) -> Option<Self> {
        None
    }

    /// Human readable name of a raw signal number.
    pub fn raw_name(raw: i32) -> String {
        Self::from_raw(raw)
            .map(|s| s.name().to_string())
            .unwrap_or_else(|| format!("SIG{raw}"))
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Signal {
    type Err = UnknownSignal;

    /// Accepts `SIGTERM`, `TERM`, `term` or a raw number.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_uppercase();
        if let Ok(raw) = norm.parse::<i32>() {
            return Self::from_raw(raw).ok_or_else(|| UnknownSignal(s.to_string()));
        }
        let bare = norm.strip_prefix("SIG").unwrap_or(&norm);
        Self::ALL
            .into_iter()
            .find(|sig| &sig.name()[3..] == bare)
            .ok_or_else(|| UnknownSignal(s.to_string()))
    }
}

/// Delivers interrupt and terminate requests to a running process.
pub trait Signaller: Send + Sync + 'static {
    /// Graceful stop request.
    fn interrupt(&self, pid: u32, signal: Signal) -> io::Result<()>;
    /// Forced stop; must not be ignorable by the process.
    fn terminate(&self, pid: u32) -> io::Result<()>;
}

/// Platform signaller.
///
/// On Unix, signals go to the child's process group so that everything the
/// job spawned receives them too.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSignaller;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        impl DefaultSignaller {
            fn kill(pid: u32, sig: libc::c_int) -> io::Result<()> {
                let pid = pid as libc::pid_t;
                if pid <= 0 {
                    return Err(io::Error::new(io::ErrorKind::InvalidInput, "no process id"));
                }
                if unsafe { libc::kill(-pid, sig) } == 0 {
                    return Ok(());
                }
                let group_err = io::Error::last_os_error();
                // Not a group leader (or the group is gone); try the pid itself.
                if unsafe { libc::kill(pid, sig) } == 0 {
                    return Ok(());
                }
                Err(group_err)
            }
        }

        impl Signaller for DefaultSignaller {
            fn interrupt(&self, pid: u32, signal: Signal) -> io::Result<()> {
                Self::kill(pid, signal.as_raw())
            }

            fn terminate(&self, pid: u32) -> io::Result<()> {
                Self::kill(pid, libc::SIGKILL)
            }
        }
    } else {
        impl Signaller for DefaultSignaller {
            fn interrupt(&self, _pid: u32, signal: Signal) -> io::Result<()> {
                Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("{signal} is not deliverable on this platform"),
                ))
            }

            // The supervisor kills the child handle directly after this returns.
            fn terminate(&self, _pid: u32) -> io::Result<()> {
                Ok(())
            }
        }
    }
}
