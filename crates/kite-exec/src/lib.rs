mod error;
pub use error::{EnvError, ExecError, ExecResult};

pub mod signal;
pub use signal::{DefaultSignaller, Signal, Signaller};

pub mod process;
pub use process::{Phase, Process, ProcessConfig, WaitStatus};

pub mod output;
pub use output::{
    MultiWriter, OutputBuffer, OutputPipeline, Passthrough, PassthroughFormat, PipelineConfig,
    TimestampMode,
};

pub mod env;
pub use env::{
    EnvBuilder, EnvConfig, EnvSnapshot, default_protected_env, default_secret_env, truncate_env,
};

pub mod prelude {
    pub use crate::error::{EnvError, ExecError, ExecResult};
    pub use crate::{OutputPipeline, Process, ProcessConfig, Signal, WaitStatus};
}
