use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use kite_core::RetryPolicy;
use kite_exec::{
    EnvBuilder, EnvConfig, PassthroughFormat, PipelineConfig, Signal, TimestampMode,
    default_protected_env, default_secret_env,
};
use kite_observe::{LoggerConfig, LoggerFormat};
use kite_stream::client::{finish_job_policy, start_job_policy};
use kite_stream::{HeaderTimesConfig, LogStreamerConfig};

use crate::error::RunnerError;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub endpoint: String,
    pub token: String,
    /// Reported to the control plane with every request.
    pub agent_name: String,
    pub logger: LoggerConfig,

    /// Command that runs the job; it reads what to do from the job env.
    pub bootstrap: Vec<String>,
    /// Working directory of the job process.
    pub work_dir: Option<PathBuf>,
    pub pty: bool,
    pub cancel_grace_period: Duration,

    pub env: EnvConfig,
    /// Names only the agent may set in the job environment.
    pub protected_env: BTreeSet<String>,
    /// Names stripped from both the job and the inherited agent environment.
    pub secret_env: BTreeSet<String>,
    pub pipeline: PipelineConfig,
    pub header_times: HeaderTimesConfig,
    pub log_streamer: LogStreamerConfig,

    /// Mirror job output to the agent's stdout.
    pub log_to_stdout: Option<PassthroughFormat>,
    /// Also keep the job log in a temp file for the duration of the job.
    pub log_file: bool,
    pub log_flush_interval: Duration,
    /// Overridden per job by its status interval.
    pub cancel_poll_interval: Duration,

    pub start_retry: RetryPolicy,
    pub finish_retry: RetryPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let env = EnvConfig::default();
        Self {
            endpoint: env.endpoint.clone(),
            token: String::new(),
            agent_name: kite_core::agent_name().to_string(),
            logger: LoggerConfig::default(),
            bootstrap: vec![
                "/bin/sh".into(),
                "-c".into(),
                "eval \"$BUILDKITE_COMMAND\"".into(),
            ],
            work_dir: None,
            pty: false,
            cancel_grace_period: Duration::from_secs(10),
            env,
            protected_env: default_protected_env(),
            secret_env: default_secret_env(),
            pipeline: PipelineConfig::default(),
            header_times: HeaderTimesConfig::default(),
            log_streamer: LogStreamerConfig::default(),
            log_to_stdout: None,
            log_file: true,
            log_flush_interval: Duration::from_secs(1),
            cancel_poll_interval: Duration::from_secs(1),
            start_retry: start_job_policy(),
            finish_retry: finish_job_policy(),
        }
    }
}

impl AgentConfig {
    /// Defaults overlaid with `KITE_*` variables.
    pub fn from_env() -> Result<Self, RunnerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, RunnerError> {
        let mut cfg = Self::default();
        let invalid = |key: &str, e: String| RunnerError::Config(format!("{key}: {e}"));

        if let Some(v) = get("KITE_ENDPOINT") {
            cfg.endpoint = v;
        }
        if let Some(v) = get("KITE_TOKEN") {
            cfg.token = v;
        }
        if let Some(v) = get("KITE_AGENT_NAME") {
            cfg.agent_name = v;
        }
        if let Some(v) = get("KITE_LOG_LEVEL") {
            cfg.logger = cfg.logger.clone().with_level(v);
        }
        if let Some(v) = get("KITE_LOG_FORMAT") {
            let format = v
                .parse::<LoggerFormat>()
                .map_err(|e| invalid("KITE_LOG_FORMAT", e.to_string()))?;
            cfg.logger = cfg.logger.clone().with_format(format);
        }
        if let Some(v) = get("KITE_BOOTSTRAP") {
            cfg.bootstrap = v.split_whitespace().map(String::from).collect();
        }
        if let Some(v) = get("KITE_BUILD_PATH") {
            cfg.env.build_path = PathBuf::from(&v);
            cfg.work_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("KITE_TIMESTAMP_MODE") {
            cfg.pipeline.mode = v
                .parse::<TimestampMode>()
                .map_err(|e| invalid("KITE_TIMESTAMP_MODE", e))?;
        }
        if let Some(v) = get("KITE_PTY") {
            cfg.pty = parse_bool(&v).ok_or_else(|| invalid("KITE_PTY", v.clone()))?;
        }
        if let Some(v) = get("KITE_LOG_TO_STDOUT") {
            cfg.log_to_stdout = Some(
                v.parse::<PassthroughFormat>()
                    .map_err(|e| invalid("KITE_LOG_TO_STDOUT", e))?,
            );
        }
        if let Some(v) = get("KITE_CANCEL_SIGNAL") {
            cfg.env.cancel_signal = v
                .parse::<Signal>()
                .map_err(|e| invalid("KITE_CANCEL_SIGNAL", e.to_string()))?;
        }
        if let Some(v) = get("KITE_CANCEL_GRACE_PERIOD") {
            let secs = v
                .parse::<u64>()
                .map_err(|e| invalid("KITE_CANCEL_GRACE_PERIOD", e.to_string()))?;
            cfg.cancel_grace_period = Duration::from_secs(secs);
        }
        if let Some(v) = get("KITE_LOG_FLUSH_INTERVAL_MS") {
            let ms = v
                .parse::<u64>()
                .map_err(|e| invalid("KITE_LOG_FLUSH_INTERVAL_MS", e.to_string()))?;
            cfg.log_flush_interval = Duration::from_millis(ms);
        }

        cfg.env.endpoint = cfg.endpoint.clone();
        cfg.env.access_token = cfg.token.clone();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the runner cannot work with.
    pub fn validate(&self) -> Result<(), RunnerError> {
        if self.bootstrap.first().is_none_or(|p| p.is_empty()) {
            return Err(RunnerError::Config("bootstrap: empty command".into()));
        }
        if self.log_flush_interval.is_zero() {
            return Err(RunnerError::Config("log flush interval must be positive".into()));
        }
        Ok(())
    }

    /// Environment builder for the configured protected and secret names.
    pub fn env_builder(&self) -> EnvBuilder {
        EnvBuilder::new(self.protected_env.clone()).with_secret_keys(self.secret_env.clone())
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
