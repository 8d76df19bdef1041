//! Job environment assembly.
//!
//! [`EnvBuilder::build`] turns a job's declared variables into the exact
//! environment the child receives: secrets stripped, protected names
//! overridden by agent values, a sourced-later snapshot file written, and
//! oversized messages truncated.
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use kite_model::Job;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::EnvError;

mod config;
pub use config::EnvConfig;

mod file;

mod truncate;
pub use truncate::truncate_env;

pub const IGNORED_ENV_KEY: &str = "BUILDKITE_IGNORED_ENV";
pub const ENV_FILE_KEY: &str = "BUILDKITE_ENV_FILE";
pub const MESSAGE_KEY: &str = "BUILDKITE_MESSAGE";

const PROTECTED: &[&str] = &[
    "BUILDKITE_AGENT_ACCESS_TOKEN",
    "BUILDKITE_AGENT_DEBUG",
    "BUILDKITE_AGENT_DEBUG_HTTP",
    "BUILDKITE_AGENT_ENDPOINT",
    "BUILDKITE_AGENT_PID",
    "BUILDKITE_BIN_PATH",
    "BUILDKITE_BUILD_PATH",
    "BUILDKITE_COMMAND_EVAL",
    "BUILDKITE_CONFIG_PATH",
    "BUILDKITE_GIT_CLEAN_FLAGS",
    "BUILDKITE_GIT_CLONE_FLAGS",
    "BUILDKITE_GIT_FETCH_FLAGS",
    "BUILDKITE_GIT_SUBMODULES",
    "BUILDKITE_HOOKS_PATH",
    "BUILDKITE_LOCAL_HOOKS_ENABLED",
    "BUILDKITE_PLUGINS_ENABLED",
    "BUILDKITE_PLUGINS_PATH",
    "BUILDKITE_PLUGIN_VALIDATION",
    "BUILDKITE_SOCKETS_PATH",
    "BUILDKITE_SSH_KEYSCAN",
];

/// The agent's registration token under both of its names, and the job
/// session token.
const SECRETS: &[&str] = &[
    "BUILDKITE_AGENT_TOKEN",
    "KITE_TOKEN",
    "BUILDKITE_AGENT_ACCESS_TOKEN",
];

/// Names the agent always sets itself.
pub fn default_protected_env() -> BTreeSet<String> {
    PROTECTED.iter().map(|s| s.to_string()).collect()
}

/// Names that must never reach the child with a job-declared value.
pub fn default_secret_env() -> BTreeSet<String> {
    SECRETS.iter().map(|s| s.to_string()).collect()
}

/// Builds [`EnvSnapshot`]s for jobs.
#[derive(Debug, Clone)]
pub struct EnvBuilder {
    protected: BTreeSet<String>,
    secrets: BTreeSet<String>,
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self::new(default_protected_env())
    }
}

impl EnvBuilder {
    pub fn new(protected: BTreeSet<String>) -> Self {
        Self {
            protected,
            secrets: default_secret_env(),
        }
    }

    pub fn with_secret_keys(mut self, secrets: BTreeSet<String>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn protected(&self) -> &BTreeSet<String> {
        &self.protected
    }

    /// Resolve the child environment for `job`.
    ///
    /// Only writing the snapshot file can fail. Truncation problems are
    /// reported through [`EnvSnapshot::warnings`].
    pub fn build(&self, job: &Job, cfg: &EnvConfig) -> Result<EnvSnapshot, EnvError> {
        let mut vars: BTreeMap<String, String> = job
            .env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut warnings = Vec::new();

        let mut removed_secrets = Vec::new();
        for key in &self.secrets {
            if vars.remove(key).is_some() {
                warn!(target: "kite.exec.env", job_id = %job.id, key = %key, "removed secret from job environment");
                warnings.push(format!(
                    "{key} was set by the job and has been removed from its environment"
                ));
                removed_secrets.push(key.clone());
            }
        }

        let ignored: Vec<String> = job
            .env
            .iter()
            .map(|(k, _)| k)
            .filter(|k| self.protected.contains(*k) && !self.secrets.contains(*k))
            .map(String::from)
            .collect();
        for key in &ignored {
            vars.remove(key);
        }
        if !ignored.is_empty() {
            let list = ignored.join(", ");
            warn!(target: "kite.exec.env", job_id = %job.id, keys = %list, "job tried to override protected variables");
            warnings.push(format!(
                "Ignored job environment variables that the agent controls: {list}"
            ));
        }

        let env_file = file::write_env_file(&vars, cfg.env_file_dir.as_deref())?;
        debug!(target: "kite.exec.env", job_id = %job.id, path = %env_file.path().display(), "wrote env file");

        inject_agent_env(&mut vars, cfg);
        if !ignored.is_empty() {
            vars.insert(IGNORED_ENV_KEY.into(), ignored.join(","));
        }
        vars.insert(ENV_FILE_KEY.into(), env_file.path().display().to_string());

        match truncate_env(&mut vars, MESSAGE_KEY, cfg.message_max_bytes) {
            Ok(true) => {
                debug!(target: "kite.exec.env", job_id = %job.id, max = cfg.message_max_bytes, "truncated {MESSAGE_KEY}")
            }
            Ok(false) => {}
            Err(e) => {
                warn!(target: "kite.exec.env", job_id = %job.id, error = %e, "leaving {MESSAGE_KEY} untruncated");
                warnings.push(format!("{MESSAGE_KEY} could not be truncated: {e}"));
            }
        }

        Ok(EnvSnapshot {
            vars,
            ignored,
            removed_secrets,
            secret_keys: self.secrets.iter().cloned().collect(),
            warnings,
            env_file: Some(env_file),
        })
    }
}

fn flag(b: bool) -> String {
    b.to_string()
}

fn path(p: &Path) -> String {
    p.display().to_string()
}

fn inject_agent_env(vars: &mut BTreeMap<String, String>, cfg: &EnvConfig) {
    let mut set = |k: &str, v: String| {
        vars.insert(k.to_string(), v);
    };

    set("BUILDKITE_AGENT_ENDPOINT", cfg.endpoint.clone());
    set("BUILDKITE_AGENT_ACCESS_TOKEN", cfg.access_token.clone());
    set("BUILDKITE_AGENT_DEBUG", flag(cfg.debug));
    set("BUILDKITE_AGENT_DEBUG_HTTP", flag(cfg.debug_http));
    set("BUILDKITE_AGENT_PID", std::process::id().to_string());

    let bin = cfg.bin_path.clone().or_else(|| {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(PathBuf::from))
    });
    if let Some(bin) = bin {
        set("BUILDKITE_BIN_PATH", path(&bin));
    }
    if let Some(config) = &cfg.config_path {
        set("BUILDKITE_CONFIG_PATH", path(config));
    }
    set("BUILDKITE_BUILD_PATH", path(&cfg.build_path));
    set("BUILDKITE_HOOKS_PATH", path(&cfg.hooks_path));
    set("BUILDKITE_PLUGINS_PATH", path(&cfg.plugins_path));
    set("BUILDKITE_SOCKETS_PATH", path(&cfg.sockets_path));

    set("BUILDKITE_GIT_SUBMODULES", flag(cfg.git_submodules));
    set("BUILDKITE_SSH_KEYSCAN", flag(cfg.ssh_keyscan));
    set("BUILDKITE_COMMAND_EVAL", flag(cfg.command_eval));
    set("BUILDKITE_PLUGINS_ENABLED", flag(cfg.plugins_enabled));
    set("BUILDKITE_PLUGIN_VALIDATION", flag(cfg.plugin_validation));
    set("BUILDKITE_LOCAL_HOOKS_ENABLED", flag(cfg.local_hooks_enabled));

    set("BUILDKITE_GIT_CLONE_FLAGS", cfg.git_clone_flags.clone());
    set("BUILDKITE_GIT_CLEAN_FLAGS", cfg.git_clean_flags.clone());
    set("BUILDKITE_GIT_FETCH_FLAGS", cfg.git_fetch_flags.clone());

    set("BUILDKITE_REDACTED_VARS", cfg.redacted_vars.join(","));
    if !cfg.experiments.is_empty() {
        set("BUILDKITE_AGENT_EXPERIMENT", cfg.experiments.join(","));
    }

    if cfg.cancel_signal != crate::Signal::Term {
        set("BUILDKITE_CANCEL_SIGNAL", cfg.cancel_signal.name().to_string());
    }
    if let Some(profile) = &cfg.profile {
        set("BUILDKITE_AGENT_PROFILE", profile.clone());
    }
    if let Some(jwks) = &cfg.signing_jwks_file {
        set("BUILDKITE_AGENT_JWKS_FILE", path(jwks));
    }
    if let Some(key_id) = &cfg.signing_jwks_key_id {
        set("BUILDKITE_AGENT_JWKS_KEY_ID", key_id.clone());
    }
    if let Some(jwks) = &cfg.verification_jwks_file {
        set("BUILDKITE_AGENT_VERIFICATION_JWKS_FILE", path(jwks));
    }
    if let Some(backend) = &cfg.tracing_backend {
        set("BUILDKITE_TRACING_BACKEND", backend.clone());
    }
}

/// Resolved environment for one job.
///
/// Holds the snapshot file; it is removed when the snapshot drops.
#[derive(Debug)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
    ignored: Vec<String>,
    removed_secrets: Vec<String>,
    secret_keys: Vec<String>,
    warnings: Vec<String>,
    env_file: Option<NamedTempFile>,
}

impl EnvSnapshot {
    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Protected names the job tried to set, sorted.
    pub fn ignored(&self) -> &[String] {
        &self.ignored
    }

    pub fn removed_secrets(&self) -> &[String] {
        &self.removed_secrets
    }

    /// Names to strip from the inherited agent environment as well.
    pub fn secret_keys(&self) -> &[String] {
        &self.secret_keys
    }

    /// Human readable notices meant for the job log.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn env_file_path(&self) -> Option<&Path> {
        self.env_file.as_ref().map(NamedTempFile::path)
    }

    pub fn to_pairs(&self) -> Vec<(String, String)> {
        self.vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(env: &[(&str, &str)]) -> Job {
        let mut job = Job::new("job-1");
        for (k, v) in env {
            job.env.insert(k.to_string(), v.to_string());
        }
        job
    }

    fn cfg(dir: &Path) -> EnvConfig {
        EnvConfig {
            access_token: "session-token".into(),
            env_file_dir: Some(dir.to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn leaked_tokens_never_reach_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(&[
            ("BUILDKITE_AGENT_ACCESS_TOKEN", "leaked"),
            ("BUILDKITE_AGENT_TOKEN", "registration"),
            ("FOO", "bar"),
        ]);

        let snap = EnvBuilder::default().build(&job, &cfg(dir.path())).unwrap();

        assert_eq!(snap.get("BUILDKITE_AGENT_ACCESS_TOKEN"), Some("session-token"));
        assert_eq!(snap.get("BUILDKITE_AGENT_TOKEN"), None);
        assert_eq!(snap.get("FOO"), Some("bar"));
        assert!(!snap.vars().values().any(|v| v == "leaked" || v == "registration"));
        assert_eq!(snap.removed_secrets().len(), 2);
        assert!(snap.secret_keys().iter().any(|k| k == "KITE_TOKEN"));

        let file = std::fs::read_to_string(snap.env_file_path().unwrap()).unwrap();
        assert!(!file.contains("leaked"));
        assert!(!file.contains("registration"));
    }

    #[test]
    fn protected_override_is_recorded_and_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(&[("BUILDKITE_GIT_SUBMODULES", "false"), ("BUILDKITE_SSH_KEYSCAN", "false")]);

        let snap = EnvBuilder::default().build(&job, &cfg(dir.path())).unwrap();

        assert_eq!(snap.get("BUILDKITE_GIT_SUBMODULES"), Some("true"));
        assert_eq!(
            snap.get(IGNORED_ENV_KEY),
            Some("BUILDKITE_GIT_SUBMODULES,BUILDKITE_SSH_KEYSCAN")
        );
        assert_eq!(snap.ignored(), ["BUILDKITE_GIT_SUBMODULES", "BUILDKITE_SSH_KEYSCAN"]);
        assert!(snap.warnings().iter().any(|w| w.contains("BUILDKITE_GIT_SUBMODULES")));
    }

    #[test]
    fn protected_secret_is_removed_not_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(&[("BUILDKITE_AGENT_ACCESS_TOKEN", "leaked")]);

        let snap = EnvBuilder::default().build(&job, &cfg(dir.path())).unwrap();

        assert_eq!(snap.removed_secrets(), ["BUILDKITE_AGENT_ACCESS_TOKEN"]);
        assert!(snap.ignored().is_empty());
        assert_eq!(snap.get(IGNORED_ENV_KEY), None);
        assert_eq!(snap.warnings().len(), 1);
    }

    #[test]
    fn custom_protected_set() {
        let dir = tempfile::tempdir().unwrap();
        let protected = BTreeSet::from(["MY_RESERVED".to_string()]);
        let job = job(&[("MY_RESERVED", "x"), ("BUILDKITE_GIT_SUBMODULES", "false")]);

        let snap = EnvBuilder::new(protected).build(&job, &cfg(dir.path())).unwrap();

        assert_eq!(snap.ignored(), ["MY_RESERVED"]);
        assert_eq!(snap.get("MY_RESERVED"), None);
    }

    #[test]
    fn env_file_holds_clean_job_env() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(&[("GREETING", "hello \"world\"\nbye"), ("BUILDKITE_AGENT_TOKEN", "x")]);

        let snap = EnvBuilder::default().build(&job, &cfg(dir.path())).unwrap();
        let path = snap.env_file_path().unwrap().to_path_buf();
        assert_eq!(snap.get(ENV_FILE_KEY), Some(path.display().to_string().as_str()));

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "GREETING=\"hello \\\"world\\\"\\nbye\"\n");

        drop(snap);
        assert!(!path.exists());
    }

    #[test]
    fn cancel_signal_only_when_not_default() {
        let dir = tempfile::tempdir().unwrap();
        let builder = EnvBuilder::default();

        let snap = builder.build(&job(&[]), &cfg(dir.path())).unwrap();
        assert_eq!(snap.get("BUILDKITE_CANCEL_SIGNAL"), None);
        assert_eq!(snap.get(IGNORED_ENV_KEY), None);

        let mut c = cfg(dir.path());
        c.cancel_signal = crate::Signal::Int;
        c.profile = Some("cpu".into());
        let snap = builder.build(&job(&[]), &c).unwrap();
        assert_eq!(snap.get("BUILDKITE_CANCEL_SIGNAL"), Some("SIGINT"));
        assert_eq!(snap.get("BUILDKITE_AGENT_PROFILE"), Some("cpu"));
        assert_eq!(snap.get("BUILDKITE_AGENT_PID"), Some(std::process::id().to_string().as_str()));
    }

    #[test]
    fn long_message_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let message = "m".repeat(2_000);
        let mut c = cfg(dir.path());
        c.message_max_bytes = 1_024;

        let snap = EnvBuilder::default()
            .build(&job(&[(MESSAGE_KEY, &message)]), &c)
            .unwrap();

        let v = snap.get(MESSAGE_KEY).unwrap();
        assert!(MESSAGE_KEY.len() + v.len() + 2 <= 1_024);
        assert!(v.ends_with("bytes]"));
    }

    #[test]
    fn truncation_failure_keeps_value_and_warns() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = cfg(dir.path());
        c.message_max_bytes = 24;

        let snap = EnvBuilder::default()
            .build(&job(&[(MESSAGE_KEY, "a fairly long commit message")]), &c)
            .unwrap();

        assert_eq!(snap.get(MESSAGE_KEY), Some("a fairly long commit message"));
        assert!(snap.warnings().iter().any(|w| w.contains(MESSAGE_KEY)));
    }
}
