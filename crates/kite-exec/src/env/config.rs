use std::path::PathBuf;

use crate::signal::Signal;

/// Agent-side settings injected into every job environment.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub endpoint: String,
    /// Session token for the job; exposed as `BUILDKITE_AGENT_ACCESS_TOKEN`.
    pub access_token: String,

    pub debug: bool,
    pub debug_http: bool,

    pub bin_path: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub build_path: PathBuf,
    pub hooks_path: PathBuf,
    pub plugins_path: PathBuf,
    pub sockets_path: PathBuf,

    pub git_submodules: bool,
    pub ssh_keyscan: bool,
    pub command_eval: bool,
    pub plugins_enabled: bool,
    pub plugin_validation: bool,
    pub local_hooks_enabled: bool,

    pub git_clone_flags: String,
    pub git_clean_flags: String,
    pub git_fetch_flags: String,

    /// Glob patterns of variables whose values are redacted from logs.
    pub redacted_vars: Vec<String>,
    pub experiments: Vec<String>,

    pub cancel_signal: Signal,
    pub profile: Option<String>,
    pub signing_jwks_file: Option<PathBuf>,
    pub signing_jwks_key_id: Option<String>,
    pub verification_jwks_file: Option<PathBuf>,
    pub tracing_backend: Option<String>,

    /// Cap for `BUILDKITE_MESSAGE`, counting `key=value\0`.
    pub message_max_bytes: usize,
    /// Where the env snapshot file goes; the system temp dir when unset.
    pub env_file_dir: Option<PathBuf>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("kite-agent");
        Self {
            endpoint: "http://127.0.0.1:8080/v3".into(),
            access_token: String::new(),
            debug: false,
            debug_http: false,
            bin_path: None,
            config_path: None,
            build_path: base.join("builds"),
            hooks_path: base.join("hooks"),
            plugins_path: base.join("plugins"),
            sockets_path: base.join("sockets"),
            git_submodules: true,
            ssh_keyscan: true,
            command_eval: true,
            plugins_enabled: true,
            plugin_validation: false,
            local_hooks_enabled: true,
            git_clone_flags: "-v".into(),
            git_clean_flags: "-ffxdq".into(),
            git_fetch_flags: "-v --prune".into(),
            redacted_vars: ["*_PASSWORD", "*_SECRET", "*_TOKEN", "*_PRIVATE_KEY", "*_ACCESS_KEY"]
                .map(String::from)
                .to_vec(),
            experiments: Vec::new(),
            cancel_signal: Signal::Term,
            profile: None,
            signing_jwks_file: None,
            signing_jwks_key_id: None,
            verification_jwks_file: None,
            tracing_backend: None,
            message_max_bytes: 64 * 1024,
            env_file_dir: None,
        }
    }
}
