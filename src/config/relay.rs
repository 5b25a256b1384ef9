//! Relay configuration
//!
//! Loads relay settings from a TOML file. Every section is optional; a missing
//! file yields the defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::pty::{ShellEnv, SpawnSpec, TerminalSize};

pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_PATH: &str = "/ws";
pub const DEFAULT_TERM: &str = "xterm-color";
pub const DEFAULT_MAX_SESSIONS: usize = 64;
/// Longest accepted idle timeout, 30 days
pub const MAX_IDLE_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ListenConfig,
    pub shell: ShellConfig,
    pub sessions: SessionLimits,
}

/// Where the WebSocket listener binds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ListenConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Request path accepted for the WebSocket upgrade
    pub path: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.to_string(),
        }
    }
}

impl ListenConfig {
    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// How each session's shell is launched
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShellConfig {
    /// Shell override; `$SHELL` or the platform default otherwise
    pub program: Option<String>,
    /// Arguments passed to the shell
    pub args: Vec<String>,
    /// Value of `TERM` in the shell
    pub term: String,
    /// Working directory; the user's home directory otherwise
    pub working_dir: Option<PathBuf>,
    /// Start from a snapshot of the relay's environment
    pub inherit_env: bool,
    /// Extra variables, applied after the snapshot
    pub env: BTreeMap<String, String>,
    /// Variables removed last
    pub unset_env: Vec<String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            term: DEFAULT_TERM.to_string(),
            working_dir: None,
            inherit_env: true,
            env: BTreeMap::new(),
            unset_env: Vec::new(),
        }
    }
}

impl ShellConfig {
    /// Build the environment every shell receives
    pub fn environment(&self) -> ShellEnv {
        let mut env = if self.inherit_env {
            ShellEnv::inherit()
        } else {
            ShellEnv::new()
        };

        env.set("TERM", self.term.as_str());
        for (key, value) in &self.env {
            env.set(key.as_str(), value.as_str());
        }
        for key in &self.unset_env {
            env.remove(key);
        }
        env
    }

    /// Program to launch, given the environment it will run in
    pub fn resolve_program(&self, env: &ShellEnv) -> String {
        match &self.program {
            Some(program) => program.clone(),
            None => default_shell(env),
        }
    }

    pub fn resolve_working_dir(&self) -> PathBuf {
        self.working_dir
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    /// Resolve everything into what each session spawns from
    pub fn spawn_spec(&self) -> SpawnSpec {
        let env = self.environment();
        let program = self.resolve_program(&env);

        SpawnSpec::new(program, self.resolve_working_dir())
            .with_args(self.args.iter().cloned())
            .with_env(env)
            .with_size(TerminalSize::default())
    }
}

#[cfg(windows)]
fn default_shell(_env: &ShellEnv) -> String {
    "powershell.exe".to_string()
}

#[cfg(not(windows))]
fn default_shell(env: &ShellEnv) -> String {
    env.get("SHELL")
        .filter(|shell| !shell.is_empty())
        .unwrap_or("bash")
        .to_string()
}

/// Bounds on concurrent and idle sessions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionLimits {
    /// Maximum concurrent sessions; 0 disables the cap
    pub max_sessions: usize,
    /// Seconds without client input before a session is closed; 0 disables.
    /// At most [`MAX_IDLE_TIMEOUT_SECS`].
    pub idle_timeout_secs: u64,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            idle_timeout_secs: 0,
        }
    }
}

impl SessionLimits {
    pub fn cap(&self) -> Option<usize> {
        (self.max_sessions > 0).then_some(self.max_sessions)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

impl RelayConfig {
    /// Load configuration from a file, falling back to defaults when absent
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.server.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "server.path must start with '/', got {:?}",
                self.server.path
            )));
        }
        if self.shell.term.is_empty() {
            return Err(ConfigError::Invalid(
                "shell.term cannot be empty".to_string(),
            ));
        }
        if self.sessions.idle_timeout_secs > MAX_IDLE_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!(
                "sessions.idle_timeout_secs must be at most {}, got {}",
                MAX_IDLE_TIMEOUT_SECS, self.sessions.idle_timeout_secs
            )));
        }
        if let Some(program) = &self.shell.program {
            if program.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "shell.program cannot be empty when specified".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.server.socket_addr(), "0.0.0.0:5000");
        assert_eq!(config.server.path, "/ws");
        assert_eq!(config.shell.term, "xterm-color");
        assert!(config.shell.inherit_env);
        assert_eq!(config.sessions.cap(), Some(64));
        assert_eq!(config.sessions.idle_timeout(), None);
    }

    #[test]
    fn test_from_toml_empty() {
        let config = RelayConfig::from_toml("").unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let config = RelayConfig::from_toml(
            r#"
            [server]
            bind = "127.0.0.1"
            port = 9100
            path = "/terminal"

            [shell]
            program = "/bin/sh"
            args = ["-i"]
            term = "xterm-256color"
            working_dir = "/srv"
            inherit_env = false
            unset_env = ["SECRET"]

            [shell.env]
            LANG = "C.UTF-8"

            [sessions]
            max_sessions = 0
            idle_timeout_secs = 900
            "#,
        )
        .unwrap();

        assert_eq!(config.server.socket_addr(), "127.0.0.1:9100");
        assert_eq!(config.server.path, "/terminal");
        assert_eq!(config.shell.program.as_deref(), Some("/bin/sh"));
        assert_eq!(config.shell.args, vec!["-i".to_string()]);
        assert_eq!(config.shell.working_dir, Some(PathBuf::from("/srv")));
        assert_eq!(config.sessions.cap(), None);
        assert_eq!(
            config.sessions.idle_timeout(),
            Some(Duration::from_secs(900))
        );
    }

    #[test]
    fn test_from_toml_invalid_path() {
        let result = RelayConfig::from_toml("[server]\npath = \"ws\"\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let result = RelayConfig::from_toml("[server]\nport = \"five\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_idle_timeout_bounds() {
        let config = RelayConfig::from_toml(&format!(
            "[sessions]\nidle_timeout_secs = {}\n",
            MAX_IDLE_TIMEOUT_SECS
        ))
        .unwrap();
        assert_eq!(
            config.sessions.idle_timeout(),
            Some(Duration::from_secs(MAX_IDLE_TIMEOUT_SECS))
        );

        let mut config = RelayConfig::default();
        config.sessions.idle_timeout_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = RelayConfig::load(&dir.path().join("relay.toml")).unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_load_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "[sessions]\nmax_sessions = 2\n").unwrap();

        let config = RelayConfig::load(&path).unwrap();
        assert_eq!(config.sessions.cap(), Some(2));
        assert_eq!(config.server.port, DEFAULT_PORT);
    }

    #[test]
    fn test_environment_explicit() {
        let mut shell = ShellConfig {
            inherit_env: false,
            ..ShellConfig::default()
        };
        shell.env.insert("LANG".to_string(), "C.UTF-8".to_string());
        shell.env.insert("SECRET".to_string(), "x".to_string());
        shell.unset_env.push("SECRET".to_string());

        let env = shell.environment();
        assert_eq!(env.get("TERM"), Some("xterm-color"));
        assert_eq!(env.get("LANG"), Some("C.UTF-8"));
        assert_eq!(env.get("SECRET"), None);
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn test_resolve_program() {
        let shell = ShellConfig::default();
        let env = ShellEnv::new().with_var("SHELL", "/bin/zsh");
        assert_eq!(shell.resolve_program(&env), "/bin/zsh");

        let shell = ShellConfig {
            program: Some("/bin/sh".to_string()),
            ..ShellConfig::default()
        };
        assert_eq!(shell.resolve_program(&env), "/bin/sh");
    }

    #[cfg(not(windows))]
    #[test]
    fn test_resolve_program_fallback() {
        let shell = ShellConfig::default();
        assert_eq!(shell.resolve_program(&ShellEnv::new()), "bash");
        let env = ShellEnv::new().with_var("SHELL", "");
        assert_eq!(shell.resolve_program(&env), "bash");
    }

    #[test]
    fn test_spawn_spec() {
        let shell = ShellConfig {
            program: Some("/bin/sh".to_string()),
            working_dir: Some(PathBuf::from("/tmp")),
            ..ShellConfig::default()
        };
        let spec = shell.spawn_spec();
        assert_eq!(spec.program, "/bin/sh");
        assert_eq!(spec.cwd, PathBuf::from("/tmp"));
        assert_eq!(spec.size, TerminalSize::new(80, 24));
        assert_eq!(spec.env.get("TERM"), Some("xterm-color"));
    }
}
