use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Input words handled by the router itself, never by an agent or the shell.
pub const CONTROL_WORDS: [&str; 4] = ["clear", "help", "status", "history"];

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "SWITCHYARD_CONFIG";

/// Top-level configuration loaded from `~/.switchyard/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default = "default_agents")]
    pub agents: Vec<AgentConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            server: ServerConfig::default(),
            sessions: SessionsConfig::default(),
            executor: ExecutorConfig::default(),
            agents: default_agents(),
        }
    }
}

impl Config {
    /// Load config from `$SWITCHYARD_CONFIG` or `~/.switchyard/config.toml`,
    /// falling back to defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            tracing::info!(path = %path.display(), "no config file found, using defaults");
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.validate()?;
        self.server.validate()?;
        self.sessions.validate()?;
        self.executor.validate()?;

        let mut keywords = HashSet::new();
        let mut kinds = HashSet::new();
        for agent in &self.agents {
            agent.validate()?;
            if !keywords.insert(agent.keyword.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "agents: duplicate keyword '{}'",
                    agent.keyword
                )));
            }
            if !kinds.insert(agent.kind.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "agents: duplicate kind '{}'",
                    agent.kind
                )));
            }
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Ok(p) = std::env::var(CONFIG_ENV) {
            if !p.is_empty() {
                return PathBuf::from(p);
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".switchyard")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `human` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl GeneralConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.log_format.as_str() {
            "human" | "json" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "general.log_format must be 'human' or 'json', got '{other}'"
            ))),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "human".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// A connection with no inbound activity for this long is no longer live
    /// and loses its claim on the sessions it owns.
    #[serde(default = "default_liveness_grace")]
    pub liveness_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            liveness_grace_secs: default_liveness_grace(),
        }
    }
}

impl ServerConfig {
    pub fn liveness_grace(&self) -> Duration {
        Duration::from_secs(self.liveness_grace_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.liveness_grace_secs == 0 {
            return Err(ConfigError::Validation(
                "server.liveness_grace_secs must be greater than zero".into(),
            ));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "server.heartbeat_interval_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    7420
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_liveness_grace() -> u64 {
    90
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Detached sessions older than this are closed by the idle reaper.
    #[serde(default = "default_detached_grace")]
    pub detached_grace_secs: u64,
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
    /// Number of most recent records replayed on attach; `None` replays all.
    #[serde(default)]
    pub replay_limit: Option<usize>,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            detached_grace_secs: default_detached_grace(),
            reap_interval_secs: default_reap_interval(),
            replay_limit: None,
        }
    }
}

impl SessionsConfig {
    pub fn detached_grace(&self) -> Duration {
        Duration::from_secs(self.detached_grace_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.reap_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "sessions.reap_interval_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_detached_grace() -> u64 {
    1800
}
fn default_reap_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_exec_timeout")]
    pub timeout_secs: u64,
    /// Initial working directory for new sessions; process cwd when absent.
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shell: default_shell(),
            timeout_secs: default_exec_timeout(),
            working_dir: None,
        }
    }
}

impl ExecutorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "executor.timeout_secs must be greater than zero".into(),
            ));
        }
        if self.shell.trim().is_empty() {
            return Err(ConfigError::Validation("executor.shell must not be empty".into()));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_shell() -> String {
    "/bin/sh".into()
}
fn default_exec_timeout() -> u64 {
    30
}

/// One agent backend and the input keyword that routes to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// First token of an input line that selects this agent.
    pub keyword: String,
    pub kind: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
    /// Upper bound on outstanding requests; further submits fail as overloaded.
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding: usize,
    /// Prompt sent when the line carries no argument.
    #[serde(default)]
    pub default_prompt: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    pub transport: AgentTransportConfig,
}

impl AgentConfig {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.kind)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let kw = self.keyword.as_str();
        if kw.is_empty() || kw.chars().any(char::is_whitespace) {
            return Err(ConfigError::Validation(format!(
                "agents: keyword '{kw}' must be a single non-empty token"
            )));
        }
        if CONTROL_WORDS.contains(&kw) {
            return Err(ConfigError::Validation(format!(
                "agents: keyword '{kw}' collides with a control word"
            )));
        }
        if self.kind.is_empty() || self.kind.contains('/') {
            return Err(ConfigError::Validation(format!(
                "agents: kind '{}' must be non-empty and contain no '/'",
                self.kind
            )));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Validation(format!(
                "agents.{}: timeout_secs must be greater than zero",
                self.kind
            )));
        }
        if self.max_outstanding == 0 {
            return Err(ConfigError::Validation(format!(
                "agents.{}: max_outstanding must be greater than zero",
                self.kind
            )));
        }
        if let AgentTransportConfig::Stdio { command, .. } = &self.transport {
            if command.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "agents.{}: stdio command must not be empty",
                    self.kind
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentTransportConfig {
    /// Persistent child process speaking line-delimited JSON-RPC.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// One HTTP POST per request; the response body is the reply.
    Http { url: String },
}

fn default_agent_timeout() -> u64 {
    120
}
fn default_max_outstanding() -> usize {
    256
}

fn default_agents() -> Vec<AgentConfig> {
    vec![
        AgentConfig {
            keyword: "claude".into(),
            kind: "claude".into(),
            display_name: Some("Claude Code".into()),
            timeout_secs: default_agent_timeout(),
            max_outstanding: default_max_outstanding(),
            default_prompt: Some("Hello Claude".into()),
            max_tokens: Some(1000),
            transport: AgentTransportConfig::Stdio {
                command: "claude-agent".into(),
                args: Vec::new(),
            },
        },
        AgentConfig {
            keyword: "gemini".into(),
            kind: "gemini".into(),
            display_name: Some("Gemini CLI".into()),
            timeout_secs: default_agent_timeout(),
            max_outstanding: default_max_outstanding(),
            default_prompt: Some("Hello Gemini".into()),
            max_tokens: Some(1000),
            transport: AgentTransportConfig::Stdio {
                command: "gemini-agent".into(),
                args: Vec::new(),
            },
        },
    ]
}
