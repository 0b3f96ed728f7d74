//! YAML configuration loading and validation
//!
//! Everything here is resolved once at startup: defaults applied, log
//! directories created, run-as users looked up, stop signals parsed. The
//! running core only ever sees a validated, read-only [`Config`]. Bad
//! configuration is fatal at startup and never a runtime error.

use crate::process::{LaunchSpec, Signal};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Placeholder substituted with the leased internal port in an app's command
/// and environment.
pub const PORT_BADGE: &str = "{port}";

const DEFAULT_PORT_FROM: u16 = 10000;
const DEFAULT_PORT_TO: u16 = 11000;
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_RPC_PORT: u16 = 9001;
const DEFAULT_EXTERNAL_PORT: u16 = 8080;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_START_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CHILD_LOG_DIR: &str = "/var/log/rollgate";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid internal port range {from}..{to}")]
    InvalidPortRange { from: u16, to: u16 },
    #[error("app name is required")]
    NameRequired,
    #[error("app {0}: command is required")]
    CommandRequired(String),
    #[error("app {0}: command or environment must contain the {{port}} badge")]
    PortBadgeRequired(String),
    #[error("app {app}: environment entry '{entry}' is not KEY=VALUE")]
    InvalidEnvEntry { app: String, entry: String },
    #[error("duplicate external port {0}")]
    DuplicateExternalPort(u16),
    #[error("cannot resolve user '{0}'")]
    UnknownUser(String),
}

/// Top-level supervisor configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub port_range: PortRangeConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub logger: LoggerConfig,
    /// Default run-as user for all apps; apps may override.
    pub user: Option<UserConfig>,
    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        if self.port_range.from >= self.port_range.to {
            return Err(ConfigError::InvalidPortRange {
                from: self.port_range.from,
                to: self.port_range.to,
            });
        }

        if let Some(user) = self.user.as_mut() {
            user.resolve()?;
        }
        let global_user = self.user.clone();

        let mut external_ports = HashSet::new();
        for app in &mut self.apps {
            app.validate(&self.logger, global_user.as_ref())?;
            if !external_ports.insert(app.external_port) {
                return Err(ConfigError::DuplicateExternalPort(app.external_port));
            }
        }

        Ok(())
    }
}

/// Internal port range `[from, to)` that instances bind to.
#[derive(Debug, Deserialize)]
pub struct PortRangeConfig {
    #[serde(default = "default_port_from")]
    pub from: u16,
    #[serde(default = "default_port_to")]
    pub to: u16,
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            from: DEFAULT_PORT_FROM,
            to: DEFAULT_PORT_TO,
        }
    }
}

/// Bind address for the control API.
#[derive(Debug, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_rpc_port")]
    pub port: u16,
}

impl RpcConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_RPC_PORT,
        }
    }
}

/// Where per-app child output lands by default.
#[derive(Debug, Deserialize)]
pub struct LoggerConfig {
    #[serde(default = "default_child_log_dir")]
    pub child_log_dir: PathBuf,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            child_log_dir: PathBuf::from(DEFAULT_CHILD_LOG_DIR),
        }
    }
}

/// A run-as user, resolved to uid/gid at load time.
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub username: String,
    #[serde(skip)]
    resolved: Option<(u32, u32)>,
}

impl UserConfig {
    fn resolve(&mut self) -> Result<(), ConfigError> {
        match lookup_user(&self.username) {
            Some(ids) => {
                self.resolved = Some(ids);
                Ok(())
            }
            None => Err(ConfigError::UnknownUser(self.username.clone())),
        }
    }

    pub fn ids(&self) -> Option<(u32, u32)> {
        self.resolved
    }
}

#[cfg(unix)]
fn lookup_user(name: &str) -> Option<(u32, u32)> {
    let cname = std::ffi::CString::new(name).ok()?;
    let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pw.is_null() {
        None
    } else {
        unsafe { Some(((*pw).pw_uid, (*pw).pw_gid)) }
    }
}

#[cfg(not(unix))]
fn lookup_user(_name: &str) -> Option<(u32, u32)> {
    None
}

/// One supervised application.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub name: String,
    /// Command template; the `{port}` badge marks where the leased internal
    /// port is injected.
    #[serde(default)]
    pub command: String,
    /// Extra environment entries as `KEY=VALUE`, `{port}` substituted too.
    #[serde(default)]
    pub environment: Vec<String>,
    /// Health probe: an absolute path means HTTP GET against the instance,
    /// anything else is run as a command (exit 0 = healthy), unset means a
    /// bare TCP connect probe.
    pub healthcheck: Option<String>,
    #[serde(default)]
    pub stop_signal: Signal,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_host")]
    pub internal_host: String,
    #[serde(default = "default_host")]
    pub external_host: String,
    #[serde(default = "default_external_port")]
    pub external_port: u16,
    pub stdout_log_file: Option<PathBuf>,
    pub stderr_log_file: Option<PathBuf>,
    pub user: Option<UserConfig>,
}

impl AppConfig {
    fn validate(
        &mut self,
        logger: &LoggerConfig,
        global_user: Option<&UserConfig>,
    ) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::NameRequired);
        }
        if self.command.is_empty() {
            return Err(ConfigError::CommandRequired(self.name.clone()));
        }
        if !self.has_port_badge() {
            return Err(ConfigError::PortBadgeRequired(self.name.clone()));
        }
        for entry in &self.environment {
            if !entry.contains('=') {
                return Err(ConfigError::InvalidEnvEntry {
                    app: self.name.clone(),
                    entry: entry.clone(),
                });
            }
        }

        if self.stdout_log_file.is_none() {
            self.stdout_log_file =
                Some(logger.child_log_dir.join(format!("app_{}.out", self.name)));
        }
        if self.stderr_log_file.is_none() {
            self.stderr_log_file =
                Some(logger.child_log_dir.join(format!("app_{}.err", self.name)));
        }
        for path in [&self.stdout_log_file, &self.stderr_log_file].into_iter().flatten() {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
        }

        match self.user.as_mut() {
            Some(user) => user.resolve()?,
            None => self.user = global_user.cloned(),
        }

        Ok(())
    }

    fn has_port_badge(&self) -> bool {
        self.command.contains(PORT_BADGE)
            || self.environment.iter().any(|e| e.contains(PORT_BADGE))
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn internal_host_port(&self, port: u16) -> String {
        format!("{}:{}", self.internal_host, port)
    }

    pub fn external_host_port(&self) -> String {
        format!("{}:{}", self.external_host, self.external_port)
    }

    /// Render the launch spec for one instance: badge substituted, env split,
    /// log sinks and run-as user attached.
    pub fn launch_spec(&self, instance_id: u32, port: u16) -> LaunchSpec {
        let port_str = port.to_string();
        let env = self
            .environment
            .iter()
            .map(|entry| {
                let rendered = entry.replace(PORT_BADGE, &port_str);
                let (key, value) = rendered.split_once('=').unwrap_or((rendered.as_str(), ""));
                (key.to_string(), value.to_string())
            })
            .collect();

        LaunchSpec {
            app_name: self.name.clone(),
            instance_id,
            command: self.command.replace(PORT_BADGE, &port_str),
            env,
            stdout_log: self.stdout_log_file.clone().unwrap_or_default(),
            stderr_log: self.stderr_log_file.clone().unwrap_or_default(),
            run_as: self.user.as_ref().and_then(|u| u.ids()),
        }
    }
}

#[cfg(test)]
impl AppConfig {
    /// Minimal validated-shape config for state machine tests. The `true`
    /// health probe command reports healthy on every tick.
    pub fn for_tests(name: &str) -> Self {
        Self {
            name: name.to_string(),
            command: "fake-server --port {port}".to_string(),
            environment: Vec::new(),
            healthcheck: Some("true".to_string()),
            stop_signal: Signal::Term,
            max_retries: DEFAULT_MAX_RETRIES,
            start_timeout_secs: 60,
            stop_timeout_secs: 60,
            internal_host: "127.0.0.1".to_string(),
            external_host: DEFAULT_HOST.to_string(),
            external_port: DEFAULT_EXTERNAL_PORT,
            stdout_log_file: Some(std::env::temp_dir().join(format!("app_{name}.out"))),
            stderr_log_file: Some(std::env::temp_dir().join(format!("app_{name}.err"))),
            user: None,
        }
    }
}

fn default_port_from() -> u16 {
    DEFAULT_PORT_FROM
}
fn default_port_to() -> u16 {
    DEFAULT_PORT_TO
}
fn default_host() -> String {
    DEFAULT_HOST.to_string()
}
fn default_rpc_port() -> u16 {
    DEFAULT_RPC_PORT
}
fn default_external_port() -> u16 {
    DEFAULT_EXTERNAL_PORT
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_start_timeout() -> u64 {
    DEFAULT_START_TIMEOUT_SECS
}
fn default_stop_timeout() -> u64 {
    DEFAULT_STOP_TIMEOUT_SECS
}
fn default_child_log_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CHILD_LOG_DIR)
}
