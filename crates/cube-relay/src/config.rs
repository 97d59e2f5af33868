//! Relay configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`RelayConfig::default()`]
//! 2. Apply the defaults file (dotenv syntax), if it exists
//! 3. Apply process environment variables (highest priority before CLI flags)
//!
//! Invalid values are ignored and fall back to the previous layer.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use cube_core::{RelayError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Location of the service's defaults file on installed systems.
pub const DEFAULT_ENV_FILE: &str = "/etc/default/variocube-cube-app-service";

/// Configuration for the relay service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Host to listen on.
    pub host: String,
    /// Port to listen on (`0` picks a free port).
    pub port: u16,
    /// Host of the locker controller.
    pub controller_host: String,
    /// Port of the locker controller.
    pub controller_port: u16,
    /// Path of the controller's app endpoint.
    pub controller_path: String,
    /// Upgrade requests whose path starts with this prefix join the mock group.
    pub mock_path_prefix: String,
    /// Delay between controller connection attempts.
    pub controller_reconnect_ms: u64,
    /// Interval between server-initiated Ping frames.
    pub heartbeat_interval_ms: u64,
    /// Outbound queue length per session.
    pub max_send_queue: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 4000,
            controller_host: "localhost".into(),
            controller_port: 9000,
            controller_path: "/app".into(),
            mock_path_prefix: "/mock".into(),
            controller_reconnect_ms: 3000,
            heartbeat_interval_ms: 10_000,
            max_send_queue: 256,
        }
    }
}

impl RelayConfig {
    /// Defaults, then the env file at `env_file` (if any), then the process
    /// environment.
    pub fn load(env_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = env_file {
            let vars = load_env_file(path)?;
            config.apply_env_overrides(|key| vars.get(key).cloned());
        }
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `HOST`, `PORT`, `CONTROLLER_HOST` and
    /// `CONTROLLER_PORT` as resolved by `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = read_string(&lookup, "HOST") {
            self.host = v;
        }
        if let Some(v) = read_u16(&lookup, "PORT") {
            self.port = v;
        }
        if let Some(v) = read_string(&lookup, "CONTROLLER_HOST") {
            self.controller_host = v;
        }
        if let Some(v) = read_u16(&lookup, "CONTROLLER_PORT") {
            self.controller_port = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(RelayError::Config("host must not be empty".into()));
        }
        if self.controller_host.trim().is_empty() {
            return Err(RelayError::Config("controller host must not be empty".into()));
        }
        if !self.mock_path_prefix.starts_with('/') {
            return Err(RelayError::Config(format!(
                "mock path prefix must start with '/': {}",
                self.mock_path_prefix
            )));
        }
        if self.max_send_queue == 0 {
            return Err(RelayError::Config("max send queue must be positive".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(RelayError::Config("heartbeat interval must be positive".into()));
        }
        Ok(())
    }

    /// `host:port` for the listening endpoint.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// WebSocket URL of the controller's app endpoint.
    pub fn controller_url(&self) -> String {
        format!(
            "ws://{}:{}{}",
            self.controller_host, self.controller_port, self.controller_path
        )
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.controller_reconnect_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Sessions silent for this long are dropped.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval() * 3
    }
}

/// Read a defaults file of `KEY=VALUE` lines. A missing file yields no values.
pub fn load_env_file(path: &Path) -> Result<HashMap<String, String>> {
    match dotenvy::from_path_iter(path) {
        Ok(iter) => {
            debug!(?path, "loading env file");
            collect_env(iter)
        }
        Err(dotenvy::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(?path, "env file not found, using defaults");
            Ok(HashMap::new())
        }
        Err(e) => Err(env_file_error(e)),
    }
}

/// Parse env-file `content` in dotenv syntax. Lines that do not parse are
/// skipped with a warning.
pub fn parse_env_file(content: &str) -> Result<HashMap<String, String>> {
    collect_env(dotenvy::from_read_iter(content.as_bytes()))
}

fn collect_env<R: std::io::Read>(iter: dotenvy::Iter<R>) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    for item in iter {
        match item {
            Ok((key, value)) => {
                let _ = vars.insert(key, value);
            }
            Err(dotenvy::Error::LineParse(line, index)) => {
                warn!(%line, index, "skipping malformed env file line");
            }
            Err(e) => return Err(env_file_error(e)),
        }
    }
    Ok(vars)
}

fn env_file_error(e: dotenvy::Error) -> RelayError {
    match e {
        dotenvy::Error::Io(e) => RelayError::Io(e),
        other => RelayError::Config(format!("env file: {other}")),
    }
}

fn read_string(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn read_u16(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u16> {
    read_string(lookup, key)?.parse().ok()
}
