//! Server settings: YAML file (path in `TETHER_SETTINGS`) plus env overrides.

use serde::Deserialize;
use std::path::Path;

use crate::error::ConfigError;

pub const SETTINGS_ENV: &str = "TETHER_SETTINGS";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    /// Threads that run view procedures; one running view occupies one thread.
    pub runtime_workers: usize,
    pub general_workers: usize,
    pub channel_workers: usize,
    /// Single-user runtimes a user may hold at once (0 = unlimited).
    pub max_runtimes_per_user: usize,
    /// `tracing_subscriber::EnvFilter` directive.
    pub log: String,
    /// Close connections that send malformed frames instead of ignoring them.
    pub strict_protocol: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            runtime_workers: 64,
            general_workers: num_cpus::get(),
            channel_workers: 4,
            max_runtimes_per_user: 0,
            log: "info".to_string(),
            strict_protocol: false,
        }
    }
}

impl Settings {
    pub fn from_yaml(source: &str) -> Result<Self, ConfigError> {
        if source.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(source)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&source)
    }

    /// Defaults, then the YAML file named by `TETHER_SETTINGS`, then
    /// `TETHER_HOST` / `TETHER_PORT` / `TETHER_LOG`.
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = match std::env::var(SETTINGS_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        settings.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(settings)
    }

    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(host) = lookup("TETHER_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("TETHER_PORT") {
            self.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                name: "TETHER_PORT".to_string(),
                value: port.clone(),
            })?;
        }
        if let Some(log) = lookup("TETHER_LOG") {
            self.log = log;
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
