use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default)]
    pub format: Option<LogFormat>,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 12345))
}

fn default_backlog() -> u32 {
    100
}

fn default_audit_log() -> PathBuf {
    PathBuf::from("./proxy.log")
}

fn default_connect_timeout() -> Option<u64> {
    Some(10)
}

fn default_shutdown_grace() -> u64 {
    5
}

pub const DEFAULT_TUNNEL_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    // Pending-connection queue length passed to listen(2)
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    // Append-only audit log of client connections, requests and tunnel closes
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: Option<u64>,
    // Tunnels with no traffic in either direction for this long are torn down
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub tunnel_buffer_size: Option<usize>,
    // How long in-flight sessions may keep running after shutdown is requested
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            backlog: default_backlog(),
            audit_log: default_audit_log(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: None,
            tunnel_buffer_size: None,
            shutdown_grace_secs: default_shutdown_grace(),
            logging: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("Failed to read {}: {}", path, e)))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("Failed to parse {}: {}", path, e)))?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), ProxyError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ProxyError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.backlog == 0 {
            return Err(ProxyError::Config("backlog must be greater than zero".to_string()));
        }
        if self.connect_timeout_secs == Some(0) {
            return Err(ProxyError::Config(
                "connect_timeout_secs must be greater than zero when set".to_string(),
            ));
        }
        if self.idle_timeout_secs == Some(0) {
            return Err(ProxyError::Config(
                "idle_timeout_secs must be greater than zero when set".to_string(),
            ));
        }
        if let Some(size) = self.tunnel_buffer_size {
            if size < 512 {
                return Err(ProxyError::Config(format!(
                    "tunnel_buffer_size {} is too small (minimum 512 bytes)",
                    size
                )));
            }
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn tunnel_buffer_size(&self) -> usize {
        self.tunnel_buffer_size.unwrap_or(DEFAULT_TUNNEL_BUFFER_SIZE)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
