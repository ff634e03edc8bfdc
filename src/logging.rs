use crate::config::{LogFormat, LogLevel};
use crate::session::ClientIdentity;
use chrono::{DateTime, Utc};
use log::warn;
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

/// Install the process-wide `env_logger`, honouring `RUST_LOG` when set.
pub fn init_logging(level: &LogLevel, format: &LogFormat) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.to_string()));

    if *format == LogFormat::Json {
        builder.format(|buf, record| {
            let timestamp: DateTime<Utc> = Utc::now();
            let log_entry = json!({
                "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
                "level": record.level().to_string().to_lowercase(),
                "target": record.target(),
                "module": record.module_path().unwrap_or("unknown"),
                "line": record.line().unwrap_or(0),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", log_entry)
        });
    }

    // A second init (tests, embedding) keeps whichever logger won.
    let _ = builder.try_init();
}

pub fn parse_log_level(s: &str) -> Result<LogLevel, String> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => Err(format!("Invalid log level: {}. Must be one of: trace, debug, info, warn, error", s)),
    }
}

pub fn parse_log_format(s: &str) -> Result<LogFormat, String> {
    match s.to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(format!("Invalid log format: {}. Must be one of: text, json", s)),
    }
}

/// Append-only record of client connections, requests and tunnel closes.
///
/// Every line is written and flushed under one lock, so lines from concurrent
/// sessions never interleave. When the file cannot be opened the log is
/// disabled with a warning instead of stopping the proxy.
pub struct AuditLog {
    writer: Option<Mutex<BufWriter<File>>>,
}

impl AuditLog {
    pub fn open(path: &Path) -> Self {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Self {
                writer: Some(Mutex::new(BufWriter::new(file))),
            },
            Err(e) => {
                warn!("Audit log {} unavailable, continuing without it: {}", path.display(), e);
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self { writer: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    pub fn client_connected(&self, identity: &ClientIdentity) {
        self.append(&format!(
            "Client connect to the server. Client ID: {} Client IP: {}",
            identity.id, identity.address
        ));
    }

    pub fn request(&self, identity: &ClientIdentity, request_line: &str) {
        self.append(&format!(
            "Client ID: {} Client IP: {} Request: {}",
            identity.id, identity.address, request_line
        ));
    }

    pub fn tunnel_closed(&self, identity: &ClientIdentity) {
        self.append(&format!(
            "Client ID: {} Client IP: {} Tunnel closed",
            identity.id, identity.address
        ));
    }

    fn append(&self, line: &str) {
        let Some(writer) = &self.writer else {
            return;
        };
        if let Ok(mut writer) = writer.lock() {
            let _ = writeln!(writer, "{}", line);
            let _ = writer.flush();
        }
    }
}
