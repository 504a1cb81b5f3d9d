//! Configuration loading: `config.json` in the working directory when
//! present, code defaults otherwise. Every section and field is optional in
//! the file; absent values fall back to the defaults below.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::security::{CertificateConfig, PhysicsConfig, RateLimitConfig, SecurityConfig};
use crate::server::ServerConfig;

/// Default location of the optional configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Shared port for the TCP control listener and the UDP datagram socket.
    pub port: u16,
    /// Hostname used as certificate CN and primary SAN.
    pub hostname: String,
    /// Publicly routable address to include in the certificate SAN set.
    pub public_ip: Option<IpAddr>,
    pub certificate: CertificateSettings,
    pub server: ServerSettings,
    pub security: SecuritySettings,
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 443,
            hostname: "localhost".to_owned(),
            public_ip: None,
            certificate: CertificateSettings::default(),
            server: ServerSettings::default(),
            security: SecuritySettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl Default for CertificateSettings {
    fn default() -> Self {
        let defaults = CertificateConfig::default();
        Self {
            cert_path: defaults.cert_path,
            key_path: defaults.key_path,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub max_players_per_room: usize,
    pub idle_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Outbound control-channel queue depth per session.
    pub session_buffer: usize,
    pub max_line_length: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_players_per_room: 20,
            idle_timeout_secs: 60,
            heartbeat_interval_secs: 30,
            session_buffer: 64,
            max_line_length: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    pub control_messages_per_second: u32,
    pub datagrams_per_second: u32,
    pub burst_allowance: u32,
    /// Validation failures within the window that trigger a kick.
    pub violation_threshold: usize,
    pub violation_window_secs: u64,
    pub event_buffer_capacity: usize,
    pub physics: PhysicsSettings,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            control_messages_per_second: 10,
            datagrams_per_second: 120,
            burst_allowance: 10,
            violation_threshold: 3,
            violation_window_secs: 300,
            event_buffer_capacity: 1000,
            physics: PhysicsSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicsSettings {
    pub max_speed: f32,
    pub max_jump: f32,
    pub max_angular_velocity: f32,
    pub world_bounds_xz: f32,
    pub world_bounds_y: f32,
    pub min_update_interval_ms: u64,
    pub max_update_interval_secs: u64,
    pub input_timestamp_tolerance_ms: i64,
}

impl Default for PhysicsSettings {
    fn default() -> Self {
        let defaults = PhysicsConfig::default();
        Self {
            max_speed: defaults.max_speed,
            max_jump: defaults.max_jump,
            max_angular_velocity: defaults.max_angular_velocity,
            world_bounds_xz: defaults.world_bounds_xz,
            world_bounds_y: defaults.world_bounds_y,
            min_update_interval_ms: defaults.min_update_interval.as_millis() as u64,
            max_update_interval_secs: defaults.max_update_interval.as_secs(),
            input_timestamp_tolerance_ms: defaults.input_timestamp_tolerance_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Explicit level; falls back to RUST_LOG, then "info".
    pub level: Option<LogLevel>,
    pub format: LogFormat,
    pub enable_file_logging: bool,
    pub dir: String,
    pub filename: String,
    /// "daily", "hourly", or "never".
    pub rotation: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: LogFormat::Text,
            enable_file_logging: false,
            dir: "logs".to_owned(),
            filename: "slipstream-server.log".to_owned(),
            rotation: "daily".to_owned(),
        }
    }
}

/// Load configuration from the default path, falling back to defaults.
#[must_use]
pub fn load() -> AppConfig {
    load_from(Path::new(DEFAULT_CONFIG_PATH))
}

/// Load configuration from a specific path. A missing file yields defaults;
/// an unreadable or invalid file is reported and also yields defaults.
#[must_use]
pub fn load_from(path: &Path) -> AppConfig {
    if !path.exists() {
        return AppConfig::default();
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(err) => {
                eprintln!(
                    "Invalid config file {}: {err}; continuing with defaults",
                    path.display()
                );
                AppConfig::default()
            }
        },
        Err(err) => {
            eprintln!(
                "Failed to read config file {}: {err}; continuing with defaults",
                path.display()
            );
            AppConfig::default()
        }
    }
}

/// Startup sanity checks; failures abort startup (or --validate-config).
pub fn validate(config: &AppConfig) -> anyhow::Result<()> {
    anyhow::ensure!(config.port != 0, "port must be non-zero");
    anyhow::ensure!(!config.hostname.is_empty(), "hostname must not be empty");
    anyhow::ensure!(
        (1..=crate::server::MAX_SPAWN_SLOTS).contains(&config.server.max_players_per_room),
        "server.max_players_per_room must be between 1 and {} (spawn table size)",
        crate::server::MAX_SPAWN_SLOTS
    );
    anyhow::ensure!(
        config.server.idle_timeout_secs > 0,
        "server.idle_timeout_secs must be positive"
    );
    anyhow::ensure!(
        config.security.violation_threshold > 0,
        "security.violation_threshold must be positive"
    );
    anyhow::ensure!(
        config.security.physics.max_speed > 0.0 && config.security.physics.max_jump > 0.0,
        "physics limits must be positive"
    );
    anyhow::ensure!(
        ["daily", "hourly", "never"].contains(&config.logging.rotation.as_str()),
        "logging.rotation must be one of daily, hourly, never"
    );
    Ok(())
}

impl AppConfig {
    /// Lower the file-facing settings into the runtime server configuration.
    #[must_use]
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            port: self.port,
            bind_addr: ServerConfig::default().bind_addr,
            hostname: self.hostname.clone(),
            public_ip: self.public_ip,
            max_players_per_room: self.server.max_players_per_room,
            idle_timeout: Duration::from_secs(self.server.idle_timeout_secs),
            heartbeat_interval: Duration::from_secs(self.server.heartbeat_interval_secs),
            session_buffer: self.server.session_buffer,
            max_line_length: self.server.max_line_length,
            certificate: CertificateConfig {
                cert_path: self.certificate.cert_path.clone(),
                key_path: self.certificate.key_path.clone(),
            },
            security: SecurityConfig {
                rate_limits: RateLimitConfig {
                    control_per_window: self.security.control_messages_per_second,
                    datagrams_per_window: self.security.datagrams_per_second,
                    burst_allowance: self.security.burst_allowance,
                    ..RateLimitConfig::default()
                },
                physics: PhysicsConfig {
                    max_speed: self.security.physics.max_speed,
                    max_jump: self.security.physics.max_jump,
                    max_angular_velocity: self.security.physics.max_angular_velocity,
                    world_bounds_xz: self.security.physics.world_bounds_xz,
                    world_bounds_y: self.security.physics.world_bounds_y,
                    min_update_interval: Duration::from_millis(
                        self.security.physics.min_update_interval_ms,
                    ),
                    max_update_interval: Duration::from_secs(
                        self.security.physics.max_update_interval_secs,
                    ),
                    input_timestamp_tolerance_ms: self.security.physics.input_timestamp_tolerance_ms,
                },
                violation_threshold: self.security.violation_threshold,
                violation_window: Duration::from_secs(self.security.violation_window_secs),
                event_buffer_capacity: self.security.event_buffer_capacity,
            },
        }
    }

    /// Serialize for --print-config.
    pub fn to_pretty_json(&self) -> anyhow::Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        validate(&AppConfig::default()).unwrap();
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_from(Path::new("does-not-exist.json"));
        assert_eq!(config.port, 443);
        assert_eq!(config.server.max_players_per_room, 20);
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"port": 8443, "security": {"datagrams_per_second": 60}}"#)
            .unwrap();

        let config = load_from(&path);
        assert_eq!(config.port, 8443);
        assert_eq!(config.security.datagrams_per_second, 60);
        // Untouched fields keep their defaults.
        assert_eq!(config.security.control_messages_per_second, 10);
        assert_eq!(config.hostname, "localhost");
    }

    #[test]
    fn invalid_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        let config = load_from(&path);
        assert_eq!(config.port, 443);
    }

    #[test]
    fn oversized_room_limit_is_rejected() {
        let config = AppConfig {
            server: ServerSettings {
                max_players_per_room: 21,
                ..ServerSettings::default()
            },
            ..AppConfig::default()
        };
        assert!(validate(&config).is_err());
    }

    #[test]
    fn runtime_mapping_carries_overrides() {
        let app = AppConfig {
            port: 9000,
            ..AppConfig::default()
        };
        let server = app.server_config();
        assert_eq!(server.port, 9000);
        assert_eq!(server.security.rate_limits.datagrams_per_window, 120);
        assert_eq!(server.idle_timeout, Duration::from_secs(60));
    }
}
