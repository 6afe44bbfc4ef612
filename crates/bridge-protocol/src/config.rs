use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Top-level configuration, assembled from environment variables with an
/// optional `.env` file loaded first. See `ground-bridge`'s `config` module
/// for the loading/overlay logic; this struct only holds the resulting
/// typed values and their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub local_http: LocalHttpConfig,
    #[serde(default)]
    pub drone: DroneConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// `SIGNALING_ENDPOINT`: base URL of the cloud signaling service.
    #[serde(default = "default_signaling_endpoint")]
    pub endpoint: String,
    /// `SIGNALING_ENDPOINT_MAX_RETRY`: bounded dial retries before `restartApp`.
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    /// `SIGNALING_ENDPOINT_RETRY_INTERVAL`: sleep between dial retries.
    #[serde(default = "default_retry_interval", with = "duration_secs")]
    pub retry_interval: Duration,
    /// Consecutive read errors tolerated before forcing a reconnect. Not
    /// externally configurable — fixed at startup.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_read_errors: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}

impl LogLevel {
    pub fn as_tracing_level(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" => Some(LogLevel::Warn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    /// `LOG_OUTPUT_DIR`: directory for the rotating log file. `None` disables file logging.
    pub output_dir: Option<String>,
    #[serde(default = "default_log_file_base_name")]
    pub file_base_name: String,
    /// `LOG_DAYS_TO_RESERVER`: files older than this are pruned at startup/daily.
    #[serde(default = "default_log_days_to_reserve")]
    pub days_to_reserve: u32,
    #[serde(default = "default_true")]
    pub output_console: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalHttpConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub open_browser_on_startup: bool,
    /// `GO_STATIC_FILE_DIR`
    pub static_file_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroneConfig {
    #[serde(default = "default_command_addr")]
    pub command_addr: SocketAddr,
    #[serde(default = "default_state_bind")]
    pub state_bind: SocketAddr,
    #[serde(default = "default_video_bind")]
    pub video_bind: SocketAddr,
}

fn default_signaling_endpoint() -> String {
    "https://signaling.example.com".to_string()
}
fn default_max_retry() -> u32 {
    5
}
fn default_retry_interval() -> Duration {
    Duration::from_secs(3)
}
fn default_max_consecutive_errors() -> u32 {
    10
}
fn default_log_level() -> LogLevel {
    LogLevel::Info
}
fn default_log_file_base_name() -> String {
    "ground-bridge".to_string()
}
fn default_log_days_to_reserve() -> u32 {
    7
}
fn default_true() -> bool {
    true
}
fn default_port() -> u16 {
    8080
}
fn default_command_addr() -> SocketAddr {
    "192.168.10.1:8889".parse().unwrap()
}
fn default_state_bind() -> SocketAddr {
    "0.0.0.0:8890".parse().unwrap()
}
fn default_video_bind() -> SocketAddr {
    "0.0.0.0:11111".parse().unwrap()
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_signaling_endpoint(),
            max_retry: default_max_retry(),
            retry_interval: default_retry_interval(),
            max_consecutive_read_errors: default_max_consecutive_errors(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output_dir: None,
            file_base_name: default_log_file_base_name(),
            days_to_reserve: default_log_days_to_reserve(),
            output_console: true,
        }
    }
}

impl Default for LocalHttpConfig {
    fn default() -> Self {
        Self { port: default_port(), open_browser_on_startup: false, static_file_dir: None }
    }
}

impl Default for DroneConfig {
    fn default() -> Self {
        Self {
            command_addr: default_command_addr(),
            state_bind: default_state_bind(),
            video_bind: default_video_bind(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            logging: LoggingConfig::default(),
            local_http: LocalHttpConfig::default(),
            drone: DroneConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the bridge refuses to start)
    /// or "WARNING:" (advisory, the bridge can still start).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.local_http.port == 0 {
            issues.push("ERROR: local_http.port must be between 1 and 65535, got 0.".to_string());
        }

        if self.signaling.endpoint.is_empty() {
            issues.push("ERROR: signaling.endpoint must not be empty.".to_string());
        } else if !self.signaling.endpoint.starts_with("http://")
            && !self.signaling.endpoint.starts_with("https://")
        {
            issues.push(format!(
                "ERROR: signaling.endpoint '{}' must start with http:// or https://.",
                self.signaling.endpoint
            ));
        }

        if self.signaling.max_retry == 0 {
            issues.push(
                "WARNING: signaling.max_retry is 0 — the bridge will restartApp on the first dial failure."
                    .to_string(),
            );
        }

        if self.logging.days_to_reserve == 0 {
            issues.push("WARNING: logging.days_to_reserve is 0 — rotated logs are pruned immediately.".to_string());
        }

        if issues.iter().any(|i| i.starts_with("ERROR")) {
            return Err(issues);
        }
        if !issues.is_empty() {
            for issue in &issues {
                eprintln!("{issue}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.local_http.port, 8080);
        assert_eq!(config.signaling.max_retry, 5);
        assert_eq!(config.signaling.max_consecutive_read_errors, 10);
        assert_eq!(config.drone.command_addr, default_command_addr());
        assert_eq!(config.drone.state_bind, default_state_bind());
        assert_eq!(config.drone.video_bind, default_video_bind());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn log_level_parses_case_insensitively() {
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("WARN"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("bogus"), None);
    }

    #[test]
    fn validate_rejects_zero_port() {
        let mut config = BridgeConfig::default();
        config.local_http.port = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("port")));
    }

    #[test]
    fn validate_rejects_bad_endpoint_scheme() {
        let mut config = BridgeConfig::default();
        config.signaling.endpoint = "ftp://example.com".to_string();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("http")));
    }
}
