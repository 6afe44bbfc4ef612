//! Environment-variable configuration loading: the optional `.env` file,
//! then a typed `std::env::var` overlay on top of `BridgeConfig::default()`.

use crate::error::BridgeError;
use drone_bridge_protocol::{BridgeConfig, LogLevel};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Loads `BridgeConfig::default()`, then an optional `.env` file (populating
/// only vars not already set), then every recognized `std::env::var`.
pub fn load() -> Result<BridgeConfig, BridgeError> {
    load_env_file();

    let mut config = BridgeConfig::default();

    if let Some(port) = read_env("PORT")? {
        config.local_http.port = parse_env("PORT", &port)?;
    }
    if let Some(endpoint) = std::env::var("SIGNALING_ENDPOINT").ok() {
        config.signaling.endpoint = endpoint;
    }
    if let Some(raw) = read_env("SIGNALING_ENDPOINT_MAX_RETRY")? {
        config.signaling.max_retry = parse_env("SIGNALING_ENDPOINT_MAX_RETRY", &raw)?;
    }
    if let Some(raw) = read_env("SIGNALING_ENDPOINT_RETRY_INTERVAL")? {
        let secs: u64 = parse_env("SIGNALING_ENDPOINT_RETRY_INTERVAL", &raw)?;
        config.signaling.retry_interval = Duration::from_secs(secs);
    }
    if let Some(raw) = std::env::var("LOG_LEVEL").ok() {
        config.logging.level =
            LogLevel::parse(&raw).ok_or_else(|| BridgeError::ConfigurationFatal(format!("invalid LOG_LEVEL: {raw}")))?;
    }
    if let Some(dir) = std::env::var("LOG_OUTPUT_DIR").ok() {
        config.logging.output_dir = Some(dir);
    }
    if let Some(name) = std::env::var("LOG_FILE_BASE_NAME").ok() {
        config.logging.file_base_name = name;
    }
    if let Some(raw) = read_env("LOG_DAYS_TO_RESERVER")? {
        config.logging.days_to_reserve = parse_env("LOG_DAYS_TO_RESERVER", &raw)?;
    }
    if let Some(raw) = read_env("LOG_OUTPUT_CONSOLE")? {
        config.logging.output_console = parse_bool("LOG_OUTPUT_CONSOLE", &raw)?;
    }
    if let Some(raw) = read_env("OPEN_BROWSER_ON_START_UP")? {
        config.local_http.open_browser_on_startup = parse_bool("OPEN_BROWSER_ON_START_UP", &raw)?;
    }
    if let Some(dir) = std::env::var("GO_STATIC_FILE_DIR").ok() {
        config.local_http.static_file_dir = Some(dir);
    }

    config.validate().map_err(|issues| BridgeError::ConfigurationFatal(issues.join("; ")))?;
    Ok(config)
}

/// Thin CLI override: `--config <path>` reads a `.env`-format file;
/// positional overrides for `SIGNALING_ENDPOINT`/`PORT` for local testing.
pub fn apply_cli_overrides(config: &mut BridgeConfig, args: impl Iterator<Item = String>) -> Result<(), BridgeError> {
    let args: Vec<String> = args.collect();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                if let Some(path) = args.get(i + 1) {
                    load_env_file_at(Path::new(path));
                    i += 1;
                }
            }
            "--signaling-endpoint" => {
                if let Some(value) = args.get(i + 1) {
                    config.signaling.endpoint = value.clone();
                    i += 1;
                }
            }
            "--port" => {
                if let Some(value) = args.get(i + 1) {
                    config.local_http.port = parse_env("--port", value)?;
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    Ok(())
}

fn read_env(key: &str) -> Result<Option<String>, BridgeError> {
    match std::env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => {
            Err(BridgeError::ConfigurationFatal(format!("{key} is not valid unicode")))
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, BridgeError> {
    raw.parse().map_err(|_| BridgeError::ConfigurationFatal(format!("invalid value for {key}: '{raw}'")))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, BridgeError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(BridgeError::ConfigurationFatal(format!("invalid boolean for {key}: '{raw}'"))),
    }
}

/// Loads `GO_ENV_FILE_PATH` (default `./.env`) without overriding vars
/// already set in the process environment.
fn load_env_file() {
    let path = std::env::var("GO_ENV_FILE_PATH").unwrap_or_else(|_| ".env".to_string());
    load_env_file_at(Path::new(&path));
}

fn load_env_file_at(path: &Path) {
    let Ok(contents) = std::fs::read_to_string(path) else { return };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if std::env::var(key).is_err() {
                // SAFETY-equivalent: single-threaded config-load phase, before any task spawns.
                std::env::set_var(key, value.trim());
            }
        }
    }
}

pub fn resolve_drone_config_addr(raw: &str, default: SocketAddr) -> SocketAddr {
    raw.parse().unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("X", "true").unwrap());
        assert!(parse_bool("X", "1").unwrap());
        assert!(!parse_bool("X", "false").unwrap());
        assert!(parse_bool("X", "nonsense").is_err());
    }

    #[test]
    fn env_file_parses_key_value_lines_and_skips_comments() {
        let dir = std::env::temp_dir().join(format!("ground-bridge-envfile-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(".env");
        std::fs::write(&path, "# a comment\nUNIQUE_TEST_VAR_FOR_ENVFILE=hello\n").unwrap();

        load_env_file_at(&path);
        assert_eq!(std::env::var("UNIQUE_TEST_VAR_FOR_ENVFILE").as_deref(), Ok("hello"));

        std::env::remove_var("UNIQUE_TEST_VAR_FOR_ENVFILE");
        std::fs::remove_dir_all(&dir).ok();
    }
}
