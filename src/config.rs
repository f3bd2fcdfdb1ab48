use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub ping_targets: Vec<String>,
    #[serde(default)]
    pub disk_watch: Vec<String>,
    #[serde(default = "default_broadcast_interval", with = "duration_str")]
    pub broadcast_interval: Duration,
    #[serde(default = "default_command_timeout", with = "duration_str")]
    pub command_timeout: Duration,
    #[serde(default)]
    pub disk: DiskConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub ping: PingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiskConfig {
    #[serde(default = "default_disk_interval", with = "duration_str")]
    pub interval: Duration,
    #[serde(default = "default_list_command")]
    pub list_command: Vec<String>,
    #[serde(default = "default_state_command")]
    pub state_command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourceConfig {
    #[serde(default = "default_resource_interval", with = "duration_str")]
    pub interval: Duration,
    #[serde(default = "default_sensors_command")]
    pub sensors_command: Vec<String>,
    #[serde(default = "default_temperature_label")]
    pub temperature_label: String,
    #[serde(default)]
    pub network_interface: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PingConfig {
    #[serde(default = "default_ping_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_max_samples")]
    pub max_samples: u64,
    #[serde(default = "default_backoff_initial", with = "duration_str")]
    pub backoff_initial: Duration,
    #[serde(default = "default_backoff_max", with = "duration_str")]
    pub backoff_max: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ping_targets: Vec::new(),
            disk_watch: Vec::new(),
            broadcast_interval: default_broadcast_interval(),
            command_timeout: default_command_timeout(),
            disk: DiskConfig::default(),
            resources: ResourceConfig::default(),
            ping: PingConfig::default(),
        }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            interval: default_disk_interval(),
            list_command: default_list_command(),
            state_command: default_state_command(),
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            interval: default_resource_interval(),
            sensors_command: default_sensors_command(),
            temperature_label: default_temperature_label(),
            network_interface: None,
        }
    }
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            program: default_ping_program(),
            args: Vec::new(),
            max_samples: default_max_samples(),
            backoff_initial: default_backoff_initial(),
            backoff_max: default_backoff_max(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        Ok(cfg)
    }

    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(port) = non_blank(lookup("PORT")) {
            self.port = port.trim().parse().map_err(|_| {
                ConfigError::Validation(format!("PORT must be a port number, got '{port}'"))
            })?;
        }
        if let Some(targets) = non_blank(lookup("PING_TARGETS")) {
            self.ping_targets = split_list(&targets);
        }
        if let Some(devices) = non_blank(lookup("HDD_WATCHES")) {
            self.disk_watch = split_list(&devices);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Validation("host is required".to_string()));
        }
        if IpAddr::from_str(self.host.trim()).is_err() {
            return Err(ConfigError::Validation(format!(
                "host '{}' must be an IP address",
                self.host
            )));
        }
        if self.port == 0 {
            return Err(ConfigError::Validation(
                "port must be in 1..65535".to_string(),
            ));
        }
        require_nonzero("broadcast_interval", self.broadcast_interval)?;
        require_nonzero("command_timeout", self.command_timeout)?;
        require_nonzero("disk.interval", self.disk.interval)?;
        require_nonzero("resources.interval", self.resources.interval)?;

        require_argv("disk.list_command", &self.disk.list_command)?;
        require_argv("disk.state_command", &self.disk.state_command)?;
        require_argv("resources.sensors_command", &self.resources.sensors_command)?;

        if self.resources.temperature_label.trim().is_empty() {
            return Err(ConfigError::Validation(
                "resources.temperature_label must not be empty".to_string(),
            ));
        }
        if self.ping_targets.iter().any(|t| t.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "ping_targets[*] must not be empty".to_string(),
            ));
        }
        if self.disk_watch.iter().any(|d| d.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "disk_watch[*] must not be empty".to_string(),
            ));
        }
        validate_ping(&self.ping)?;

        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host.trim(), self.port)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_ping(cfg: &PingConfig) -> Result<(), ConfigError> {
    if cfg.program.trim().is_empty() {
        return Err(ConfigError::Validation(
            "ping.program must not be empty".to_string(),
        ));
    }
    if cfg.max_samples < 1 {
        return Err(ConfigError::Validation(
            "ping.max_samples must be >= 1".to_string(),
        ));
    }
    require_nonzero("ping.backoff_initial", cfg.backoff_initial)?;
    if cfg.backoff_initial > cfg.backoff_max {
        return Err(ConfigError::Validation(
            "ping.backoff_initial must not exceed ping.backoff_max".to_string(),
        ));
    }
    Ok(())
}

fn require_nonzero(field: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Validation(format!("{field} must be > 0")));
    }
    Ok(())
}

fn require_argv(field: &str, argv: &[String]) -> Result<(), ConfigError> {
    match argv.first() {
        Some(program) if !program.trim().is_empty() => Ok(()),
        _ => Err(ConfigError::Validation(format!(
            "{field} must name a program"
        ))),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    23623
}

const fn default_broadcast_interval() -> Duration {
    Duration::from_secs(1)
}

const fn default_command_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_disk_interval() -> Duration {
    Duration::from_secs(60)
}

const fn default_resource_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_list_command() -> Vec<String> {
    ["lsblk", "-dn", "-o", "NAME"].map(String::from).to_vec()
}

fn default_state_command() -> Vec<String> {
    ["sudo", "hdparm", "-C"].map(String::from).to_vec()
}

fn default_sensors_command() -> Vec<String> {
    vec!["sensors".to_string()]
}

fn default_temperature_label() -> String {
    "Package id 0".to_string()
}

fn default_ping_program() -> String {
    "ping".to_string()
}

const fn default_max_samples() -> u64 {
    100_000
}

const fn default_backoff_initial() -> Duration {
    Duration::from_millis(500)
}

const fn default_backoff_max() -> Duration {
    Duration::from_secs(30)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().expect("defaults must validate");
        assert_eq!(cfg.port, 23623);
        assert_eq!(cfg.listen_addr(), "0.0.0.0:23623");
        assert_eq!(cfg.disk.interval, Duration::from_secs(60));
        assert_eq!(cfg.ping.max_samples, 100_000);
    }

    #[test]
    fn example_yaml_parses_and_validates() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("example parses");
        cfg.validate().expect("example validates");
    }

    #[test]
    fn partial_yaml_fills_defaults_and_parses_durations() {
        let yaml = r#"
port: 9000
ping_targets: [a.test, b.test]
broadcast_interval: 250ms
disk:
  interval: 2m
ping:
  backoff_max: 5s
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("yaml parses");
        cfg.validate().expect("config validates");
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.ping_targets, vec!["a.test", "b.test"]);
        assert_eq!(cfg.broadcast_interval, Duration::from_millis(250));
        assert_eq!(cfg.disk.interval, Duration::from_secs(120));
        assert_eq!(cfg.disk.list_command, default_list_command());
        assert_eq!(cfg.ping.backoff_max, Duration::from_secs(5));
        assert_eq!(cfg.resources.temperature_label, "Package id 0");
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut cfg = Config {
            ping_targets: vec!["file.test".to_string()],
            ..Config::default()
        };
        cfg.apply_env_overrides(env(&[
            ("PORT", "8080"),
            ("PING_TARGETS", "1.1.1.1, a.test,,"),
            ("HDD_WATCHES", "/dev/sda"),
        ]))
        .expect("overrides apply");

        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.ping_targets, vec!["1.1.1.1", "a.test"]);
        assert_eq!(cfg.disk_watch, vec!["/dev/sda"]);
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let mut cfg = Config::default();
        cfg.apply_env_overrides(env(&[("PING_TARGETS", "  ")]))
            .expect("overrides apply");
        assert!(cfg.ping_targets.is_empty());
    }

    #[test]
    fn invalid_port_override_is_rejected() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_env_overrides(env(&[("PORT", "http")]))
            .expect_err("non-numeric port");
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn empty_command_is_rejected() {
        let mut cfg = Config::default();
        cfg.disk.state_command = vec![];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn backoff_bounds_are_checked() {
        let mut cfg = Config::default();
        cfg.ping.backoff_initial = Duration::from_secs(60);
        cfg.ping.backoff_max = Duration::from_secs(1);
        assert!(cfg.validate().is_err());
    }
}
