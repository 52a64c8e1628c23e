use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const SPEEDTEST_COMMAND: &str = "speedtest";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub cooldowns: CooldownConfig,
    #[serde(default)]
    pub disk_targets: Vec<DiskTargetConfig>,
    #[serde(default)]
    pub speedtest: SpeedtestConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub chat_id: i64,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CooldownConfig {
    #[serde(default = "default_cooldown_secs")]
    pub default_secs: u64,
    #[serde(default = "default_command_cooldowns")]
    pub commands: HashMap<String, u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiskTargetConfig {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    pub path: String,
    #[serde(default, with = "humantime_opt")]
    pub interval: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpeedtestConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, with = "humantime_opt")]
    pub interval: Option<Duration>,
    #[serde(default = "default_expected_download_mbps")]
    pub expected_download_mbps: f64,
    #[serde(default = "default_expected_upload_mbps")]
    pub expected_upload_mbps: f64,
    #[serde(default = "default_warn_ratio")]
    pub warn_ratio: f64,
    #[serde(default = "default_crit_ratio")]
    pub crit_ratio: f64,
    #[serde(default = "default_warn_latency_ms")]
    pub warn_latency_ms: f64,
    #[serde(default = "default_crit_latency_ms")]
    pub crit_latency_ms: f64,
    #[serde(default)]
    pub warn_loss_percent: Option<f64>,
    #[serde(default)]
    pub crit_loss_percent: Option<f64>,
    #[serde(default = "default_context_timeout_secs")]
    pub context_timeout_secs: u64,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    #[serde(default = "default_pipeline_timeout_secs")]
    pub pipeline_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token_env: default_bot_token_env(),
            bot_token: None,
            chat_id: 0,
            poll_timeout_secs: default_poll_timeout_secs(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            default_secs: default_cooldown_secs(),
            commands: default_command_cooldowns(),
        }
    }
}

impl Default for SpeedtestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: None,
            expected_download_mbps: default_expected_download_mbps(),
            expected_upload_mbps: default_expected_upload_mbps(),
            warn_ratio: default_warn_ratio(),
            crit_ratio: default_crit_ratio(),
            warn_latency_ms: default_warn_latency_ms(),
            crit_latency_ms: default_crit_latency_ms(),
            warn_loss_percent: None,
            crit_loss_percent: None,
            context_timeout_secs: default_context_timeout_secs(),
            stage_timeout_secs: default_stage_timeout_secs(),
            pipeline_timeout_secs: default_pipeline_timeout_secs(),
        }
    }
}

impl DiskTargetConfig {
    pub fn command(&self) -> String {
        format!("{}_disk_usage", self.name)
    }

    pub fn display_label(&self) -> String {
        match self.label.as_deref().map(str::trim) {
            Some(label) if !label.is_empty() => label.to_string(),
            _ => capitalize(&self.name),
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

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }

        validate_telegram(&self.telegram)?;
        validate_disk_targets(&self.disk_targets)?;
        validate_speedtest(&self.speedtest)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_telegram(cfg: &TelegramConfig) -> Result<(), ConfigError> {
    // teloxide's default client gives up on a request after 17s
    if !(1..=15).contains(&cfg.poll_timeout_secs) {
        return Err(ConfigError::Validation(
            "telegram.poll_timeout_secs must be in range 1..15".to_string(),
        ));
    }
    if cfg.backoff_base_secs < 1 {
        return Err(ConfigError::Validation(
            "telegram.backoff_base_secs must be >= 1".to_string(),
        ));
    }
    if cfg.backoff_max_secs < cfg.backoff_base_secs {
        return Err(ConfigError::Validation(
            "telegram.backoff_max_secs must be >= telegram.backoff_base_secs".to_string(),
        ));
    }
    if cfg.retry_delay_secs < 1 {
        return Err(ConfigError::Validation(
            "telegram.retry_delay_secs must be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_disk_targets(targets: &[DiskTargetConfig]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for target in targets {
        if target.name.is_empty()
            || !target
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(ConfigError::Validation(format!(
                "disk_targets name '{}' must be non-empty and use only [a-z0-9_]",
                target.name
            )));
        }
        if !names.insert(target.name.clone()) {
            return Err(ConfigError::Validation(format!(
                "disk_targets name '{}' must be unique",
                target.name
            )));
        }
        if target.path.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "disk_targets '{}' path must not be empty",
                target.name
            )));
        }
        if target.interval.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::Validation(format!(
                "disk_targets '{}' interval must be > 0",
                target.name
            )));
        }
    }
    Ok(())
}

fn validate_speedtest(cfg: &SpeedtestConfig) -> Result<(), ConfigError> {
    if cfg.expected_download_mbps <= 0.0 || cfg.expected_upload_mbps <= 0.0 {
        return Err(ConfigError::Validation(
            "speedtest.expected_download_mbps and expected_upload_mbps must be > 0".to_string(),
        ));
    }
    if !(cfg.crit_ratio > 0.0 && cfg.crit_ratio <= cfg.warn_ratio && cfg.warn_ratio <= 1.0) {
        return Err(ConfigError::Validation(
            "speedtest ratios must satisfy 0 < crit_ratio <= warn_ratio <= 1".to_string(),
        ));
    }
    if !(cfg.warn_latency_ms > 0.0 && cfg.warn_latency_ms <= cfg.crit_latency_ms) {
        return Err(ConfigError::Validation(
            "speedtest latencies must satisfy 0 < warn_latency_ms <= crit_latency_ms".to_string(),
        ));
    }
    if let (Some(warn), Some(crit)) = (cfg.warn_loss_percent, cfg.crit_loss_percent) {
        if warn > crit {
            return Err(ConfigError::Validation(
                "speedtest.warn_loss_percent must be <= crit_loss_percent".to_string(),
            ));
        }
    }
    if cfg.context_timeout_secs < 1 || cfg.stage_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "speedtest stage timeouts must be >= 1".to_string(),
        ));
    }
    if cfg.pipeline_timeout_secs < cfg.context_timeout_secs {
        return Err(ConfigError::Validation(
            "speedtest.pipeline_timeout_secs must be >= context_timeout_secs".to_string(),
        ));
    }
    if cfg.interval.is_some_and(|d| d.is_zero()) {
        return Err(ConfigError::Validation(
            "speedtest.interval must be > 0".to_string(),
        ));
    }
    Ok(())
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

mod humantime_opt {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|text| humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom))
            .transpose()
    }
}

const fn default_true() -> bool {
    true
}

fn default_bot_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".to_string()
}

const fn default_poll_timeout_secs() -> u32 {
    10
}

const fn default_backoff_base_secs() -> u64 {
    30
}

const fn default_backoff_max_secs() -> u64 {
    300
}

const fn default_retry_delay_secs() -> u64 {
    5
}

const fn default_cooldown_secs() -> u64 {
    10
}

fn default_command_cooldowns() -> HashMap<String, u64> {
    HashMap::from([(SPEEDTEST_COMMAND.to_string(), 30)])
}

const fn default_expected_download_mbps() -> f64 {
    100.0
}

const fn default_expected_upload_mbps() -> f64 {
    100.0
}

const fn default_warn_ratio() -> f64 {
    0.8
}

const fn default_crit_ratio() -> f64 {
    0.6
}

const fn default_warn_latency_ms() -> f64 {
    50.0
}

const fn default_crit_latency_ms() -> f64 {
    100.0
}

const fn default_context_timeout_secs() -> u64 {
    10
}

const fn default_stage_timeout_secs() -> u64 {
    60
}

const fn default_pipeline_timeout_secs() -> u64 {
    120
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            listen: "127.0.0.1:1324".to_string(),
            telegram: TelegramConfig::default(),
            cooldowns: CooldownConfig::default(),
            disk_targets: vec![DiskTargetConfig {
                name: "server".to_string(),
                label: None,
                path: "/".to_string(),
                interval: None,
            }],
            speedtest: SpeedtestConfig::default(),
        }
    }

    #[test]
    fn example_config_parses_and_validates() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("example YAML");
        cfg.validate().expect("example config is valid");
        assert!(!cfg.disk_targets.is_empty());
    }

    #[test]
    fn minimal_yaml_uses_defaults() {
        let cfg: Config = serde_yaml::from_str("listen: \"0.0.0.0:1324\"\n").unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.cooldowns.default_secs, 10);
        assert_eq!(cfg.cooldowns.commands.get("speedtest"), Some(&30));
        assert_eq!(cfg.telegram.backoff_base_secs, 30);
        assert_eq!(cfg.telegram.backoff_max_secs, 300);
        assert_eq!(cfg.speedtest.pipeline_timeout_secs, 120);
    }

    #[test]
    fn intervals_parse_humantime() {
        let yaml = r#"
listen: "127.0.0.1:1324"
disk_targets:
  - name: plex
    path: /mnt/plex
    interval: 6h
speedtest:
  interval: 30m
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            cfg.disk_targets[0].interval,
            Some(Duration::from_secs(6 * 3600))
        );
        assert_eq!(cfg.speedtest.interval, Some(Duration::from_secs(1800)));
        assert_eq!(cfg.disk_targets[0].command(), "plex_disk_usage");
        assert_eq!(cfg.disk_targets[0].display_label(), "Plex");
    }

    #[test]
    fn rejects_bad_listen() {
        let mut cfg = valid_config();
        cfg.listen = "nope".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_duplicate_disk_targets() {
        let mut cfg = valid_config();
        cfg.disk_targets.push(cfg.disk_targets[0].clone());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unsafe_target_name() {
        let mut cfg = valid_config();
        cfg.disk_targets[0].name = "Server Disk".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_ratios() {
        let mut cfg = valid_config();
        cfg.speedtest.warn_ratio = 0.5;
        cfg.speedtest.crit_ratio = 0.7;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_backoff_cap_below_base() {
        let mut cfg = valid_config();
        cfg.telegram.backoff_base_secs = 60;
        cfg.telegram.backoff_max_secs = 30;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn telegram_enabled_allows_missing_token() {
        let mut cfg = valid_config();
        cfg.telegram.enabled = true;
        cfg.telegram.bot_token_env = "MISSING_ENV_12345".to_string();
        std::env::remove_var("MISSING_ENV_12345");
        cfg.validate()
            .expect("token is resolved at startup, not during validation");
    }
}
