use crate::condition;
use crate::cooldown::try_parse_cooldown;
use crate::rules::Rule;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default)]
    pub openclaw: OpenclawConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpenclawConfig {
    #[serde(default = "default_openclaw_binary")]
    pub binary: String,
    #[serde(default = "default_command_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramConfig {
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Openclaw,
    Telegram,
    Webhook,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Openclaw => "openclaw",
            Transport::Telegram => "telegram",
            Transport::Webhook => "webhook",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ChannelConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub transport: Transport,
    /// Target handed to the transport; falls back to the mapping key.
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub chat_ids: Vec<i64>,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for OpenclawConfig {
    fn default() -> Self {
        Self {
            binary: default_openclaw_binary(),
            timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl OpenclawConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token_env: default_bot_token_env(),
            bot_token: None,
            rate_limit_per_minute: default_rate_limit_per_minute(),
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
        Self::from_yaml(&text, &path_display)
    }

    pub fn from_yaml(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
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
        if self.poll_interval_secs < 1 {
            return Err(ConfigError::Validation(
                "poll_interval_secs must be >= 1".to_string(),
            ));
        }
        if self.openclaw.binary.trim().is_empty() {
            return Err(ConfigError::Validation(
                "openclaw.binary must not be empty".to_string(),
            ));
        }
        if self.openclaw.timeout_secs < 1 {
            return Err(ConfigError::Validation(
                "openclaw.timeout_secs must be >= 1".to_string(),
            ));
        }
        if self.telegram.rate_limit_per_minute < 1 {
            return Err(ConfigError::Validation(
                "telegram.rate_limit_per_minute must be >= 1".to_string(),
            ));
        }

        validate_channels(&self.channels)?;
        validate_rules(&self.rules)?;
        Ok(())
    }

    /// Problems that do not reject the config but silently change behavior:
    /// cooldowns that fall back to zero, conditions that always evaluate false
    /// and rules whose channel cannot receive anything.
    pub fn lint(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for rule in &self.rules {
            if let Some(cooldown) = rule.cooldown.as_deref().filter(|c| !c.is_empty()) {
                if try_parse_cooldown(cooldown).is_none() {
                    warnings.push(format!(
                        "rule '{}': cooldown '{cooldown}' is not <integer><s|m|h|d>, no suppression will apply",
                        rule.id
                    ));
                }
            }
            if let Err(err) = condition::check_syntax(&rule.condition) {
                warnings.push(format!(
                    "rule '{}': condition never matches ({err})",
                    rule.id
                ));
            }
            match self.channels.get(&rule.channel) {
                None => warnings.push(format!(
                    "rule '{}': channel '{}' is not configured, alerts will not be delivered",
                    rule.id, rule.channel
                )),
                Some(ch) if !ch.enabled => warnings.push(format!(
                    "rule '{}': channel '{}' is disabled, alerts will not be delivered",
                    rule.id, rule.channel
                )),
                Some(_) => {}
            }
        }
        warnings
    }

    /// Enabled channels keyed by id, with the transport target filled in.
    pub fn channel_map(&self) -> HashMap<String, ChannelConfig> {
        self.channels
            .iter()
            .filter(|(_, ch)| ch.enabled)
            .map(|(id, ch)| {
                let mut ch = ch.clone();
                if ch.channel.trim().is_empty() {
                    ch.channel = id.clone();
                }
                (id.clone(), ch)
            })
            .collect()
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(86_400))
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_channels(channels: &BTreeMap<String, ChannelConfig>) -> Result<(), ConfigError> {
    for (id, ch) in channels {
        if id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "channel ids must not be empty".to_string(),
            ));
        }
        if !ch.enabled {
            continue;
        }
        match ch.transport {
            Transport::Telegram if ch.chat_ids.is_empty() => {
                return Err(ConfigError::Validation(format!(
                    "channel '{id}' uses telegram but chat_ids is empty"
                )));
            }
            Transport::Webhook if ch.url.as_deref().map_or(true, |u| u.trim().is_empty()) => {
                return Err(ConfigError::Validation(format!(
                    "channel '{id}' uses webhook but url is missing"
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

fn validate_rules(rules: &[Rule]) -> Result<(), ConfigError> {
    let mut ids = HashSet::new();
    for rule in rules {
        if rule.id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "rules[*].id must not be empty".to_string(),
            ));
        }
        if !ids.insert(rule.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "rule id '{}' must be unique",
                rule.id
            )));
        }
        if rule.condition.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "rule '{}' has an empty condition",
                rule.id
            )));
        }
    }
    Ok(())
}

fn default_listen() -> String {
    "127.0.0.1:9464".to_string()
}

const fn default_poll_interval_secs() -> u64 {
    60
}

const fn default_retention_days() -> u64 {
    30
}

fn default_state_file() -> PathBuf {
    PathBuf::from("./data/state.json")
}

fn default_openclaw_binary() -> String {
    "openclaw".to_string()
}

const fn default_command_timeout_secs() -> u64 {
    30
}

fn default_bot_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".to_string()
}

const fn default_rate_limit_per_minute() -> u32 {
    30
}

const fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Config, ConfigError> {
        Config::from_yaml(yaml, "test.yaml")
    }

    #[test]
    fn example_config_is_valid() {
        let cfg = parse(Config::example_yaml()).expect("example config must load");
        assert_eq!(cfg.poll_interval_secs, 60);
        assert_eq!(cfg.retention_days, 30);
        assert_eq!(cfg.rules.len(), 5);
        assert_eq!(cfg.rules[0].id, "session_offline_main");
        assert!(cfg.lint().iter().all(|w| !w.contains("condition")));
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = parse("rules: []\n").unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:9464");
        assert_eq!(cfg.openclaw.binary, "openclaw");
        assert_eq!(cfg.telegram.bot_token_env, "TELEGRAM_BOT_TOKEN");
        assert_eq!(cfg.state_file, PathBuf::from("./data/state.json"));
        assert_eq!(cfg.retention(), Duration::from_secs(30 * 86_400));
    }

    #[test]
    fn rejects_duplicate_rule_ids() {
        let yaml = r#"
rules:
  - { id: a, condition: "true" }
  - { id: a, condition: "false" }
"#;
        assert!(matches!(parse(yaml), Err(ConfigError::Validation(msg)) if msg.contains("unique")));
    }

    #[test]
    fn rejects_bad_listen_and_interval() {
        assert!(parse("listen: nope\n").is_err());
        assert!(parse("poll_interval_secs: 0\n").is_err());
    }

    #[test]
    fn transport_specific_fields_are_required() {
        assert!(parse("channels:\n  ops: { transport: telegram }\n").is_err());
        assert!(parse("channels:\n  hook: { transport: webhook }\n").is_err());
        assert!(parse("channels:\n  hook: { transport: webhook, enabled: false }\n").is_ok());
    }

    #[test]
    fn channel_map_drops_disabled_and_fills_target() {
        let yaml = r##"
channels:
  discord: {}
  ops: { channel: "#ops-alerts" }
  telegram: { enabled: false, transport: telegram }
"##;
        let map = parse(yaml).unwrap().channel_map();
        assert_eq!(map.len(), 2);
        assert_eq!(map["discord"].channel, "discord");
        assert_eq!(map["discord"].transport, Transport::Openclaw);
        assert_eq!(map["ops"].channel, "#ops-alerts");
        assert!(!map.contains_key("telegram"));
    }

    #[test]
    fn lint_flags_cooldowns_conditions_and_channels() {
        let yaml = r#"
channels:
  discord: {}
  muted: { enabled: false }
rules:
  - { id: ok, condition: "crons.length > 0", cooldown: 5m, channel: discord }
  - { id: slow, condition: "true", cooldown: 5 minutes, channel: discord }
  - { id: broken, condition: "agent(", channel: discord }
  - { id: lost, condition: "true", channel: nowhere }
  - { id: quiet, condition: "true", channel: muted }
"#;
        let warnings = parse(yaml).unwrap().lint();
        assert_eq!(warnings.len(), 4, "{warnings:?}");
        assert!(warnings[0].contains("'slow'"));
        assert!(warnings[1].contains("'broken'"));
        assert!(warnings[2].contains("not configured"));
        assert!(warnings[3].contains("disabled"));
    }
}
