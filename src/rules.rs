use crate::timefmt;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    #[default]
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }

    pub fn emoji(self) -> &'static str {
        match self {
            Severity::Critical => "🚨",
            Severity::Warning => "⚠️",
            Severity::Info => "ℹ️",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub condition: String,
    #[serde(default)]
    pub cooldown: Option<String>,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub channel: String,
    #[serde(default = "default_rule_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    #[serde(with = "timefmt::rfc3339")]
    pub triggered_at: i64,
    pub message: String,
    pub severity: Severity,
    pub resolved: bool,
}

impl Alert {
    pub fn from_rule(rule: &Rule, now_ms: i64) -> Self {
        Self {
            id: format!("alert_{now_ms}_{}", rule.id),
            rule_id: rule.id.clone(),
            triggered_at: now_ms,
            message: rule
                .message
                .clone()
                .unwrap_or_else(|| format!("Rule \"{}\" triggered", rule.id)),
            severity: rule.severity.unwrap_or_default(),
            resolved: false,
        }
    }
}

const fn default_rule_enabled() -> bool {
    true
}
