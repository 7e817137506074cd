use crate::rules::Alert;
use crate::timefmt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

const RECENT_ALERTS_CAP: usize = 200;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(with = "timefmt::rfc3339")]
    pub timestamp: i64,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentStatus>,
    #[serde(default)]
    pub crons: Vec<CronStatus>,
    #[serde(default)]
    pub resources: ResourceMetrics,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentHealth {
    Online,
    Offline,
    #[default]
    Unknown,
}

impl AgentHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentHealth::Online => "online",
            AgentHealth::Offline => "offline",
            AgentHealth::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentStatus {
    pub status: AgentHealth,
    #[serde(default, with = "timefmt::rfc3339_opt")]
    pub last_seen: Option<i64>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub token_usage_last_hour: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronStatus {
    pub id: String,
    pub name: String,
    #[serde(default, with = "timefmt::rfc3339_opt")]
    pub last_run: Option<i64>,
    #[serde(default, with = "timefmt::rfc3339_opt")]
    pub next_run: Option<i64>,
    #[serde(default = "default_last_status")]
    pub last_status: String,
    #[serde(default)]
    pub missed_runs: u64,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceMetrics {
    #[serde(default)]
    pub memory_usage_mb: Option<f64>,
    #[serde(default)]
    pub disk_usage_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_average: Option<LoadAverage>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LoadAverage {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
}

/// Shared view for the HTTP API and the dashboard. Written by the poller only.
#[derive(Debug, Clone, Default)]
pub struct State {
    pub started_at_ms: i64,
    pub last_poll_ms: Option<i64>,
    pub snapshot: Option<StateSnapshot>,
    pub cooldowns: BTreeMap<String, i64>,
    pub recent_alerts: VecDeque<Alert>,
}

impl State {
    pub fn new(now_ms: i64) -> Self {
        Self {
            started_at_ms: now_ms,
            ..Self::default()
        }
    }

    pub fn update_after_poll(
        &mut self,
        now_ms: i64,
        snapshot: StateSnapshot,
        cooldowns: BTreeMap<String, i64>,
        alerts: &[Alert],
    ) {
        self.last_poll_ms = Some(now_ms);
        self.snapshot = Some(snapshot);
        self.cooldowns = cooldowns;
        self.push_alerts(alerts.iter().cloned());
    }

    pub fn push_alerts(&mut self, alerts: impl IntoIterator<Item = Alert>) {
        for alert in alerts {
            if self.recent_alerts.len() == RECENT_ALERTS_CAP {
                self.recent_alerts.pop_front();
            }
            self.recent_alerts.push_back(alert);
        }
    }
}

impl StateSnapshot {
    pub fn empty(now_ms: i64) -> Self {
        Self {
            timestamp: now_ms,
            ..Self::default()
        }
    }

    pub fn missed_runs_total(&self) -> u64 {
        self.crons.iter().map(|c| c.missed_runs).sum()
    }
}

fn default_model() -> String {
    "unknown".to_string()
}

fn default_last_status() -> String {
    "unknown".to_string()
}

const fn default_enabled() -> bool {
    true
}
