use crate::rules::{Rule, Severity};
use crate::state::{AgentHealth, ResourceMetrics, StateSnapshot};
use crate::timefmt::{format_millis, format_relative};
use std::collections::BTreeMap;
use std::fmt::Write;

const ACTIVE_WINDOW_MS: i64 = 3_600_000;
const MAX_ALERT_ROWS: usize = 10;
const MAX_MESSAGE_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveAlert {
    pub rule_id: String,
    pub triggered_at: i64,
    pub severity: Severity,
    pub message: String,
}

/// Rules triggered within the last hour, most recent first.
pub fn active_alerts(cooldowns: &BTreeMap<String, i64>, rules: &[Rule], now_ms: i64) -> Vec<ActiveAlert> {
    let mut active: Vec<_> = cooldowns
        .iter()
        .filter(|(_, ts)| now_ms.saturating_sub(**ts) < ACTIVE_WINDOW_MS)
        .map(|(rule_id, ts)| {
            let rule = rules.iter().find(|r| &r.id == rule_id);
            ActiveAlert {
                rule_id: rule_id.clone(),
                triggered_at: *ts,
                severity: rule.and_then(|r| r.severity).unwrap_or(Severity::Info),
                message: rule
                    .and_then(|r| r.description.clone())
                    .unwrap_or_else(|| rule_id.clone()),
            }
        })
        .collect();
    active.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at));
    active
}

pub fn render(snapshot: &StateSnapshot, active: &[ActiveAlert], now_ms: i64) -> String {
    let mut out = String::new();
    let rule = "═".repeat(64);
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "  observd dashboard  ({})", short_time(snapshot.timestamp));
    let _ = writeln!(out, "{rule}\n");

    let _ = writeln!(out, "Agents:");
    let _ = writeln!(out, "{}\n", agent_table(snapshot, now_ms));

    if !snapshot.crons.is_empty() {
        let _ = writeln!(out, "Cron Jobs:");
        let _ = writeln!(out, "{}\n", cron_table(snapshot, now_ms));
    }

    let resources = resource_table(&snapshot.resources);
    if !resources.is_empty() {
        let _ = writeln!(out, "Resources:");
        let _ = writeln!(out, "{resources}\n");
    }

    let _ = writeln!(out, "Active Alerts: {}", active.len());
    if !active.is_empty() {
        let _ = writeln!(out, "{}", alert_table(active));
    }
    let _ = write!(out, "{rule}");
    out
}

fn agent_table(snapshot: &StateSnapshot, now_ms: i64) -> String {
    if snapshot.agents.is_empty() {
        return "  (no agents found)".to_string();
    }
    let mut rows = vec![header(&["Name", "Status", "Last Seen", "Model", "Tokens/hr"])];
    for (name, agent) in &snapshot.agents {
        let icon = match agent.status {
            AgentHealth::Online => "🟢",
            AgentHealth::Offline => "🔴",
            AgentHealth::Unknown => "⚪",
        };
        let tokens = if agent.token_usage_last_hour > 0.0 {
            format!("{}", agent.token_usage_last_hour.round() as u64)
        } else {
            "-".to_string()
        };
        rows.push(vec![
            name.clone(),
            format!("{icon} {}", agent.status.as_str()),
            agent
                .last_seen
                .map(|ts| format_relative(ts, now_ms))
                .unwrap_or_else(|| "never".to_string()),
            if agent.model.is_empty() {
                "-".to_string()
            } else {
                agent.model.clone()
            },
            tokens,
        ]);
    }
    table(&rows)
}

fn cron_table(snapshot: &StateSnapshot, now_ms: i64) -> String {
    let mut rows = vec![header(&["Name", "Next Run", "Last Run", "Status", "Missed"])];
    for cron in &snapshot.crons {
        let status = match (cron.enabled, cron.last_status.as_str()) {
            (false, _) => "paused",
            (true, "success") => "ok",
            (true, _) => "?",
        };
        rows.push(vec![
            if cron.name.is_empty() {
                cron.id.clone()
            } else {
                cron.name.clone()
            },
            cron.next_run.map(short_time).unwrap_or_else(|| "N/A".to_string()),
            cron.last_run
                .map(|ts| format_relative(ts, now_ms))
                .unwrap_or_else(|| "never".to_string()),
            status.to_string(),
            if cron.missed_runs > 0 {
                format!("🔴 {}", cron.missed_runs)
            } else {
                "0".to_string()
            },
        ]);
    }
    table(&rows)
}

fn resource_table(resources: &ResourceMetrics) -> String {
    let mut rows = Vec::new();
    if let Some(mb) = resources.memory_usage_mb {
        rows.push(vec!["Memory".to_string(), format!("{mb} MB")]);
    }
    if let Some(pct) = resources.disk_usage_percent {
        rows.push(vec!["Disk".to_string(), format!("{pct}%")]);
    }
    if let Some(load) = resources.load_average {
        rows.push(vec![
            "Load Avg".to_string(),
            format!("1m:{:.2} 5m:{:.2} 15m:{:.2}", load.load1, load.load5, load.load15),
        ]);
    }
    if rows.is_empty() {
        return String::new();
    }
    table_with(&rows, false)
}

fn alert_table(active: &[ActiveAlert]) -> String {
    let mut rows = vec![header(&["Time", "Severity", "Message"])];
    for alert in active.iter().take(MAX_ALERT_ROWS) {
        rows.push(vec![
            short_time(alert.triggered_at),
            alert.severity.as_str().to_uppercase(),
            truncate(&alert.message),
        ]);
    }
    table(&rows)
}

fn truncate(message: &str) -> String {
    if message.chars().count() > MAX_MESSAGE_CHARS {
        let head: String = message.chars().take(MAX_MESSAGE_CHARS).collect();
        format!("{head}...")
    } else {
        message.to_string()
    }
}

/// `MM-DD HH:MM` in UTC.
fn short_time(ms: i64) -> String {
    let iso = format_millis(ms);
    iso.get(5..16)
        .map(|s| s.replace('T', " "))
        .unwrap_or(iso)
}

fn header(cells: &[&str]) -> Vec<String> {
    cells.iter().map(|c| c.to_string()).collect()
}

fn table(rows: &[Vec<String>]) -> String {
    table_with(rows, true)
}

fn table_with(rows: &[Vec<String>], header_line: bool) -> String {
    let cols = rows.first().map_or(0, Vec::len);
    let mut widths = vec![0; cols];
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(cols) {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let mut lines = Vec::with_capacity(rows.len() + 1);
    for (n, row) in rows.iter().enumerate() {
        let mut line = String::from("│");
        for (cell, width) in row.iter().zip(&widths) {
            let pad = width - cell.chars().count();
            let _ = write!(line, " {cell}{} │", " ".repeat(pad));
        }
        lines.push(line);
        if n == 0 && header_line {
            let sep: Vec<_> = widths.iter().map(|w| "─".repeat(w + 2)).collect();
            lines.push(format!("├{}┤", sep.join("┼")));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AgentStatus, CronStatus, LoadAverage};

    const NOW: i64 = 1_700_000_000_000;

    fn rule(id: &str, description: Option<&str>, severity: Option<Severity>) -> Rule {
        Rule {
            id: id.to_string(),
            description: description.map(str::to_string),
            condition: "true".to_string(),
            cooldown: None,
            severity,
            message: None,
            channel: "discord".to_string(),
            enabled: true,
        }
    }

    #[test]
    fn active_alerts_only_within_the_hour() {
        let cooldowns: BTreeMap<_, _> = [
            ("old".to_string(), NOW - 2 * 3_600_000),
            ("recent".to_string(), NOW - 60_000),
            ("newest".to_string(), NOW - 1_000),
        ]
        .into_iter()
        .collect();
        let rules = [rule("recent", Some("Main agent offline"), Some(Severity::Critical))];

        let active = active_alerts(&cooldowns, &rules, NOW);
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].rule_id, "newest");
        assert_eq!(active[0].message, "newest");
        assert_eq!(active[0].severity, Severity::Info);
        assert_eq!(active[1].message, "Main agent offline");
        assert_eq!(active[1].severity, Severity::Critical);
    }

    #[test]
    fn extreme_cooldown_instants_do_not_overflow() {
        let cooldowns: BTreeMap<_, _> = [
            ("ancient".to_string(), i64::MIN),
            ("future".to_string(), i64::MAX),
        ]
        .into_iter()
        .collect();

        let active = active_alerts(&cooldowns, &[], NOW);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].rule_id, "future");
    }

    #[test]
    fn renders_all_sections() {
        let mut snapshot = StateSnapshot::empty(NOW);
        snapshot.agents.insert(
            "main".to_string(),
            AgentStatus {
                status: AgentHealth::Online,
                last_seen: Some(NOW - 5 * 60_000),
                model: "opus".to_string(),
                token_usage_last_hour: 1500.4,
                session_key: None,
            },
        );
        snapshot.crons.push(CronStatus {
            id: "dev".to_string(),
            name: "Dev Research".to_string(),
            missed_runs: 2,
            enabled: true,
            last_status: "success".to_string(),
            ..CronStatus::default()
        });
        snapshot.resources.memory_usage_mb = Some(512.0);
        snapshot.resources.load_average = Some(LoadAverage {
            load1: 1.0,
            load5: 0.5,
            load15: 0.25,
        });
        let active = [ActiveAlert {
            rule_id: "r".to_string(),
            triggered_at: NOW,
            severity: Severity::Warning,
            message: "x".repeat(60),
        }];

        let text = render(&snapshot, &active, NOW);
        assert!(text.contains("🟢 online"));
        assert!(text.contains("5m ago"));
        assert!(text.contains("1500"));
        assert!(text.contains("Dev Research"));
        assert!(text.contains("🔴 2"));
        assert!(text.contains("512 MB"));
        assert!(text.contains("1m:1.00 5m:0.50 15m:0.25"));
        assert!(text.contains("Active Alerts: 1"));
        assert!(text.contains("WARNING"));
        assert!(text.contains(&format!("{}...", "x".repeat(50))));
        assert!(!text.contains("Disk"));
    }

    #[test]
    fn empty_snapshot_says_so() {
        let text = render(&StateSnapshot::empty(NOW), &[], NOW);
        assert!(text.contains("(no agents found)"));
        assert!(!text.contains("Cron Jobs:"));
        assert!(text.contains("Active Alerts: 0"));
    }

    #[test]
    fn table_pads_columns() {
        let rows = vec![header(&["A", "Long"]), vec!["abc".to_string(), "x".to_string()]];
        let text = table(&rows);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "│ A   │ Long │");
        assert_eq!(lines[1], "├─────┼──────┤");
        assert_eq!(lines[2], "│ abc │ x    │");
    }

    #[test]
    fn short_time_is_month_day_hour_minute() {
        assert_eq!(short_time(0), "01-01 00:00");
    }
}
