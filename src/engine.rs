use crate::condition::{ConditionEvaluator, SnapshotView};
use crate::config::ChannelConfig;
use crate::cooldown::CooldownTracker;
use crate::dispatch::ChannelSender;
use crate::metrics::Metrics;
use crate::rules::{Alert, Rule};
use crate::state::StateSnapshot;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Evaluates rules against a snapshot and dispatches the resulting alerts.
pub struct RuleEngine {
    evaluator: ConditionEvaluator,
    sender: Arc<dyn ChannelSender>,
    metrics: Option<Arc<Metrics>>,
}

impl RuleEngine {
    pub fn new(sender: Arc<dyn ChannelSender>) -> Self {
        Self {
            evaluator: ConditionEvaluator::new(),
            sender,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.evaluator = ConditionEvaluator::new().with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn sender(&self) -> Arc<dyn ChannelSender> {
        self.sender.clone()
    }

    /// Runs one pass over `rules` in declaration order.
    ///
    /// A rule fires when it is enabled, not in cooldown and its condition
    /// holds. A fired rule always yields an alert and a cooldown entry, even
    /// when its channel is missing or delivery fails.
    pub async fn evaluate_all(
        &mut self,
        snapshot: &StateSnapshot,
        rules: &[Rule],
        history: &mut CooldownTracker,
        channels: &HashMap<String, ChannelConfig>,
        now_ms: i64,
    ) -> Vec<Alert> {
        let view = SnapshotView::new(snapshot, now_ms);
        let mut alerts = Vec::new();

        for rule in rules {
            if !rule.enabled {
                continue;
            }
            if history.is_in_cooldown(rule, now_ms) {
                debug!(rule_id = %rule.id, "rule in cooldown");
                continue;
            }
            if let Some(metrics) = &self.metrics {
                metrics.inc_rule_evaluation(&rule.id);
            }
            if !self.evaluator.evaluate(rule, &view) {
                continue;
            }

            let alert = Alert::from_rule(rule, now_ms);
            info!(
                rule_id = %rule.id,
                severity = alert.severity.as_str(),
                message = %alert.message,
                "rule triggered"
            );
            if let Some(metrics) = &self.metrics {
                metrics.inc_alert_triggered(&rule.id, alert.severity.as_str());
            }

            match channels.get(&rule.channel) {
                None => {
                    warn!(rule_id = %rule.id, channel = %rule.channel, "channel not configured, alert not sent");
                }
                Some(channel) => {
                    let delivered = self.sender.send(&alert, channel).await;
                    if !delivered {
                        warn!(rule_id = %rule.id, channel = %rule.channel, "alert delivery failed");
                    }
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_delivery(&rule.channel, delivered);
                    }
                }
            }

            history.record(rule, now_ms);
            alerts.push(alert);
        }

        alerts
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::rules::Severity;
    use crate::state::{AgentHealth, AgentStatus};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every send and answers with a fixed result.
    pub(crate) struct RecordingSender {
        pub sent: Mutex<Vec<(Alert, String)>>,
        pub succeed: bool,
    }

    impl RecordingSender {
        pub(crate) fn new(succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                succeed,
            })
        }

        pub(crate) fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChannelSender for RecordingSender {
        async fn send(&self, alert: &Alert, channel: &ChannelConfig) -> bool {
            self.sent
                .lock()
                .unwrap()
                .push((alert.clone(), channel.channel.clone()));
            self.succeed
        }
    }

    const T0: i64 = 1_700_000_000_000;

    fn snapshot_with_main(status: AgentHealth) -> StateSnapshot {
        let mut s = StateSnapshot::empty(T0);
        s.agents.insert(
            "main".to_string(),
            AgentStatus {
                status,
                last_seen: Some(T0),
                ..AgentStatus::default()
            },
        );
        s
    }

    fn rule(id: &str, condition: &str, cooldown: Option<&str>, channel: &str) -> Rule {
        Rule {
            id: id.to_string(),
            description: None,
            condition: condition.to_string(),
            cooldown: cooldown.map(str::to_string),
            severity: None,
            message: None,
            channel: channel.to_string(),
            enabled: true,
        }
    }

    fn offline_main_rule() -> Rule {
        Rule {
            severity: Some(Severity::Critical),
            ..rule(
                "session_offline_main",
                r#"agent("main").status !== "online""#,
                Some("5m"),
                "discord",
            )
        }
    }

    fn channels() -> HashMap<String, ChannelConfig> {
        HashMap::from([(
            "discord".to_string(),
            ChannelConfig {
                enabled: true,
                channel: "discord".to_string(),
                ..ChannelConfig::default()
            },
        )])
    }

    #[tokio::test]
    async fn offline_agent_triggers_one_critical_alert() {
        let sender = RecordingSender::new(true);
        let mut engine = RuleEngine::new(sender.clone());
        let mut history = CooldownTracker::new();

        let alerts = engine
            .evaluate_all(
                &snapshot_with_main(AgentHealth::Offline),
                &[offline_main_rule()],
                &mut history,
                &channels(),
                T0,
            )
            .await;

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_id, "session_offline_main");
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert_eq!(alerts[0].id, format!("alert_{T0}_session_offline_main"));
        assert_eq!(history.last_triggered("session_offline_main"), Some(T0));
        assert_eq!(sender.count(), 1);
        assert_eq!(sender.sent.lock().unwrap()[0].1, "discord");
    }

    #[tokio::test]
    async fn cooldown_suppresses_refire_until_window_ends() {
        let sender = RecordingSender::new(true);
        let mut engine = RuleEngine::new(sender.clone());
        let mut history = CooldownTracker::new();
        let snapshot = snapshot_with_main(AgentHealth::Offline);
        let rules = [offline_main_rule()];

        engine
            .evaluate_all(&snapshot, &rules, &mut history, &channels(), T0)
            .await;
        let later = engine
            .evaluate_all(&snapshot, &rules, &mut history, &channels(), T0 + 2 * 60_000)
            .await;
        assert!(later.is_empty());
        assert_eq!(history.last_triggered("session_offline_main"), Some(T0));

        let after = engine
            .evaluate_all(&snapshot, &rules, &mut history, &channels(), T0 + 5 * 60_000)
            .await;
        assert_eq!(after.len(), 1);
        assert_eq!(
            history.last_triggered("session_offline_main"),
            Some(T0 + 5 * 60_000)
        );
        assert_eq!(sender.count(), 2);
    }

    #[tokio::test]
    async fn missing_channel_still_fires_without_sending() {
        let sender = RecordingSender::new(true);
        let mut engine = RuleEngine::new(sender.clone());
        let mut history = CooldownTracker::new();
        let r = rule("no_channel", "true", Some("5m"), "pager");

        let alerts = engine
            .evaluate_all(
                &StateSnapshot::empty(T0),
                &[r],
                &mut history,
                &channels(),
                T0,
            )
            .await;

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].message, "Rule \"no_channel\" triggered");
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert_eq!(sender.count(), 0);
        assert_eq!(history.last_triggered("no_channel"), Some(T0));
    }

    #[tokio::test]
    async fn broken_condition_does_not_stop_later_rules() {
        let sender = RecordingSender::new(true);
        let mut engine = RuleEngine::new(sender.clone());
        let mut history = CooldownTracker::new();
        let rules = [
            rule("broken", "agent(\"main\".status", None, "discord"),
            rule("null_access", "agent(\"ghost\").status === 'x'", None, "discord"),
            rule("fine", "crons.length === 0", None, "discord"),
        ];

        let alerts = engine
            .evaluate_all(
                &snapshot_with_main(AgentHealth::Online),
                &rules,
                &mut history,
                &channels(),
                T0,
            )
            .await;

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_id, "fine");
        assert!(history.last_triggered("broken").is_none());
        assert!(history.last_triggered("null_access").is_none());
    }

    #[tokio::test]
    async fn rules_without_cooldown_fire_every_pass() {
        let sender = RecordingSender::new(true);
        let mut engine = RuleEngine::new(sender.clone());
        let mut history = CooldownTracker::new();
        let rules = [
            rule("always", "true", None, "discord"),
            rule("bad_cooldown", "true", Some("soon"), "discord"),
        ];
        let snapshot = StateSnapshot::empty(T0);

        let first = engine
            .evaluate_all(&snapshot, &rules, &mut history, &channels(), T0)
            .await;
        let second = engine
            .evaluate_all(&snapshot, &rules, &mut history, &channels(), T0 + 1)
            .await;
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(sender.count(), 4);
    }

    #[tokio::test]
    async fn delivery_failure_keeps_alert_and_cooldown() {
        let sender = RecordingSender::new(false);
        let mut engine = RuleEngine::new(sender.clone());
        let mut history = CooldownTracker::new();

        let alerts = engine
            .evaluate_all(
                &snapshot_with_main(AgentHealth::Offline),
                &[offline_main_rule()],
                &mut history,
                &channels(),
                T0,
            )
            .await;

        assert_eq!(alerts.len(), 1);
        assert_eq!(sender.count(), 1);
        assert_eq!(history.last_triggered("session_offline_main"), Some(T0));
    }

    #[tokio::test]
    async fn disabled_and_false_rules_leave_no_trace() {
        let sender = RecordingSender::new(true);
        let mut engine = RuleEngine::new(sender.clone());
        let mut history = CooldownTracker::new();
        let mut disabled = rule("disabled", "true", None, "discord");
        disabled.enabled = false;
        let rules = [disabled, rule("quiet", "false", Some("5m"), "discord")];

        let alerts = engine
            .evaluate_all(
                &StateSnapshot::empty(T0),
                &rules,
                &mut history,
                &channels(),
                T0,
            )
            .await;

        assert!(alerts.is_empty());
        assert!(history.entries().is_empty());
        assert_eq!(sender.count(), 0);
    }

    #[tokio::test]
    async fn alerts_keep_declaration_order_and_metrics() {
        let metrics = Metrics::new().unwrap();
        let sender = RecordingSender::new(true);
        let mut engine = RuleEngine::new(sender.clone()).with_metrics(metrics.clone());
        let mut history = CooldownTracker::new();
        let rules = [
            rule("b", "true", None, "discord"),
            rule("a", "true", None, "pager"),
            rule("c", "true", None, "discord"),
        ];

        let alerts = engine
            .evaluate_all(
                &StateSnapshot::empty(T0),
                &rules,
                &mut history,
                &channels(),
                T0,
            )
            .await;

        let ids: Vec<_> = alerts.iter().map(|a| a.rule_id.as_str()).collect();
        assert_eq!(ids, ["b", "a", "c"]);
        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains(r#"observd_alerts_triggered_total{rule="a",severity="warning"} 1"#));
        assert!(text.contains(r#"observd_deliveries_total{channel="discord",result="ok"} 2"#));
    }
}
