use crate::collectors::SnapshotProvider;
use crate::config::ChannelConfig;
use crate::cooldown::CooldownTracker;
use crate::dispatch::ChannelSender;
use crate::engine::RuleEngine;
use crate::history::{HistoryStore, StateFile};
use crate::metrics::Metrics;
use crate::rules::{Alert, Rule};
use crate::state::{State, StateSnapshot};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

#[derive(Debug)]
pub enum PollOutcome {
    Completed {
        snapshot: StateSnapshot,
        alerts: Vec<Alert>,
    },
    /// Another pass held the lock.
    Skipped,
}

struct Pass {
    engine: RuleEngine,
    cooldowns: CooldownTracker,
}

/// Runs evaluation passes one at a time and publishes their results.
pub struct Poller {
    pass: Mutex<Pass>,
    provider: Arc<dyn SnapshotProvider>,
    rules: Vec<Rule>,
    channels: HashMap<String, ChannelConfig>,
    shared: Arc<RwLock<State>>,
    metrics: Option<Arc<Metrics>>,
    history: Option<HistoryStore>,
}

impl Poller {
    pub fn new(
        provider: Arc<dyn SnapshotProvider>,
        sender: Arc<dyn ChannelSender>,
        shared: Arc<RwLock<State>>,
    ) -> Self {
        Self {
            pass: Mutex::new(Pass {
                engine: RuleEngine::new(sender),
                cooldowns: CooldownTracker::new(),
            }),
            provider,
            rules: Vec::new(),
            channels: HashMap::new(),
            shared,
            metrics: None,
            history: None,
        }
    }

    pub fn with_rules(mut self, rules: Vec<Rule>, channels: HashMap<String, ChannelConfig>) -> Self {
        self.rules = rules;
        self.channels = channels;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        let pass = self.pass.get_mut();
        let sender = pass.engine.sender();
        pass.engine = RuleEngine::new(sender).with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn with_cooldowns(mut self, cooldowns: CooldownTracker) -> Self {
        self.pass.get_mut().cooldowns = cooldowns;
        self
    }

    pub fn with_history(mut self, history: HistoryStore) -> Self {
        self.history = Some(history);
        self
    }

    /// One full pass: collect, evaluate every rule, publish, persist.
    pub async fn poll_once(&self, now_ms: i64) -> PollOutcome {
        let Ok(mut pass) = self.pass.try_lock() else {
            warn!("previous poll still running, skipping this one");
            if let Some(metrics) = &self.metrics {
                metrics.inc_poll_skipped();
            }
            return PollOutcome::Skipped;
        };

        let snapshot = self.provider.collect(now_ms).await;
        let Pass { engine, cooldowns } = &mut *pass;
        let alerts = engine
            .evaluate_all(&snapshot, &self.rules, cooldowns, &self.channels, now_ms)
            .await;

        let state_file = {
            let mut shared = self.shared.write().await;
            shared.update_after_poll(now_ms, snapshot.clone(), cooldowns.entries().clone(), &alerts);
            if let Some(metrics) = &self.metrics {
                metrics.inc_poll();
                metrics.update_from_state(&shared, now_ms);
            }
            StateFile {
                snapshot: Some(snapshot.clone()),
                cooldowns: cooldowns.entries().clone(),
                alerts: shared.recent_alerts.iter().cloned().collect(),
            }
        };

        if let Some(history) = self.history.clone() {
            match tokio::task::spawn_blocking(move || history.save(state_file, now_ms)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "failed to persist state"),
                Err(err) => warn!(error = %err, "state persistence task failed"),
            }
        }

        info!(
            agents = snapshot.agents.len(),
            crons = snapshot.crons.len(),
            alerts = alerts.len(),
            "poll complete"
        );
        PollOutcome::Completed { snapshot, alerts }
    }
}
