pub mod agents;
pub mod crons;
pub mod resources;

use crate::metrics::Metrics;
use crate::openclaw::{CliError, OpenclawCli};
use crate::state::StateSnapshot;
use agents::collect_agents;
use async_trait::async_trait;
use crons::collect_crons;
use resources::ResourceCollector;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Command(#[from] CliError),
    #[error("unexpected output: {0}")]
    UnexpectedOutput(String),
    #[error("resource probe unavailable: {0}")]
    Probe(String),
}

/// Source of snapshots for the rule engine. Never fails: a part that cannot be
/// gathered is left empty.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn collect(&self, now_ms: i64) -> StateSnapshot;
}

/// Agents and crons from the openclaw CLI, resources from the local host.
pub struct SystemSnapshotProvider {
    cli: OpenclawCli,
    resources: ResourceCollector,
    metrics: Option<Arc<Metrics>>,
}

impl SystemSnapshotProvider {
    pub fn new(cli: OpenclawCli) -> Self {
        Self {
            cli,
            resources: ResourceCollector::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn degrade<T: Default>(&self, collector: &str, result: Result<T, CollectError>) -> T {
        result.unwrap_or_else(|err| {
            warn!(collector, error = %err, "collector failed, using empty data");
            if let Some(metrics) = &self.metrics {
                metrics.inc_collect_error(collector);
            }
            T::default()
        })
    }
}

#[async_trait]
impl SnapshotProvider for SystemSnapshotProvider {
    async fn collect(&self, now_ms: i64) -> StateSnapshot {
        let (agents, crons, resources) = tokio::join!(
            collect_agents(&self.cli, now_ms),
            collect_crons(&self.cli, now_ms),
            self.resources.collect(),
        );
        StateSnapshot {
            timestamp: now_ms,
            agents: self.degrade("agents", agents),
            crons: self.degrade("crons", crons),
            resources: self.degrade("resources", resources),
        }
    }
}

/// Accepts a bare array or an object wrapping it under one of `keys`.
fn list_field<'a>(value: &'a serde_json::Value, keys: &[&str]) -> Result<&'a [serde_json::Value], CollectError> {
    if let Some(items) = value.as_array() {
        return Ok(items);
    }
    for key in keys {
        if let Some(items) = value.get(*key).and_then(|v| v.as_array()) {
            return Ok(items);
        }
    }
    if value.get("raw").is_some() {
        return Err(CollectError::UnexpectedOutput(
            "command did not return JSON".to_string(),
        ));
    }
    Ok(&[])
}
