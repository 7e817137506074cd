use crate::state::{AgentHealth, State};
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;

const ACTIVE_COOLDOWN_WINDOW_MS: i64 = 3_600_000;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub polls_total: Counter,
    pub polls_skipped_total: Counter,
    pub rule_evaluations_total: CounterVec,
    pub condition_errors_total: CounterVec,
    pub alerts_triggered_total: CounterVec,
    pub deliveries_total: CounterVec,
    pub collect_errors_total: CounterVec,
    pub scrape_count_total: Counter,
    pub agents: GaugeVec,
    pub cron_jobs: Gauge,
    pub cron_missed_runs: Gauge,
    pub memory_usage_mb: Gauge,
    pub disk_usage_percent: Gauge,
    pub load_average: GaugeVec,
    pub active_cooldowns: Gauge,
    pub last_poll_timestamp_seconds: Gauge,
    pub uptime_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let polls_total = Counter::with_opts(opts!(
            "observd_polls_total",
            "Completed polling passes"
        ))?;
        let polls_skipped_total = Counter::with_opts(opts!(
            "observd_polls_skipped_total",
            "Passes skipped because another pass was in flight"
        ))?;
        let rule_evaluations_total = CounterVec::new(
            opts!(
                "observd_rule_evaluations_total",
                "Condition evaluations by rule"
            ),
            &["rule"],
        )?;
        let condition_errors_total = CounterVec::new(
            opts!(
                "observd_condition_errors_total",
                "Conditions that failed to parse or evaluate, by rule"
            ),
            &["rule"],
        )?;
        let alerts_triggered_total = CounterVec::new(
            opts!(
                "observd_alerts_triggered_total",
                "Alerts triggered by rule and severity"
            ),
            &["rule", "severity"],
        )?;
        let deliveries_total = CounterVec::new(
            opts!(
                "observd_deliveries_total",
                "Alert deliveries by channel and result"
            ),
            &["channel", "result"],
        )?;
        let collect_errors_total = CounterVec::new(
            opts!(
                "observd_collect_errors_total",
                "Snapshot collector errors by collector"
            ),
            &["collector"],
        )?;
        let scrape_count_total = Counter::with_opts(opts!(
            "observd_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let agents = GaugeVec::new(
            opts!("observd_agents", "Agents in the last snapshot by status"),
            &["status"],
        )?;
        let cron_jobs = Gauge::with_opts(opts!(
            "observd_cron_jobs",
            "Scheduled jobs in the last snapshot"
        ))?;
        let cron_missed_runs = Gauge::with_opts(opts!(
            "observd_cron_missed_runs",
            "Total missed runs across scheduled jobs"
        ))?;
        let memory_usage_mb = Gauge::with_opts(opts!(
            "observd_memory_usage_mb",
            "Used memory in MB"
        ))?;
        let disk_usage_percent = Gauge::with_opts(opts!(
            "observd_disk_usage_percent",
            "Root filesystem usage in percent"
        ))?;
        let load_average = GaugeVec::new(
            opts!("observd_load_average", "System load average by window"),
            &["window"],
        )?;
        let active_cooldowns = Gauge::with_opts(opts!(
            "observd_active_cooldowns",
            "Rules triggered within the last hour"
        ))?;
        let last_poll_timestamp_seconds = Gauge::with_opts(opts!(
            "observd_last_poll_timestamp_seconds",
            "Unix timestamp of the last completed pass"
        ))?;
        let uptime_seconds =
            Gauge::with_opts(opts!("observd_uptime_seconds", "Daemon uptime in seconds"))?;

        register(&registry, &polls_total)?;
        register(&registry, &polls_skipped_total)?;
        register(&registry, &rule_evaluations_total)?;
        register(&registry, &condition_errors_total)?;
        register(&registry, &alerts_triggered_total)?;
        register(&registry, &deliveries_total)?;
        register(&registry, &collect_errors_total)?;
        register(&registry, &scrape_count_total)?;
        register(&registry, &agents)?;
        register(&registry, &cron_jobs)?;
        register(&registry, &cron_missed_runs)?;
        register(&registry, &memory_usage_mb)?;
        register(&registry, &disk_usage_percent)?;
        register(&registry, &load_average)?;
        register(&registry, &active_cooldowns)?;
        register(&registry, &last_poll_timestamp_seconds)?;
        register(&registry, &uptime_seconds)?;

        Ok(Arc::new(Self {
            registry,
            polls_total,
            polls_skipped_total,
            rule_evaluations_total,
            condition_errors_total,
            alerts_triggered_total,
            deliveries_total,
            collect_errors_total,
            scrape_count_total,
            agents,
            cron_jobs,
            cron_missed_runs,
            memory_usage_mb,
            disk_usage_percent,
            load_average,
            active_cooldowns,
            last_poll_timestamp_seconds,
            uptime_seconds,
        }))
    }

    pub fn update_from_state(&self, state: &State, now_ms: i64) {
        self.uptime_seconds
            .set((now_ms.saturating_sub(state.started_at_ms) / 1000) as f64);
        if let Some(last) = state.last_poll_ms {
            self.last_poll_timestamp_seconds.set((last / 1000) as f64);
        }
        self.active_cooldowns.set(
            state
                .cooldowns
                .values()
                .filter(|ts| now_ms.saturating_sub(**ts) < ACTIVE_COOLDOWN_WINDOW_MS)
                .count() as f64,
        );

        let Some(snapshot) = &state.snapshot else {
            return;
        };

        for health in [AgentHealth::Online, AgentHealth::Offline, AgentHealth::Unknown] {
            let count = snapshot
                .agents
                .values()
                .filter(|a| a.status == health)
                .count();
            self.agents
                .with_label_values(&[health.as_str()])
                .set(count as f64);
        }
        self.cron_jobs.set(snapshot.crons.len() as f64);
        self.cron_missed_runs
            .set(snapshot.missed_runs_total() as f64);

        let resources = &snapshot.resources;
        self.memory_usage_mb
            .set(resources.memory_usage_mb.unwrap_or(f64::NAN));
        self.disk_usage_percent
            .set(resources.disk_usage_percent.unwrap_or(f64::NAN));
        self.load_average.reset();
        if let Some(load) = resources.load_average {
            self.load_average.with_label_values(&["1m"]).set(load.load1);
            self.load_average.with_label_values(&["5m"]).set(load.load5);
            self.load_average
                .with_label_values(&["15m"])
                .set(load.load15);
        }
    }

    pub fn inc_poll(&self) {
        self.polls_total.inc();
    }

    pub fn inc_poll_skipped(&self) {
        self.polls_skipped_total.inc();
    }

    pub fn inc_rule_evaluation(&self, rule_id: &str) {
        self.rule_evaluations_total
            .with_label_values(&[rule_id])
            .inc();
    }

    pub fn inc_condition_error(&self, rule_id: &str) {
        self.condition_errors_total
            .with_label_values(&[rule_id])
            .inc();
    }

    pub fn inc_alert_triggered(&self, rule_id: &str, severity: &str) {
        self.alerts_triggered_total
            .with_label_values(&[rule_id, severity])
            .inc();
    }

    pub fn inc_delivery(&self, channel: &str, delivered: bool) {
        let result = if delivered { "ok" } else { "failed" };
        self.deliveries_total
            .with_label_values(&[channel, result])
            .inc();
    }

    pub fn inc_collect_error(&self, collector: &str) {
        self.collect_errors_total
            .with_label_values(&[collector])
            .inc();
    }

    pub fn inc_scrape_count(&self) {
        self.scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}
