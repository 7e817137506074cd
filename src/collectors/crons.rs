use super::{list_field, CollectError};
use crate::openclaw::OpenclawCli;
use crate::state::CronStatus;
use crate::timefmt::millis_from_json;
use serde_json::Value;

pub async fn collect_crons(cli: &OpenclawCli, now_ms: i64) -> Result<Vec<CronStatus>, CollectError> {
    let listing = cli.run_json(&["cron", "list"]).await?;
    Ok(list_field(&listing, &["jobs", "crons"])?
        .iter()
        .map(|job| cron_from_job(job, now_ms))
        .collect())
}

pub fn cron_from_job(job: &Value, now_ms: i64) -> CronStatus {
    let id = text(job, "id")
        .or_else(|| text(job, "jobId"))
        .unwrap_or_default();
    let name = text(job, "name").unwrap_or_else(|| id.clone());
    let schedule = job.get("schedule").filter(|s| s.is_object());
    let last_run = timestamp(job, "lastRun");
    let run_count = job.get("runCount").and_then(Value::as_u64).unwrap_or(0);

    CronStatus {
        missed_runs: missed_runs(schedule, last_run, run_count, now_ms),
        id,
        name,
        last_run,
        next_run: timestamp(job, "nextRun"),
        last_status: text(job, "lastStatus").unwrap_or_else(|| "unknown".to_string()),
        run_count,
        enabled: job.get("enabled") != Some(&Value::Bool(false)),
        schedule: schedule.cloned(),
    }
}

/// Only interval schedules can be checked: runs expected since the last run
/// minus the runs recorded, never below zero.
fn missed_runs(schedule: Option<&Value>, last_run: Option<i64>, run_count: u64, now_ms: i64) -> u64 {
    let (Some(schedule), Some(last_run)) = (schedule, last_run) else {
        return 0;
    };
    if schedule.get("kind").and_then(Value::as_str) != Some("every") {
        return 0;
    }
    let Some(every_ms) = schedule.get("everyMs").and_then(Value::as_f64).filter(|ms| *ms > 0.0) else {
        return 0;
    };
    let expected = (now_ms.saturating_sub(last_run) as f64 / every_ms).floor();
    let actual = run_count.max(1) as f64;
    (expected - actual).max(0.0) as u64
}

fn text(job: &Value, key: &str) -> Option<String> {
    match job.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn timestamp(job: &Value, key: &str) -> Option<i64> {
    job.get(key).and_then(millis_from_json).filter(|ms| *ms != 0)
}
