use super::{list_field, CollectError};
use crate::openclaw::OpenclawCli;
use crate::state::{AgentHealth, AgentStatus};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// One agent per openclaw session, keyed by session label.
pub async fn collect_agents(
    cli: &OpenclawCli,
    now_ms: i64,
) -> Result<BTreeMap<String, AgentStatus>, CollectError> {
    let listing = cli.run_json(&["sessions", "list"]).await?;
    let mut agents = BTreeMap::new();

    for session in list_field(&listing, &["sessions"])? {
        let key = session_key(session);
        let status = match cli.run_json(&["session", "status", &key]).await {
            Ok(status) => Some(status),
            Err(err) => {
                debug!(session = %key, error = %err, "session status unavailable");
                None
            }
        };
        let (label, agent) = agent_from_session(session, status.as_ref(), now_ms);
        agents.insert(label, agent);
    }
    Ok(agents)
}

fn session_key(session: &Value) -> String {
    first_str(session, &["key", "id", "name"]).unwrap_or_else(|| "unknown".to_string())
}

/// Builds the agent entry for a listed session. Without a status lookup the
/// agent is only known to be online if the listing says so.
pub fn agent_from_session(session: &Value, status: Option<&Value>, now_ms: i64) -> (String, AgentStatus) {
    let key = session_key(session);
    let label = first_str(session, &["label"]).unwrap_or_else(|| key.clone());
    let active = session.get("active").is_some_and(is_truthy);
    let model = first_str(session, &["model"]).unwrap_or_else(|| "unknown".to_string());

    let agent = match status {
        Some(status) => AgentStatus {
            status: if active {
                AgentHealth::Online
            } else {
                AgentHealth::Offline
            },
            last_seen: Some(now_ms),
            model,
            token_usage_last_hour: status
                .pointer("/usage/tokens")
                .and_then(Value::as_f64)
                .filter(|t| *t > 0.0)
                .unwrap_or(0.0),
            session_key: Some(key),
        },
        None => AgentStatus {
            status: if active {
                AgentHealth::Online
            } else {
                AgentHealth::Unknown
            },
            last_seen: None,
            model,
            token_usage_last_hour: 0.0,
            session_key: None,
        },
    };
    (label, agent)
}

fn first_str(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| value.get(*k))
        .find_map(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
