use crate::metrics::Metrics;
use crate::poller::{PollOutcome, Poller};
use crate::rules::Alert;
use crate::state::{State as DaemonState, StateSnapshot};
use crate::timefmt::{self, now_millis};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

const ACTIVE_COOLDOWN_WINDOW_MS: i64 = 3_600_000;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub state: Arc<RwLock<DaemonState>>,
    pub poller: Arc<Poller>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiCooldown {
    pub rule_id: String,
    #[serde(with = "timefmt::rfc3339")]
    pub last_triggered: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiState {
    #[serde(with = "timefmt::rfc3339")]
    pub started_at: i64,
    #[serde(with = "timefmt::rfc3339_opt")]
    pub last_poll: Option<i64>,
    pub snapshot: Option<StateSnapshot>,
    pub active_cooldowns: Vec<ApiCooldown>,
    pub recent_alerts: Vec<Alert>,
}

impl ApiState {
    fn from_state(value: &DaemonState, now_ms: i64) -> Self {
        Self {
            started_at: value.started_at_ms,
            last_poll: value.last_poll_ms,
            snapshot: value.snapshot.clone(),
            active_cooldowns: value
                .cooldowns
                .iter()
                .filter(|(_, ts)| now_ms.saturating_sub(**ts) < ACTIVE_COOLDOWN_WINDOW_MS)
                .map(|(rule_id, ts)| ApiCooldown {
                    rule_id: rule_id.clone(),
                    last_triggered: *ts,
                })
                .collect(),
            recent_alerts: value.recent_alerts.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct PollResponse {
    alerts: Vec<Alert>,
}

pub fn build_router(metrics: Arc<Metrics>, state: Arc<RwLock<DaemonState>>, poller: Arc<Poller>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/state", get(state_handler))
        .route("/api/alerts", get(alerts_handler))
        .route("/api/poll", post(poll_handler))
        .with_state(HttpAppState {
            metrics,
            state,
            poller,
        })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    state
        .metrics
        .update_from_state(&*state.state.read().await, now_millis());
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn state_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let guard = state.state.read().await;
    Json(ApiState::from_state(&guard, now_millis()))
}

async fn alerts_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let guard = state.state.read().await;
    Json(guard.recent_alerts.iter().cloned().collect::<Vec<_>>())
}

async fn poll_handler(State(state): State<HttpAppState>) -> Response {
    match state.poller.poll_once(now_millis()).await {
        PollOutcome::Completed { alerts, .. } => {
            (StatusCode::ACCEPTED, Json(PollResponse { alerts })).into_response()
        }
        PollOutcome::Skipped => (StatusCode::CONFLICT, "poll already in progress").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::RecordingSender;
    use crate::poller::tests::{FixedProvider, GatedProvider};
    use crate::rules::Severity;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app_with(poller_state: Arc<RwLock<DaemonState>>, poller: Poller) -> (Router, Arc<Metrics>) {
        let metrics = Metrics::new().unwrap();
        let app = build_router(metrics.clone(), poller_state, Arc::new(poller));
        (app, metrics)
    }

    fn app() -> (Router, Arc<RwLock<DaemonState>>) {
        let state = Arc::new(RwLock::new(DaemonState::new(0)));
        let poller = Poller::new(
            Arc::new(FixedProvider(StateSnapshot::empty(0))),
            RecordingSender::new(true),
            state.clone(),
        );
        (app_with(state.clone(), poller).0, state)
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_req(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (app, _) = app();
        let response = app.oneshot(get_req("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
    }

    #[tokio::test]
    async fn metrics_contains_uptime() {
        let (app, _) = app();
        let response = app.oneshot(get_req("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4"
        );
        let text = body_text(response).await;
        assert!(text.contains("observd_uptime_seconds"));
        assert!(text.contains("observd_scrape_count_total 1"));
    }

    #[tokio::test]
    async fn api_state_lists_recent_alerts_and_active_cooldowns() {
        let (app, state) = app();
        let now = now_millis();
        {
            let mut guard = state.write().await;
            guard.cooldowns.insert("fresh".to_string(), now - 1_000);
            guard.cooldowns.insert("stale".to_string(), now - 2 * ACTIVE_COOLDOWN_WINDOW_MS);
            guard.push_alerts([Alert {
                id: format!("alert_{now}_fresh"),
                rule_id: "fresh".to_string(),
                triggered_at: now - 1_000,
                message: "disk full".to_string(),
                severity: Severity::Critical,
                resolved: false,
            }]);
        }

        let response = app.oneshot(get_req("/api/state")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        let cooldowns = json["active_cooldowns"].as_array().unwrap();
        assert_eq!(cooldowns.len(), 1);
        assert_eq!(cooldowns[0]["rule_id"], "fresh");
        assert_eq!(json["recent_alerts"][0]["severity"], "critical");
        assert!(json["snapshot"].is_null());
        assert!(json["last_poll"].is_null());
    }

    #[test]
    fn extreme_cooldown_instants_do_not_overflow() {
        let mut state = DaemonState::new(0);
        state.cooldowns.insert("ancient".to_string(), i64::MIN);
        state.cooldowns.insert("future".to_string(), i64::MAX);

        let api = ApiState::from_state(&state, 1_700_000_000_000);
        assert_eq!(api.active_cooldowns.len(), 1);
        assert_eq!(api.active_cooldowns[0].rule_id, "future");
    }

    #[tokio::test]
    async fn api_alerts_returns_array() {
        let (app, _) = app();
        let response = app.oneshot(get_req("/api/alerts")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "[]");
    }

    #[tokio::test]
    async fn poll_runs_a_pass() {
        let (app, state) = app();
        let response = app.oneshot(post_req("/api/poll")).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert!(json["alerts"].as_array().unwrap().is_empty());
        assert!(state.read().await.last_poll_ms.is_some());
    }

    #[tokio::test]
    async fn poll_conflicts_while_pass_in_flight() {
        let provider = GatedProvider::new();
        let state = Arc::new(RwLock::new(DaemonState::new(0)));
        let poller = Poller::new(provider.clone(), RecordingSender::new(true), state.clone());
        let (app, _) = app_with(state, poller);

        let first = tokio::spawn(app.clone().oneshot(post_req("/api/poll")));
        provider.entered.notified().await;

        let response = app.oneshot(post_req("/api/poll")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        provider.release.notify_one();
        assert_eq!(first.await.unwrap().unwrap().status(), StatusCode::ACCEPTED);
    }
}
