use crate::config::{ChannelConfig, Transport};
use crate::openclaw::{CliError, OpenclawCli};
use crate::rules::Alert;
use crate::telegram::TelegramSender;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("openclaw command failed: {0}")]
    Command(#[from] CliError),
    #[error("telegram request failed: {0}")]
    Telegram(#[from] teloxide::RequestError),
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    NotConfigured(String),
    #[error("telegram rate limit reached for every chat")]
    RateLimited,
}

/// Delivery boundary used by the rule engine. Returns whether the alert got
/// through; the cause of a failure is logged by the implementation.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, alert: &Alert, channel: &ChannelConfig) -> bool;
}

pub fn render_markdown(alert: &Alert) -> String {
    format!(
        "{} **{}**\n{}",
        alert.severity.emoji(),
        alert.severity.as_str().to_uppercase(),
        alert.message
    )
}

pub fn render_html(alert: &Alert) -> String {
    format!(
        "{} <b>{}</b>\n{}",
        alert.severity.emoji(),
        alert.severity.as_str().to_uppercase(),
        escape_html(&alert.message)
    )
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Routes each alert to the transport named by its channel config.
pub struct TransportSender {
    cli: OpenclawCli,
    telegram: Option<TelegramSender>,
    client: Client,
}

impl TransportSender {
    pub fn new(cli: OpenclawCli, telegram: Option<TelegramSender>) -> Self {
        let client = Client::builder()
            .user_agent(concat!("observd/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            cli,
            telegram,
            client,
        }
    }

    async fn deliver(&self, alert: &Alert, channel: &ChannelConfig) -> Result<(), SendError> {
        match channel.transport {
            Transport::Openclaw => {
                let content = render_markdown(alert);
                self.cli
                    .run(&["message", "send", "--channel", &channel.channel, "--message", &content])
                    .await?;
                Ok(())
            }
            Transport::Telegram => {
                let telegram = self.telegram.as_ref().ok_or_else(|| {
                    SendError::NotConfigured("telegram bot token is not configured".to_string())
                })?;
                telegram.send(alert, &channel.chat_ids).await
            }
            Transport::Webhook => {
                let url = channel.url.as_deref().ok_or_else(|| {
                    SendError::NotConfigured(format!("channel '{}' has no webhook url", channel.channel))
                })?;
                self.client
                    .post(url)
                    .json(&serde_json::json!({
                        "content": render_markdown(alert),
                        "alert": alert,
                    }))
                    .send()
                    .await?
                    .error_for_status()?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ChannelSender for TransportSender {
    async fn send(&self, alert: &Alert, channel: &ChannelConfig) -> bool {
        match self.deliver(alert, channel).await {
            Ok(()) => {
                info!(
                    rule_id = %alert.rule_id,
                    channel = %channel.channel,
                    transport = channel.transport.as_str(),
                    "alert sent"
                );
                true
            }
            Err(err) => {
                warn!(
                    rule_id = %alert.rule_id,
                    channel = %channel.channel,
                    transport = channel.transport.as_str(),
                    error = %err,
                    "failed to send alert"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OpenclawConfig;
    use crate::rules::Severity;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    fn alert(severity: Severity, message: &str) -> Alert {
        Alert {
            id: "alert_1_r".to_string(),
            rule_id: "r".to_string(),
            triggered_at: 1,
            message: message.to_string(),
            severity,
            resolved: false,
        }
    }

    fn sender(binary: &str) -> TransportSender {
        TransportSender::new(
            OpenclawCli::new(&OpenclawConfig {
                binary: binary.to_string(),
                timeout_secs: 5,
            }),
            None,
        )
    }

    #[test]
    fn markdown_rendering() {
        assert_eq!(
            render_markdown(&alert(Severity::Critical, "main is down")),
            "🚨 **CRITICAL**\nmain is down"
        );
        assert_eq!(
            render_markdown(&alert(Severity::Info, "fyi")),
            "ℹ️ **INFO**\nfyi"
        );
    }

    #[test]
    fn html_rendering_escapes_message() {
        assert_eq!(
            render_html(&alert(Severity::Warning, "load <high> & rising")),
            "⚠️ <b>WARNING</b>\nload &lt;high&gt; &amp; rising"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn openclaw_transport_reports_command_result() {
        let channel = ChannelConfig {
            enabled: true,
            channel: "discord".to_string(),
            ..ChannelConfig::default()
        };
        let a = alert(Severity::Critical, "quote \" and $(x)");
        assert!(sender("true").send(&a, &channel).await);
        assert!(!sender("false").send(&a, &channel).await);
    }

    #[tokio::test]
    async fn telegram_without_token_fails() {
        let channel = ChannelConfig {
            enabled: true,
            transport: Transport::Telegram,
            channel: "tg".to_string(),
            chat_ids: vec![1],
            url: None,
        };
        assert!(!sender("true").send(&alert(Severity::Info, "x"), &channel).await);
    }

    #[tokio::test]
    async fn webhook_posts_content_and_alert() {
        let received = Arc::new(Mutex::new(None::<serde_json::Value>));
        let sink = received.clone();
        let app = Router::new().route(
            "/hook",
            post(move |Json(body): Json<serde_json::Value>| {
                let sink = sink.clone();
                async move {
                    *sink.lock().unwrap() = Some(body);
                    "ok"
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let channel = ChannelConfig {
            enabled: true,
            transport: Transport::Webhook,
            channel: "hook".to_string(),
            chat_ids: vec![],
            url: Some(format!("http://{addr}/hook")),
        };
        assert!(sender("true").send(&alert(Severity::Warning, "disk"), &channel).await);

        let body = received.lock().unwrap().clone().unwrap();
        assert_eq!(body["content"], "⚠️ **WARNING**\ndisk");
        assert_eq!(body["alert"]["rule_id"], "r");
        assert_eq!(body["alert"]["severity"], "warning");
    }

    #[tokio::test]
    async fn webhook_error_status_is_a_failure() {
        let app = Router::new().route(
            "/hook",
            post(|| async { axum::http::StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let channel = ChannelConfig {
            enabled: true,
            transport: Transport::Webhook,
            channel: "hook".to_string(),
            chat_ids: vec![],
            url: Some(format!("http://{addr}/hook")),
        };
        assert!(!sender("true").send(&alert(Severity::Warning, "disk"), &channel).await);
    }
}
