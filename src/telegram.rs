use crate::config::TelegramConfig;
use crate::dispatch::{render_html, SendError};
use crate::rules::Alert;
use crate::timefmt::now_millis;
use std::collections::{HashMap, VecDeque};
use teloxide::prelude::*;
use teloxide::types::{ChatId, ParseMode};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

const RATE_WINDOW_MS: i64 = 60_000;

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("telegram token not found: set '{0}' in the environment or telegram.bot_token in config")]
    MissingToken(String),
}

/// Outbound Telegram transport. Every alert goes to each configured chat,
/// limited per chat to `rate_limit_per_minute` messages.
pub struct TelegramSender {
    bot: Bot,
    limiter: Mutex<RateLimiter>,
}

impl TelegramSender {
    pub fn from_config(cfg: &TelegramConfig) -> Result<Self, TelegramError> {
        let token = resolve_token(cfg)
            .ok_or_else(|| TelegramError::MissingToken(cfg.bot_token_env.clone()))?;
        Ok(Self {
            bot: Bot::new(token),
            limiter: Mutex::new(RateLimiter::new(cfg.rate_limit_per_minute)),
        })
    }

    pub async fn send(&self, alert: &Alert, chat_ids: &[i64]) -> Result<(), SendError> {
        let text = render_html(alert);
        let mut delivered = 0_usize;
        let mut last_error = None;

        for &chat_id in chat_ids {
            if !self.limiter.lock().await.allow(chat_id, now_millis()) {
                warn!(chat_id, rule_id = %alert.rule_id, "telegram rate limit reached, alert skipped");
                continue;
            }
            match self
                .bot
                .send_message(ChatId(chat_id), text.clone())
                .parse_mode(ParseMode::Html)
                .await
            {
                Ok(_) => delivered += 1,
                Err(err) => {
                    warn!(chat_id, error = %err, "failed to send telegram message");
                    last_error = Some(err);
                }
            }
        }

        if delivered > 0 {
            return Ok(());
        }
        match last_error {
            Some(err) => Err(SendError::Telegram(err)),
            None if chat_ids.is_empty() => Err(SendError::NotConfigured(
                "telegram channel has no chat_ids".to_string(),
            )),
            None => Err(SendError::RateLimited),
        }
    }
}

/// Environment variable first, then the inline token.
fn resolve_token(cfg: &TelegramConfig) -> Option<String> {
    let env_token = std::env::var(&cfg.bot_token_env)
        .ok()
        .filter(|v| !v.trim().is_empty());
    env_token.or_else(|| {
        cfg.bot_token
            .as_ref()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

#[derive(Debug)]
struct RateLimiter {
    limit_per_minute: u32,
    timestamps_by_chat: HashMap<i64, VecDeque<i64>>,
}

impl RateLimiter {
    fn new(limit_per_minute: u32) -> Self {
        Self {
            limit_per_minute,
            timestamps_by_chat: HashMap::new(),
        }
    }

    fn allow(&mut self, chat_id: i64, now_ms: i64) -> bool {
        let queue = self.timestamps_by_chat.entry(chat_id).or_default();
        while let Some(ts) = queue.front().copied() {
            if now_ms.saturating_sub(ts) >= RATE_WINDOW_MS {
                queue.pop_front();
            } else {
                break;
            }
        }

        if queue.len() >= self.limit_per_minute as usize {
            return false;
        }

        queue.push_back(now_ms);
        true
    }
}
