use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::services::retry::{AttemptError, RetryExhausted, RetryPolicy};

pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";
/// Telegram rejects messages longer than this many characters.
pub const TELEGRAM_MAX_MESSAGE_CHARS: usize = 4096;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(#[from] RetryExhausted),
    #[error("nothing to deliver")]
    Empty,
}

/// Destination for formatted messages. Implementations own their delivery
/// retry policy; callers never retry a failed `send`.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), NotifyError>;
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

/// Sends HTML messages to one Telegram chat through the Bot API.
pub struct TelegramNotifier {
    client: Client,
    endpoint: String,
    chat_id: i64,
    policy: RetryPolicy,
}

impl TelegramNotifier {
    pub fn new(api_base: &str, api_token: &str, chat_id: i64, policy: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/bot{}/sendMessage",
                api_base.trim_end_matches('/'),
                api_token
            ),
            chat_id,
            policy,
        })
    }

    async fn send_chunk(&self, chunk: &str) -> Result<(), NotifyError> {
        let body = SendMessageRequest {
            chat_id: self.chat_id,
            text: chunk,
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };

        self.policy
            .run_with_tokio(|attempt| {
                let request = self.client.post(&self.endpoint).json(&body);
                async move {
                    debug!(attempt, "Sending Telegram message");
                    let response = request.send().await?;
                    AttemptError::check_status(response).await?;
                    Ok::<_, AttemptError>(())
                }
            })
            .await?;

        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        let chunks = split_message(text, TELEGRAM_MAX_MESSAGE_CHARS);
        if chunks.is_empty() {
            return Err(NotifyError::Empty);
        }
        for chunk in &chunks {
            self.send_chunk(chunk).await?;
        }
        info!(chat_id = self.chat_id, parts = chunks.len(), "Message delivered");
        Ok(())
    }
}

/// Splits `text` into pieces of at most `limit` characters, breaking on line
/// boundaries where possible. A single overlong line is hard-split.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.lines() {
        let line_len = line.chars().count();
        let needed = if current.is_empty() { line_len } else { line_len + 1 };

        if current_len + needed > limit && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if line_len > limit {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(limit) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }

        if !current.is_empty() {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(line);
        current_len += line_len;
    }

    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks
}
