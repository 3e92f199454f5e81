use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};

use crate::config::TelegramConfig;
use crate::platform::{IncomingMessage, MessageSender, MessageText};

/// Telegram rejects messages longer than 4096 characters.
///
/// Long replies are split in `split_message`, which keeps code fences whole
/// when it can. A `*bold*` or `_italic_` span crossing a forced cut still
/// makes Telegram reject that chunk ("can't parse entities"); `deliver`
/// logs the failure and the chunk is not shown.
pub const MAX_MESSAGE_LEN: usize = 4096;

/// The subset of a Telegram `Update` the webhook cares about.
///
/// A missing `message` key deserializes to `None`; `"message": null` is a
/// parse error.
#[derive(Debug, Deserialize)]
pub struct Update {
    #[serde(default, deserialize_with = "present")]
    pub message: Option<Message>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub chat: Chat,
    /// `None` when the key is absent, `Some(None)` when it is `null`
    #[serde(default, deserialize_with = "present")]
    pub text: Option<Option<String>>,
}

/// Only runs for keys that are present, so `default` covers the absent case
fn present<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

impl From<Message> for IncomingMessage {
    fn from(msg: Message) -> Self {
        Self {
            chat_id: msg.chat.id,
            text: match msg.text {
                None => MessageText::Absent,
                Some(None) => MessageText::Null,
                Some(Some(text)) => MessageText::Text(text),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'a str,
}

#[derive(Debug, Serialize)]
struct SetWebhookRequest<'a> {
    url: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Split long messages for Telegram's length limit, preferring line and
/// word boundaries and cuts that leave no code fence open
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;
    let mut in_fence = false;

    while rest.len() > max_len {
        let mut end = max_len;
        while end > 0 && !rest.is_char_boundary(end) {
            end -= 1;
        }
        // A single character wider than max_len still has to go somewhere
        if end == 0 {
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }

        let window = &rest[..end];
        let cut = fence_safe_cut(window, in_fence)
            .or_else(|| window.rfind('\n').map(|pos| pos + 1))
            .or_else(|| window.rfind(' ').map(|pos| pos + 1))
            .unwrap_or(end);

        let (head, tail) = rest.split_at(cut);
        if toggles_fence(head) {
            in_fence = !in_fence;
        }
        chunks.push(head.to_string());
        rest = tail;
    }

    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }

    chunks
}

fn toggles_fence(text: &str) -> bool {
    text.matches("```").count() % 2 == 1
}

/// End of the last line in `window` after which no code fence is open
fn fence_safe_cut(window: &str, mut in_fence: bool) -> Option<usize> {
    let mut best = None;
    let mut offset = 0;

    for line in window.split_inclusive('\n') {
        offset += line.len();
        if toggles_fence(line) {
            in_fence = !in_fence;
        }
        if line.ends_with('\n') && !in_fence {
            best = Some(offset);
        }
    }

    best
}

/// Minimal Bot API client: `sendMessage` and `setWebhook`
pub struct TelegramClient {
    client: reqwest::Client,
    config: TelegramConfig,
}

impl TelegramClient {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.bot_token,
            method
        )
    }

    /// Post a Markdown message. The Bot API response is not inspected.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let request = SendMessageRequest {
            chat_id,
            text,
            parse_mode: "Markdown",
        };

        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&request)
            .send()
            .await
            .context("Failed to send request to Telegram")?;

        debug!("sendMessage to chat {} returned {}", chat_id, response.status());
        Ok(())
    }

    /// Register `url` as the bot's webhook
    pub async fn set_webhook(&self, url: &str) -> Result<()> {
        let response = self
            .client
            .post(self.method_url("setWebhook"))
            .json(&SetWebhookRequest { url })
            .send()
            .await
            .context("Failed to send setWebhook request to Telegram")?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let parsed: Option<ApiResponse> = serde_json::from_str(&body).ok();

        match parsed {
            Some(api) if status.is_success() && api.ok => {
                info!("Webhook registered: {}", url);
                Ok(())
            }
            Some(api) => anyhow::bail!(
                "Telegram setWebhook failed ({}): {}",
                status,
                api.description.unwrap_or(body)
            ),
            None => anyhow::bail!("Telegram setWebhook failed ({}): {}", status, body),
        }
    }
}

#[async_trait]
impl MessageSender for TelegramClient {
    async fn deliver(&self, chat_id: i64, text: &str) {
        for chunk in split_message(text, MAX_MESSAGE_LEN) {
            if let Err(e) = self.send_message(chat_id, &chunk).await {
                warn!("Failed to deliver message to chat {}: {:#}", chat_id, e);
            }
        }
    }
}
