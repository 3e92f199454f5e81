pub mod telegram;

use async_trait::async_trait;

/// A chat message extracted from an inbound update
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    /// Chat the reply goes back to
    pub chat_id: i64,
    pub text: MessageText,
}

/// The `text` field of an inbound message, keeping "absent" apart from "null"
#[derive(Debug, Clone, PartialEq)]
pub enum MessageText {
    /// No `text` key: stickers, photos and other non-text content
    Absent,
    /// `"text": null`
    Null,
    Text(String),
}

/// Sends text into a chat. Delivery is best-effort: implementations log
/// failures instead of returning them.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn deliver(&self, chat_id: i64, text: &str);
}
