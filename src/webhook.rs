use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{body::Bytes, extract::State, http::Method, routing::any, Json, Router};
use serde::Serialize;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::llm::TextGenerator;
use crate::platform::telegram::Update;
use crate::platform::{IncomingMessage, MessageSender, MessageText};

pub const NON_TEXT_NOTICE: &str = "Please send text messages only.";

/// JSON acknowledgement returned for every webhook call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WebhookReply {
    Status { status: &'static str },
    Error { error: String },
}

impl WebhookReply {
    pub fn success() -> Self {
        Self::Status { status: "success" }
    }

    pub fn not_a_message() -> Self {
        Self::Status {
            status: "not a message",
        }
    }

    pub fn non_text() -> Self {
        Self::Status {
            status: "non-text message",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }
}

/// Relays one inbound update to the generator and the reply back to the chat
pub struct WebhookAdapter {
    generator: Arc<dyn TextGenerator>,
    sender: Arc<dyn MessageSender>,
}

impl WebhookAdapter {
    pub fn new(generator: Arc<dyn TextGenerator>, sender: Arc<dyn MessageSender>) -> Self {
        Self { generator, sender }
    }

    pub async fn handle(&self, method: &Method, body: &[u8]) -> WebhookReply {
        if *method != Method::POST {
            return WebhookReply::error("Only POST requests are accepted");
        }

        match self.process(body).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Error: {:#}", e);
                WebhookReply::error(format!("{:#}", e))
            }
        }
    }

    async fn process(&self, body: &[u8]) -> Result<WebhookReply> {
        let update: Update =
            serde_json::from_slice(body).context("Failed to parse Telegram update")?;

        let Some(message) = update.message else {
            return Ok(WebhookReply::not_a_message());
        };

        let IncomingMessage { chat_id, text } = message.into();

        let reply = match text {
            MessageText::Absent => {
                self.sender.deliver(chat_id, NON_TEXT_NOTICE).await;
                return Ok(WebhookReply::non_text());
            }
            MessageText::Null => {
                info!("Telegram message from chat {} with null text", chat_id);
                apology(&anyhow::anyhow!("message text is null"))
            }
            MessageText::Text(text) => {
                info!("Telegram message from chat {}: {}", chat_id, text);
                self.generate_reply(&text).await
            }
        };

        self.sender.deliver(chat_id, &reply).await;

        Ok(WebhookReply::success())
    }

    /// Generated text, or an apology carrying the failure detail
    pub async fn generate_reply(&self, prompt: &str) -> String {
        match self.generator.generate(prompt).await {
            Ok(text) => text,
            Err(e) => apology(&e),
        }
    }
}

fn apology(e: &anyhow::Error) -> String {
    error!("Could not generate a reply: {:#}", e);
    format!("Sorry, I encountered an error: {:#}", e)
}

async fn receive_update(
    State(adapter): State<Arc<WebhookAdapter>>,
    method: Method,
    body: Bytes,
) -> Json<WebhookReply> {
    Json(adapter.handle(&method, &body).await)
}

pub fn router(webhook_path: &str, adapter: Arc<WebhookAdapter>) -> Router {
    Router::new()
        .route(webhook_path, any(receive_update))
        .with_state(adapter)
}

/// Resolves when `signal` fires. If the handler could not be installed the
/// error is logged and this never resolves.
async fn wait_for_signal<F>(name: &str, signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        error!("Failed to listen for {}: {}", name, e);
        std::future::pending::<()>().await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = wait_for_signal("Ctrl-C", tokio::signal::ctrl_c());

    #[cfg(unix)]
    let terminate = wait_for_signal("SIGTERM", async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        sigterm.recv().await;
        Ok::<(), std::io::Error>(())
    });

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutting down");
}

/// Serve the webhook until Ctrl-C or SIGTERM
pub async fn serve(config: &ServerConfig, adapter: Arc<WebhookAdapter>) -> Result<()> {
    let app = router(&config.webhook_path, adapter);

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_address))?;

    info!(
        "Listening for Telegram updates on http://{}{}",
        config.bind_address, config.webhook_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    struct FakeGenerator {
        result: std::result::Result<String, String>,
        prompts: Mutex<Vec<String>>,
    }

    impl FakeGenerator {
        fn replying(text: &str) -> Arc<Self> {
            Arc::new(Self {
                result: Ok(text.to_string()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                result: Err(message.to_string()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TextGenerator for FakeGenerator {
        async fn generate(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().await.push(prompt.to_string());
            self.result.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn deliver(&self, chat_id: i64, text: &str) {
            self.sent.lock().await.push((chat_id, text.to_string()));
        }
    }

    fn adapter(
        generator: Arc<FakeGenerator>,
    ) -> (WebhookAdapter, Arc<FakeGenerator>, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender::default());
        let adapter = WebhookAdapter::new(generator.clone(), sender.clone());
        (adapter, generator, sender)
    }

    fn to_json(reply: &WebhookReply) -> Value {
        serde_json::to_value(reply).unwrap()
    }

    #[tokio::test]
    async fn test_non_post_rejected_without_calls() {
        let (adapter, generator, sender) = adapter(FakeGenerator::replying("hi"));
        let body = br#"{"message": {"chat": {"id": 1}, "text": "hello"}}"#;

        for method in [Method::GET, Method::PUT, Method::DELETE, Method::PATCH] {
            let reply = adapter.handle(&method, body).await;
            assert_eq!(
                to_json(&reply),
                json!({"error": "Only POST requests are accepted"})
            );
        }

        assert!(generator.prompts.lock().await.is_empty());
        assert!(sender.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_without_message() {
        let (adapter, generator, sender) = adapter(FakeGenerator::replying("hi"));

        let reply = adapter.handle(&Method::POST, b"{}").await;

        assert_eq!(to_json(&reply), json!({"status": "not a message"}));
        assert!(generator.prompts.lock().await.is_empty());
        assert!(sender.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_non_text_message_gets_notice() {
        let (adapter, generator, sender) = adapter(FakeGenerator::replying("hi"));

        let reply = adapter
            .handle(&Method::POST, br#"{"message": {"chat": {"id": 42}}}"#)
            .await;

        assert_eq!(to_json(&reply), json!({"status": "non-text message"}));
        assert!(generator.prompts.lock().await.is_empty());
        assert_eq!(
            *sender.sent.lock().await,
            vec![(42, NON_TEXT_NOTICE.to_string())]
        );
    }

    #[tokio::test]
    async fn test_text_message_is_relayed() {
        let (adapter, generator, sender) = adapter(FakeGenerator::replying("hi there"));

        let reply = adapter
            .handle(
                &Method::POST,
                br#"{"message": {"chat": {"id": 7}, "text": "hello"}}"#,
            )
            .await;

        assert_eq!(reply, WebhookReply::success());
        assert_eq!(*generator.prompts.lock().await, vec!["hello".to_string()]);
        assert_eq!(*sender.sent.lock().await, vec![(7, "hi there".to_string())]);
    }

    #[tokio::test]
    async fn test_generation_failure_sends_apology() {
        let (adapter, _generator, sender) = adapter(FakeGenerator::failing("quota exceeded"));

        let reply = adapter
            .handle(
                &Method::POST,
                br#"{"message": {"chat": {"id": 7}, "text": "hello"}}"#,
            )
            .await;

        assert_eq!(to_json(&reply), json!({"status": "success"}));
        assert_eq!(
            *sender.sent.lock().await,
            vec![(
                7,
                "Sorry, I encountered an error: quota exceeded".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_null_message_is_reported() {
        let (adapter, generator, sender) = adapter(FakeGenerator::replying("hi"));

        let reply = adapter.handle(&Method::POST, br#"{"message": null}"#).await;

        assert!(matches!(reply, WebhookReply::Error { .. }), "{reply:?}");
        assert!(generator.prompts.lock().await.is_empty());
        assert!(sender.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_null_text_gets_apology() {
        let (adapter, generator, sender) = adapter(FakeGenerator::replying("hi"));

        let reply = adapter
            .handle(
                &Method::POST,
                br#"{"message": {"chat": {"id": 3}, "text": null}}"#,
            )
            .await;

        assert_eq!(to_json(&reply), json!({"status": "success"}));
        assert!(generator.prompts.lock().await.is_empty());
        assert_eq!(
            *sender.sent.lock().await,
            vec![(
                3,
                "Sorry, I encountered an error: message text is null".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_failed_signal_handler_never_resolves() {
        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            wait_for_signal("test", async {
                Err::<(), _>(std::io::Error::other("signal driver unavailable"))
            }),
        )
        .await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_signal_resolves_when_fired() {
        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            wait_for_signal("test", async { Ok::<(), std::io::Error>(()) }),
        )
        .await;
        assert!(waited.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_json_is_reported() {
        let (adapter, generator, sender) = adapter(FakeGenerator::replying("hi"));

        let reply = adapter.handle(&Method::POST, b"not json").await;

        match reply {
            WebhookReply::Error { error } => {
                assert!(error.contains("Failed to parse Telegram update"), "{error}")
            }
            other => panic!("expected error reply, got {other:?}"),
        }
        assert!(generator.prompts.lock().await.is_empty());
        assert!(sender.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_message_without_chat_is_reported() {
        let (adapter, _generator, sender) = adapter(FakeGenerator::replying("hi"));

        let reply = adapter
            .handle(&Method::POST, br#"{"message": {"text": "hello"}}"#)
            .await;

        assert!(matches!(reply, WebhookReply::Error { .. }));
        assert!(sender.sent.lock().await.is_empty());
    }

    async fn call(app: Router, method: &str, body: &'static str) -> (StatusCode, Value) {
        let req = Request::builder()
            .uri("/hook")
            .method(method)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_router_relays_post() {
        let (adapter, _generator, sender) = adapter(FakeGenerator::replying("hi there"));
        let app = router("/hook", Arc::new(adapter));

        let (status, json) = call(
            app,
            "POST",
            r#"{"update_id": 9, "message": {"chat": {"id": 7}, "text": "hello"}}"#,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, json!({"status": "success"}));
        assert_eq!(*sender.sent.lock().await, vec![(7, "hi there".to_string())]);
    }

    #[tokio::test]
    async fn test_router_rejects_get_with_json_error() {
        let (adapter, _generator, _sender) = adapter(FakeGenerator::replying("hi"));
        let app = router("/hook", Arc::new(adapter));

        let (status, json) = call(app, "GET", "").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, json!({"error": "Only POST requests are accepted"}));
    }
}
