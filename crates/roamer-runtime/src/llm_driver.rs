//! [`LlmDriver`] – OpenAI-compatible chat-completions client.
//!
//! Talks to any server exposing `POST {base_url}/chat/completions`: OpenAI,
//! Together, or a self-hosted endpoint. User messages may carry an inline
//! camera frame as a base64 `data:` URL when the model accepts images.
//!
//! The loop only depends on the [`ChatModel`] trait, so tests swap in a
//! scripted model and never touch the network.
//!
//! # Example
//!
//! ```rust,no_run
//! use roamer_runtime::llm_driver::{ChatMessage, ChatModel, LlmDriver};
//! use roamer_runtime::settings::{ApiKey, ModelProvider};
//!
//! # async fn demo() -> Result<(), roamer_runtime::llm_driver::LlmError> {
//! let driver = LlmDriver::new(ModelProvider::OpenAi, "gpt-4o", ApiKey::new("sk-..."));
//! let reply = driver
//!     .complete(&[
//!         ChatMessage::system("You are a small robot."),
//!         ChatMessage::user("What is the next command?"),
//!     ])
//!     .await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use roamer_hal::CameraFrame;
use roamer_types::RoamerError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::settings::{ApiKey, ModelProvider, ValidatedSettings};

/// Reply length cap for one command string.
pub const MAX_TOKENS: u32 = 150;

pub const TEMPERATURE: f32 = 0.6;

/// Upper bound on one whole model exchange, connect through body read.
pub const MODEL_TIMEOUT: Duration = Duration::from_secs(30);

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from LLM driver operations.
#[derive(Error, Debug)]
pub enum LlmError {
    /// The HTTP request to the model server failed or timed out.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The response from the model server could not be parsed.
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
}

impl From<LlmError> for RoamerError {
    fn from(e: LlmError) -> Self {
        RoamerError::transport("model_call", e)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message types (OpenAI-compatible)
// ─────────────────────────────────────────────────────────────────────────────

/// The role of a participant in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Message body: plain text, or a list of text / image parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    /// User turn with text followed by an inline image.
    pub fn user_with_image(text: impl Into<String>, frame: &CameraFrame) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: text.into() },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: data_url(frame),
                        detail: Some("auto".to_string()),
                    },
                },
            ]),
        }
    }

    /// The text portion of the message, images dropped.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn has_image(&self) -> bool {
        matches!(&self.content, MessageContent::Parts(parts)
            if parts.iter().any(|p| matches!(p, ContentPart::ImageUrl { .. })))
    }
}

/// `data:<mime>;base64,<bytes>` for an encoded frame.
pub fn data_url(frame: &CameraFrame) -> String {
    format!(
        "data:{};base64,{}",
        frame.encoding.mime_type(),
        STANDARD.encode(&frame.data)
    )
}

/// Heuristic used to decide whether to attach camera frames.
pub fn model_supports_images(model: &str) -> bool {
    let model = model.to_ascii_lowercase();
    ["gpt-4", "vision", "4o"].iter().any(|tag| model.contains(tag))
}

// ─────────────────────────────────────────────────────────────────────────────
// ChatModel seam
// ─────────────────────────────────────────────────────────────────────────────

/// Anything that can answer a chat transcript.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    fn supports_images(&self) -> bool {
        model_supports_images(self.model_name())
    }

    /// Return the assistant's reply text. An empty string means the model
    /// answered with nothing.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal request / response shapes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// LlmDriver
// ─────────────────────────────────────────────────────────────────────────────

/// An async client for an OpenAI-compatible chat-completions endpoint.
///
/// Construct once per session and reuse across iterations.
pub struct LlmDriver {
    base_url: String,
    model: String,
    api_key: ApiKey,
    timeout: Duration,
    client: reqwest::Client,
}

impl LlmDriver {
    pub fn new(provider: ModelProvider, model: impl Into<String>, api_key: ApiKey) -> Self {
        Self {
            base_url: provider.base_url().to_string(),
            model: model.into(),
            api_key,
            timeout: MODEL_TIMEOUT,
            client: timed_client(MODEL_TIMEOUT),
        }
    }

    /// Replace the per-request deadline. A stalled server then surfaces as
    /// [`LlmError::Http`] with `is_timeout()` set.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.client = timed_client(timeout);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn from_settings(settings: &ValidatedSettings) -> Self {
        Self::new(
            settings.provider.clone(),
            settings.model.clone(),
            settings.api_key.clone(),
        )
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

fn timed_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "model client builder failed; using defaults");
            reqwest::Client::new()
        })
}

#[async_trait]
impl ChatModel for LlmDriver {
    fn model_name(&self) -> &str {
        &self.model
    }

    /// Send `messages` and return the first choice's text.
    ///
    /// A response with no choices, or a `null` content, yields an empty
    /// string rather than an error.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Http`] if the request fails or the server answers
    /// with an error status or misses [`LlmDriver::timeout`], or
    /// [`LlmError::BadResponse`] if the body is not a chat-completions
    /// response.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
            stream: false,
        };

        let raw = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.api_key.expose())
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let response: ChatResponse =
            serde_json::from_str(&raw).map_err(|e| LlmError::BadResponse(e.to_string()))?;

        Ok(response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn chat_message_serializes_role() {
        let json = serde_json::to_string(&ChatMessage::system("hello")).unwrap();
        assert_eq!(json, r#"{"role":"system","content":"hello"}"#);
    }

    #[test]
    fn image_message_uses_parts_and_data_url() {
        let frame = CameraFrame::jpeg(vec![0xFF, 0xD8, 0xFF, 0xD9]);
        let msg = ChatMessage::user_with_image("Current view is attached.", &frame);
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][1]["type"], "image_url");
        assert_eq!(json["content"][1]["image_url"]["url"], "data:image/jpeg;base64,/9j/2Q==");
        assert_eq!(json["content"][1]["image_url"]["detail"], "auto");
        assert!(msg.has_image());
        assert_eq!(msg.text(), "Current view is attached.");
    }

    #[test]
    fn chat_message_roundtrip() {
        let msg = ChatMessage::assistant("CMD_MOVE_HEAD(0.5)");
        let json = serde_json::to_string(&msg).unwrap();
        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn vision_heuristic() {
        for model in ["gpt-4o", "gpt-4-turbo", "llava-vision", "GPT-4O-mini"] {
            assert!(model_supports_images(model), "{model}");
        }
        for model in ["gpt-3.5-turbo", "llama3", "mixtral-8x7b"] {
            assert!(!model_supports_images(model), "{model}");
        }
    }

    #[test]
    fn llm_error_becomes_transport_error() {
        let err: RoamerError = LlmError::BadResponse("no json".into()).into();
        assert!(matches!(
            err,
            RoamerError::Transport { ref operation, .. } if operation == "model_call"
        ));
        assert!(!err.is_fatal());
    }

    /// Serve exactly one HTTP exchange and hand back the raw request.
    async fn serve_once(
        status: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= split + 4 + length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\n\
                 content-type: application/json\r\n\
                 content-length: {}\r\n\
                 connection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    #[tokio::test]
    async fn complete_posts_bearer_request_and_reads_first_choice() {
        let (base, server) = serve_once(
            "200 OK",
            r#"{"choices":[{"message":{"role":"assistant","content":"CMD_SAY_TEXT(hi)"}}]}"#,
        )
        .await;
        let driver = LlmDriver::new(ModelProvider::Custom(base), "gpt-4o", ApiKey::new("sk-test"));

        let reply = driver.complete(&[ChatMessage::user("next?")]).await.unwrap();
        assert_eq!(reply, "CMD_SAY_TEXT(hi)");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /chat/completions"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer sk-test"));
        assert!(request.contains(r#""max_tokens":150"#));
        assert!(request.contains(r#""temperature":0.6"#));
    }

    #[tokio::test]
    async fn empty_choices_yield_empty_reply() {
        let (base, _server) = serve_once("200 OK", r#"{"choices":[]}"#).await;
        let driver = LlmDriver::new(ModelProvider::Custom(base), "llama3", ApiKey::new("k"));
        assert_eq!(driver.complete(&[]).await.unwrap(), "");
    }

    #[tokio::test]
    async fn error_status_is_http_error() {
        let (base, _server) = serve_once("500 Internal Server Error", "{}").await;
        let driver = LlmDriver::new(ModelProvider::Custom(base), "llama3", ApiKey::new("k"));
        assert!(matches!(driver.complete(&[]).await, Err(LlmError::Http(_))));
    }

    #[tokio::test]
    async fn non_json_body_is_bad_response() {
        let (base, _server) = serve_once("200 OK", "not json").await;
        let driver = LlmDriver::new(ModelProvider::Custom(base), "llama3", ApiKey::new("k"));
        assert!(matches!(driver.complete(&[]).await, Err(LlmError::BadResponse(_))));
    }

    #[test]
    fn default_timeout_is_bounded() {
        let driver = LlmDriver::new(ModelProvider::OpenAi, "gpt-4o", ApiKey::new("k"));
        assert_eq!(driver.timeout(), MODEL_TIMEOUT);
    }

    #[tokio::test]
    async fn silent_server_times_out_as_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            // Hold the connection open without answering.
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });
        let driver = LlmDriver::new(
            ModelProvider::Custom(format!("http://{addr}")),
            "llama3",
            ApiKey::new("k"),
        )
        .with_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let err = driver.complete(&[ChatMessage::user("next?")]).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(&err, LlmError::Http(e) if e.is_timeout()), "{err}");
        let err: RoamerError = err.into();
        assert!(matches!(err, RoamerError::Transport { .. }));
        server.abort();
    }
}
