use crate::config::ClientConfig;
use crate::events::{AppEvent, EventBus};
use crate::models::{AiModel, Category, Chat, Message};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    // Non-2xx response; `body` is the parsed JSON error body, or the raw text
    #[error("{message}")]
    Http { message: String, status: u16, body: Value },
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Network unreachable: {0}")]
    Network(String),
    #[error("Request failed: {0}")]
    Other(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Server errors and transport failures are retried; client errors and
    /// timeouts are not.
    pub fn should_retry(&self) -> bool {
        match self {
            ApiError::Timeout(_) => false,
            ApiError::Http { status, .. } => *status >= 500,
            ApiError::Network(_) | ApiError::Other(_) => true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RequestOptions {
    pub method: Method,
    pub body: Option<Value>,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn get() -> Self {
        Self {
            method: Method::GET,
            body: None,
            timeout: None,
        }
    }

    pub fn post(body: Value) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            timeout: None,
        }
    }

    pub fn delete() -> Self {
        Self {
            method: Method::DELETE,
            body: None,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// One prior turn of the conversation as the backend expects it
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HistoryTurn {
    pub role: String, // "user" or "model"
    pub content: String,
}

impl HistoryTurn {
    pub fn from_message(message: &Message) -> Self {
        Self {
            role: if message.is_user { "user" } else { "model" }.to_string(),
            content: message.text.clone(),
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct SendMessageRequest {
    #[serde(rename = "chatId")]
    pub chat_id: String,
    #[serde(rename = "aiModelId")]
    pub ai_model_id: i64,
    pub chat_message: String,
    pub history: Vec<HistoryTurn>,
}

#[derive(Deserialize, Debug)]
struct SendMessageResponse {
    response: String,
}

// Anything that can answer a chat message. ChatManager only talks to this.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn send_message(&self, request: &SendMessageRequest) -> Result<String, ApiError>;
}

/// HTTP client for the chat backend: per-request timeout, fixed-interval retry,
/// typed errors.
pub struct ApiManager {
    client: Client,
    base_url: String,
    timeout: Duration,
    retry_attempts: u32,
    retry_delay: Duration,
    token: Option<String>,
    bus: Option<Arc<EventBus>>,
}

impl ApiManager {
    pub fn new(config: &ClientConfig, token: Option<String>, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.request_timeout(),
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: config.retry_delay(),
            token,
            bus,
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    /// Single attempt. A 2xx body is returned as JSON (`Null` when empty).
    pub async fn request(&self, path: &str, options: &RequestOptions) -> Result<Value, ApiError> {
        let url = self.url(path);
        let timeout = options.timeout.unwrap_or(self.timeout);
        log::debug!("{} {}", options.method, url);

        let mut builder = self.client.request(options.method.clone(), &url).timeout(timeout);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &options.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| classify(e, timeout))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| classify(e, timeout))?;

        if !status.is_success() {
            let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
            log::error!("{} {} failed with status {}: {}", options.method, url, status, body);
            return Err(ApiError::Http {
                message: error_message(status, &body),
                status: status.as_u16(),
                body,
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ApiError::Other(format!("Invalid JSON from {}: {}", url, e)))
    }

    /// Retries retryable failures with a fixed delay, `attempts` tries in total.
    pub async fn request_with_retry(
        &self,
        path: &str,
        options: &RequestOptions,
        attempts: u32,
    ) -> Result<Value, ApiError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.request(path, options).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts && e.should_retry() => {
                    log::warn!(
                        "Request to {} failed (attempt {}/{}): {}; retrying in {:?}",
                        path,
                        attempt,
                        attempts,
                        e,
                        self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, path: &str, options: &RequestOptions) -> Result<T, ApiError> {
        let value = self.request_with_retry(path, options, self.retry_attempts).await?;
        serde_json::from_value(unwrap_envelope(value))
            .map_err(|e| ApiError::Other(format!("Unexpected response shape from {}: {}", path, e)))
    }

    pub async fn get_ai_models(&self) -> Result<Vec<AiModel>, ApiError> {
        self.fetch("/api/ai-models", &RequestOptions::get()).await
    }

    pub async fn get_ai_categories(&self) -> Result<Vec<Category>, ApiError> {
        self.fetch("/api/ai-categories", &RequestOptions::get()).await
    }

    pub async fn get_chat_history(&self, chat_id: &str) -> Result<Vec<Message>, ApiError> {
        let path = format!("/api/chat/{}/history", chat_id);
        let value = self.request_with_retry(&path, &RequestOptions::get(), self.retry_attempts).await?;
        let value = match unwrap_envelope(value) {
            Value::Object(mut map) if map.contains_key("messages") => map.remove("messages").unwrap_or_default(),
            other => other,
        };
        serde_json::from_value(value)
            .map_err(|e| ApiError::Other(format!("Unexpected response shape from {}: {}", path, e)))
    }

    pub async fn save_chat(&self, chat: &Chat) -> Result<Value, ApiError> {
        let body = serde_json::to_value(chat).map_err(|e| ApiError::Other(e.to_string()))?;
        self.request_with_retry("/api/chat/save", &RequestOptions::post(body), self.retry_attempts)
            .await
    }

    pub async fn delete_chat(&self, chat_id: &str) -> Result<Value, ApiError> {
        let path = format!("/api/chat/{}", chat_id);
        self.request_with_retry(&path, &RequestOptions::delete(), self.retry_attempts)
            .await
    }

    fn emit(&self, event: AppEvent) {
        if let Some(bus) = &self.bus {
            bus.emit(event);
        }
    }
}

#[async_trait]
impl ChatBackend for ApiManager {
    async fn send_message(&self, request: &SendMessageRequest) -> Result<String, ApiError> {
        log::info!(
            "Sending message for chat {} using model {} ({} history turns)",
            request.chat_id,
            request.ai_model_id,
            request.history.len()
        );
        self.emit(AppEvent::ApiSending {
            chat_id: request.chat_id.clone(),
            ai_model_id: request.ai_model_id,
        });

        let body = serde_json::to_value(request).map_err(|e| ApiError::Other(e.to_string()))?;
        let result = self
            .request_with_retry("/api/send_message", &RequestOptions::post(body), self.retry_attempts)
            .await
            .and_then(|value| {
                serde_json::from_value::<SendMessageResponse>(value)
                    .map(|r| r.response)
                    .map_err(|e| ApiError::Other(format!("Missing 'response' in reply: {}", e)))
            });

        match &result {
            Ok(_) => self.emit(AppEvent::ApiResponded {
                chat_id: request.chat_id.clone(),
            }),
            Err(e) => self.emit(AppEvent::ApiFailed {
                chat_id: request.chat_id.clone(),
                error: e.to_string(),
            }),
        }
        result
    }
}

fn classify(error: reqwest::Error, timeout: Duration) -> ApiError {
    if error.is_timeout() {
        ApiError::Timeout(timeout)
    } else if error.is_connect() {
        ApiError::Network(error.to_string())
    } else {
        ApiError::Other(error.to_string())
    }
}

fn error_message(status: StatusCode, body: &Value) -> String {
    let detail = ["error", "message", "detail"]
        .iter()
        .find_map(|k| body.get(k).and_then(Value::as_str))
        .or_else(|| body.as_str().filter(|s| !s.is_empty()));
    match detail {
        Some(detail) => format!("HTTP {}: {}", status.as_u16(), detail),
        None => format!("HTTP {}", status.as_u16()),
    }
}

// Accepts both bare payloads and `{ success, data }` envelopes
fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("data") => map.remove("data").unwrap_or_default(),
        other => other,
    }
}
