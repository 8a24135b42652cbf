use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::warn;

const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage { role: "assistant".to_string(), content: content.into() }
    }
}

/// The single dynamic boundary into the core: messages in, text out. The
/// session loop only ever sees this trait, so tests drive it with a script.
#[async_trait]
pub trait Brain: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

/// OpenAI-compatible chat completion client with bounded retry. Rate-limit
/// rejections back off harder than ordinary hiccups.
pub struct AIProviderClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AIProviderClient {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        AIProviderClient {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn request_once(&self, messages: &[ChatMessage]) -> Result<String> {
        let request_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
            .collect();

        let body = serde_json::json!({
            "model": self.model,
            "messages": request_messages,
            "max_tokens": 1024,
            "temperature": 0.8,
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!(ApiError { status: status.as_u16(), body: text }));
        }

        let json: serde_json::Value = response.json().await?;
        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow!("Malformed completion response"))?
            .to_string();
        Ok(content)
    }
}

#[derive(Debug)]
struct ApiError {
    status: u16,
    body: String,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "API error {}: {}", self.status, self.body)
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    RateLimited,
    Transient,
    Terminal,
}

fn classify(err: &anyhow::Error) -> Retry {
    if let Some(api) = err.downcast_ref::<ApiError>() {
        return match api.status {
            429 => Retry::RateLimited,
            500..=599 => Retry::Transient,
            _ => Retry::Terminal,
        };
    }
    // connection resets, timeouts, DNS blips
    Retry::Transient
}

fn backoff(kind: Retry, attempt: u32) -> Duration {
    match kind {
        Retry::RateLimited => Duration::from_secs(attempt as u64 * 5),
        _ => Duration::from_secs(2),
    }
}

#[async_trait]
impl Brain for AIProviderClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let mut last_err = None;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.request_once(messages).await {
                Ok(text) => return Ok(text),
                Err(err) => {
                    let kind = classify(&err);
                    if kind == Retry::Terminal {
                        return Err(err);
                    }
                    warn!(attempt, error = %err, "model call failed, retrying");
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(backoff(kind, attempt)).await;
                    }
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("model call failed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        assert_eq!(ChatMessage::system("s").role, "system");
        assert_eq!(ChatMessage::user("u").role, "user");
        assert_eq!(ChatMessage::assistant("a").role, "assistant");
    }

    #[test]
    fn test_retry_classification() {
        let rate = anyhow!(ApiError { status: 429, body: String::new() });
        let server = anyhow!(ApiError { status: 503, body: String::new() });
        let auth = anyhow!(ApiError { status: 401, body: String::new() });
        let network = anyhow!("connection reset by peer");

        assert_eq!(classify(&rate), Retry::RateLimited);
        assert_eq!(classify(&server), Retry::Transient);
        assert_eq!(classify(&auth), Retry::Terminal);
        assert_eq!(classify(&network), Retry::Transient);
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff(Retry::RateLimited, 1), Duration::from_secs(5));
        assert_eq!(backoff(Retry::RateLimited, 2), Duration::from_secs(10));
        assert_eq!(backoff(Retry::Transient, 2), Duration::from_secs(2));
    }
}
