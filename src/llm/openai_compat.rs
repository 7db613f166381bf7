//! OpenAI-compatible HTTP adapter (OpenAI, Ollama, LM Studio, vLLM, ...).
//!
//! Implements both [`LlmProvider`] and [`EmbeddingProvider`] against
//! `{base_url}/v1/chat/completions` and `{base_url}/v1/embeddings`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode, header};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::helpers::{optional_env, parse_secs_env};
use crate::error::{ConfigError, LlmError};
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, EmbeddingProvider, FinishReason,
    LlmProvider,
};

/// Connection settings for one endpoint.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Label used in logs and errors (`standard`, `router`, ...).
    pub name: String,
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub request_timeout: Duration,
}

impl ProviderConfig {
    /// Read `{PREFIX}_BASE_URL`, `{PREFIX}_API_KEY`, `{PREFIX}_MODEL` and
    /// `{PREFIX}_TIMEOUT_SECS`. Returns `None` when no model is configured.
    pub fn from_env(prefix: &str) -> Result<Option<Self>, ConfigError> {
        let Some(model) = optional_env(&format!("{prefix}_MODEL"))? else {
            return Ok(None);
        };
        let base_url = optional_env(&format!("{prefix}_BASE_URL"))?
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let api_key = optional_env(&format!("{prefix}_API_KEY"))?.map(SecretString::from);
        let request_timeout =
            parse_secs_env(&format!("{prefix}_TIMEOUT_SECS"), Duration::from_secs(120))?;

        Ok(Some(Self {
            name: prefix.to_lowercase(),
            base_url,
            api_key,
            model,
            request_timeout,
        }))
    }
}

/// OpenAI-compatible chat + embedding client.
pub struct OpenAiCompatProvider {
    config: ProviderConfig,
    http: HttpClient,
}

impl OpenAiCompatProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, LlmError> {
        let http = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: config.name.clone(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        tracing::info!(provider = %config.name, model = %config.model, "LLM provider configured");
        Ok(Self { config, http })
    }

    fn endpoint(&self, path: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let base = base.strip_suffix("/v1").unwrap_or(base);
        format!("{base}/v1/{path}")
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, LlmError> {
        let provider = &self.config.name;
        let mut request = self
            .http
            .post(self.endpoint(path))
            .header(header::CONTENT_TYPE, "application/json")
            .json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout {
                    provider: provider.clone(),
                    timeout: self.config.request_timeout,
                }
            } else {
                LlmError::RequestFailed {
                    provider: provider.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(provider, status, retry_after, &body));
        }

        let text = response.text().await.map_err(|e| LlmError::InvalidResponse {
            provider: provider.clone(),
            reason: format!("Failed to read body: {e}"),
        })?;
        serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse {
            provider: provider.clone(),
            reason: format!("Failed to parse body: {e}"),
        })
    }
}

fn retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn map_status(provider: &str, status: StatusCode, retry_after: Option<Duration>, body: &str) -> LlmError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::AuthFailed {
            provider: provider.to_string(),
        },
        status => LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: format!("HTTP {status}: {}", api_error_message(body)),
        },
    }
}

fn api_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
}

#[derive(Deserialize)]
struct ChatResponseBody {
    id: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Serialize)]
struct EmbeddingBody<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponseBody {
    #[serde(default)]
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

fn into_completion(provider: &str, body: ChatResponseBody) -> Result<CompletionResponse, LlmError> {
    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: "response contained no choices".to_string(),
        })?;
    let usage = body.usage.unwrap_or(Usage {
        prompt_tokens: 0,
        completion_tokens: 0,
    });
    Ok(CompletionResponse {
        content: choice.message.content.unwrap_or_default(),
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        finish_reason: FinishReason::from_api(choice.finish_reason.as_deref()),
        response_id: body.id,
    })
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = ChatBody {
            model: &self.config.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
            frequency_penalty: request.frequency_penalty,
            presence_penalty: request.presence_penalty,
            stop: &request.stop,
        };
        let response: ChatResponseBody = self.post("chat/completions", &body).await?;
        let completion = into_completion(&self.config.name, response)?;
        debug!(
            provider = %self.config.name,
            input_tokens = completion.input_tokens,
            output_tokens = completion.output_tokens,
            "Completion received"
        );
        Ok(completion)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatProvider {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let body = EmbeddingBody {
            model: &self.config.model,
            input: text,
        };
        let response: EmbeddingResponseBody = self.post("embeddings", &body).await?;
        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: self.config.name.clone(),
                reason: "response contained no embedding".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(base_url: &str) -> OpenAiCompatProvider {
        OpenAiCompatProvider::new(ProviderConfig {
            name: "standard".into(),
            base_url: base_url.into(),
            api_key: Some(SecretString::from("sk-test")),
            model: "gpt-4o-mini".into(),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn endpoint_tolerates_trailing_slash_and_v1() {
        assert_eq!(
            provider("http://localhost:11434/").endpoint("chat/completions"),
            "http://localhost:11434/v1/chat/completions"
        );
        assert_eq!(
            provider("https://api.example.com/v1").endpoint("embeddings"),
            "https://api.example.com/v1/embeddings"
        );
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            map_status("p", StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3)), ""),
            LlmError::RateLimited { retry_after: Some(d), .. } if d == Duration::from_secs(3)
        ));
        assert!(matches!(
            map_status("p", StatusCode::FORBIDDEN, None, ""),
            LlmError::AuthFailed { .. }
        ));
        let err = map_status(
            "p",
            StatusCode::BAD_REQUEST,
            None,
            r#"{"error":{"message":"bad model"}}"#,
        );
        assert!(err.to_string().contains("bad model"));
    }

    #[test]
    fn chat_body_omits_unset_fields() {
        let messages = vec![ChatMessage::user("hi")];
        let body = ChatBody {
            model: "m",
            messages: &messages,
            temperature: Some(0.5),
            max_tokens: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop: &[],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["temperature"], 0.5);
        assert!(json.get("max_tokens").is_none());
        assert!(json.get("stop").is_none());
    }

    #[test]
    fn completion_parsing() {
        let raw = r#"{"id":"r1","choices":[{"message":{"content":"ENHANCED"},"finish_reason":"stop"}],"usage":{"prompt_tokens":12,"completion_tokens":1}}"#;
        let body: ChatResponseBody = serde_json::from_str(raw).unwrap();
        let completion = into_completion("router", body).unwrap();
        assert_eq!(completion.content, "ENHANCED");
        assert_eq!(completion.input_tokens, 12);
        assert_eq!(completion.finish_reason, FinishReason::Stop);
        assert_eq!(completion.response_id.as_deref(), Some("r1"));

        let empty: ChatResponseBody = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(matches!(
            into_completion("router", empty),
            Err(LlmError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn provider_config_requires_model() {
        let _guard = crate::config::helpers::ENV_MUTEX.lock().unwrap();
        unsafe {
            std::env::remove_var("TESTPROV_MODEL");
            std::env::set_var("TESTPROV_BASE_URL", "http://localhost:8080");
        }
        assert!(ProviderConfig::from_env("TESTPROV").unwrap().is_none());
        unsafe {
            std::env::set_var("TESTPROV_MODEL", "qwen2.5");
        }
        let config = ProviderConfig::from_env("TESTPROV").unwrap().unwrap();
        unsafe {
            std::env::remove_var("TESTPROV_MODEL");
            std::env::remove_var("TESTPROV_BASE_URL");
        }
        assert_eq!(config.name, "testprov");
        assert_eq!(config.base_url, "http://localhost:8080");
        assert!(config.api_key.is_none());
    }
}
