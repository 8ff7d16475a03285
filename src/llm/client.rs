//! HTTP client for the correction model.
//!
//! Supports the Ollama generate API and OpenAI-compatible chat completions.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::config::{LlmConfig, LlmProvider};
use super::prompts::render_correction_prompt;
use super::{Correction, CorrectionRequest, Corrector, LlmError};
use crate::rate_limit::CollaboratorError;

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    top_p: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatContent,
}

#[derive(Debug, Deserialize)]
struct ChatContent {
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    name: String,
}

#[derive(Debug, Serialize)]
struct PullRequest<'a> {
    model: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelId>,
}

#[derive(Debug, Deserialize)]
struct ModelId {
    id: String,
}

/// Strip code fences and surrounding chatter, returning the outermost JSON object.
fn extract_json_object(response: &str) -> Option<&str> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    (end > start).then(|| &response[start..=end])
}

/// Parse the model's JSON answer.
pub fn parse_correction(response: &str) -> Result<Correction, LlmError> {
    let json = extract_json_object(response)
        .ok_or_else(|| LlmError::Parse("no JSON object in model output".to_string()))?;
    let value: Value = serde_json::from_str(json).map_err(|e| LlmError::Parse(e.to_string()))?;

    let corrected_text = value
        .get("corrected_text")
        .and_then(Value::as_str)
        .ok_or_else(|| LlmError::Parse("missing corrected_text".to_string()))?
        .to_string();
    let fields = match value.get("fields") {
        None | Some(Value::Null) => serde_json::Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            return Err(LlmError::Parse(format!(
                "fields is not an object: {}",
                other
            )))
        }
    };

    Ok(Correction {
        corrected_text,
        fields,
    })
}

pub struct LlmClient {
    config: LlmConfig,
    client: Client,
}

impl LlmClient {
    pub fn new(config: LlmConfig, timeout: Duration) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Connection(e.to_string()))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, LlmError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await.unwrap_or_default();
        Err(LlmError::Http {
            status,
            retry_after,
            body: body.chars().take(500).collect(),
        })
    }

    /// List models installed on the endpoint.
    pub async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        match self.config.provider {
            LlmProvider::Ollama => {
                let resp = self.client.get(self.url("/api/tags")).send().await?;
                let tags: TagsResponse = Self::check_status(resp)
                    .await?
                    .json()
                    .await
                    .map_err(|e| LlmError::Parse(e.to_string()))?;
                Ok(tags.models.into_iter().map(|m| m.name).collect())
            }
            LlmProvider::OpenAI => {
                let resp = self
                    .authorize(self.client.get(self.url("/v1/models")))
                    .send()
                    .await?;
                let list: ModelList = Self::check_status(resp)
                    .await?
                    .json()
                    .await
                    .map_err(|e| LlmError::Parse(e.to_string()))?;
                Ok(list.data.into_iter().map(|m| m.id).collect())
            }
        }
    }

    /// Whether the configured model is installed.
    pub async fn has_model(&self) -> Result<bool, LlmError> {
        let models = self.list_models().await?;
        let wanted = &self.config.model;
        Ok(models
            .iter()
            .any(|m| m == wanted || m.strip_suffix(":latest") == Some(wanted.as_str())))
    }

    /// Ask an Ollama endpoint to download the configured model. Blocks until
    /// the pull finishes, so build the client with a generous timeout.
    pub async fn pull_model(&self) -> Result<(), LlmError> {
        if self.config.provider != LlmProvider::Ollama {
            return Err(LlmError::Unsupported(
                "model pulls are only supported by Ollama endpoints",
            ));
        }
        let request = PullRequest {
            model: &self.config.model,
            stream: false,
        };
        debug!("Pulling {} from {}", self.config.model, self.config.endpoint);
        let resp = self
            .client
            .post(self.url("/api/pull"))
            .json(&request)
            .send()
            .await?;
        let body: PullResponse = Self::check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;
        if body.status != "success" {
            return Err(LlmError::Parse(format!("pull ended with status {:?}", body.status)));
        }
        Ok(())
    }

    /// Send a prompt and return the raw completion text.
    pub async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        match self.config.provider {
            LlmProvider::Ollama => self.call_ollama(prompt).await,
            LlmProvider::OpenAI => self.call_openai(prompt).await,
        }
    }

    async fn call_ollama(&self, prompt: &str) -> Result<String, LlmError> {
        let request = OllamaRequest {
            model: &self.config.model,
            prompt,
            stream: false,
            options: OllamaOptions {
                temperature: self.config.temperature,
                top_p: self.config.top_p,
                num_predict: self.config.max_tokens,
            },
        };
        let resp = self
            .client
            .post(self.url("/api/generate"))
            .json(&request)
            .send()
            .await?;
        let body: OllamaResponse = Self::check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;
        Ok(body.response)
    }

    async fn call_openai(&self, prompt: &str) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            max_tokens: self.config.max_tokens,
        };
        let resp = self
            .authorize(self.client.post(self.url("/v1/chat/completions")))
            .json(&request)
            .send()
            .await?;
        let body: ChatResponse = Self::check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::Parse("no choices in response".to_string()))
    }
}

#[async_trait]
impl Corrector for LlmClient {
    fn model(&self) -> &str {
        &self.config.model
    }

    async fn correct(&self, request: &CorrectionRequest<'_>) -> Result<Correction, CollaboratorError> {
        let prompt = render_correction_prompt(
            self.config.get_correction_prompt(),
            request.document_id,
            request.chunk_index,
            request.chunk_count,
            request.fields,
            request.text,
        );
        debug!(
            "Correcting {} part {}/{} ({} chars)",
            request.document_id,
            request.chunk_index + 1,
            request.chunk_count,
            request.text.len()
        );
        let response = self.generate(&prompt).await?;
        Ok(parse_correction(&response)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let c = parse_correction(r#"{"corrected_text": "Hello", "fields": {"title": "Memo"}}"#).unwrap();
        assert_eq!(c.corrected_text, "Hello");
        assert_eq!(c.fields["title"], "Memo");
    }

    #[test]
    fn test_parse_fenced_json_with_chatter() {
        let raw = "Sure! Here it is:\n```json\n{\"corrected_text\": \"A {b} c\"}\n```\nDone.";
        let c = parse_correction(raw).unwrap();
        assert_eq!(c.corrected_text, "A {b} c");
        assert!(c.fields.is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed_output() {
        assert!(matches!(parse_correction("Corrected text: hi"), Err(LlmError::Parse(_))));
        assert!(matches!(
            parse_correction(r#"{"text": "wrong key"}"#),
            Err(LlmError::Parse(_))
        ));
        assert!(matches!(
            parse_correction(r#"{"corrected_text": "x", "fields": ["a"]}"#),
            Err(LlmError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_failure_is_permanent() {
        let err: CollaboratorError = LlmError::Parse("bad".into()).into();
        assert!(matches!(err, CollaboratorError::Permanent(_)));
    }

    #[test]
    fn test_client_builds() {
        let client = LlmClient::new(
            LlmConfig::default().with_endpoint("http://127.0.0.1:9/"),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(client.url("/api/tags"), "http://127.0.0.1:9/api/tags");
        assert_eq!(client.model(), "deepseek-coder:7b-instruct");
    }

    #[test]
    fn test_pull_request_waits_for_completion() {
        let body = serde_json::to_value(PullRequest {
            model: "deepseek-coder:6.7b",
            stream: false,
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({"model": "deepseek-coder:6.7b", "stream": false})
        );
    }

    #[tokio::test]
    async fn test_pull_needs_ollama() {
        let config = LlmConfig {
            provider: LlmProvider::OpenAI,
            ..LlmConfig::default().with_endpoint("http://127.0.0.1:9")
        };
        let client = LlmClient::new(config, Duration::from_secs(1)).unwrap();
        let err = client.pull_model().await.unwrap_err();
        assert!(matches!(err, LlmError::Unsupported(_)));
    }
}
