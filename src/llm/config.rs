//! LLM client configuration.

use serde::{Deserialize, Serialize};

use super::prompts::DEFAULT_CORRECTION_PROMPT;

/// LLM provider type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// Ollama API (local, default)
    #[default]
    Ollama,
    /// OpenAI-compatible API (OpenAI, Groq, Together.ai, etc.)
    OpenAI,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ollama" => Some(Self::Ollama),
            "openai" | "groq" | "together" => Some(Self::OpenAI),
            _ => None,
        }
    }

    pub fn default_endpoint(&self) -> &'static str {
        match self {
            Self::Ollama => "http://localhost:11434",
            Self::OpenAI => "https://api.openai.com",
        }
    }
}

/// Configuration for the correction model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    /// API endpoint (provider-specific defaults apply)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// API key for OpenAI-compatible providers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    /// Maximum tokens in response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Custom correction prompt (uses {document}, {part}, {fields} and {text})
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction_prompt: Option<String>,
}

fn default_endpoint() -> String {
    LlmProvider::Ollama.default_endpoint().to_string()
}

fn default_model() -> String {
    "deepseek-coder:7b-instruct".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.1
}

fn default_top_p() -> f32 {
    0.9
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            endpoint: default_endpoint(),
            api_key: None,
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            correction_prompt: None,
        }
    }
}

impl LlmConfig {
    /// Apply environment variable overrides.
    ///
    /// Supported env vars:
    /// - `LLM_PROVIDER`: "ollama" (default), "openai", "groq" or "together"
    /// - `LLM_ENDPOINT`: API endpoint (defaults based on provider)
    /// - `LLM_API_KEY`: API key for OpenAI-compatible providers
    /// - `LLM_MODEL`: model name
    /// - `LLM_MAX_TOKENS`, `LLM_TEMPERATURE`
    pub fn with_env_overrides(mut self) -> Self {
        let explicit_endpoint = std::env::var("LLM_ENDPOINT").ok();

        if let Some(provider) = std::env::var("LLM_PROVIDER")
            .ok()
            .and_then(|v| LlmProvider::from_str(&v))
        {
            if provider != self.provider && explicit_endpoint.is_none() {
                self.endpoint = provider.default_endpoint().to_string();
            }
            self.provider = provider;
        }
        if let Some(endpoint) = explicit_endpoint {
            self.endpoint = endpoint;
        }
        if let Ok(val) = std::env::var("LLM_API_KEY") {
            self.api_key = Some(val);
        } else if self.api_key.is_none() && self.provider == LlmProvider::OpenAI {
            self.api_key = std::env::var("OPENAI_API_KEY").ok();
        }
        if let Ok(val) = std::env::var("LLM_MODEL") {
            self.model = val;
        }
        if let Some(n) = std::env::var("LLM_MAX_TOKENS").ok().and_then(|v| v.parse().ok()) {
            self.max_tokens = n;
        }
        if let Some(t) = std::env::var("LLM_TEMPERATURE").ok().and_then(|v| v.parse().ok()) {
            self.temperature = t;
        }
        self
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn get_correction_prompt(&self) -> &str {
        self.correction_prompt
            .as_deref()
            .unwrap_or(DEFAULT_CORRECTION_PROMPT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LlmConfig::default();
        assert_eq!(config.provider, LlmProvider::Ollama);
        assert_eq!(config.endpoint, "http://localhost:11434");
        assert!((config.temperature - 0.1).abs() < f32::EPSILON);
        assert!(config.get_correction_prompt().contains("{text}"));
    }

    #[test]
    fn test_provider_aliases() {
        assert_eq!(LlmProvider::from_str("Groq"), Some(LlmProvider::OpenAI));
        assert_eq!(LlmProvider::from_str("ollama"), Some(LlmProvider::Ollama));
        assert_eq!(LlmProvider::from_str("bard"), None);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: LlmConfig = toml::from_str("model = \"llama3\"\nprovider = \"openai\"").unwrap();
        assert_eq!(config.model, "llama3");
        assert_eq!(config.provider, LlmProvider::OpenAI);
        assert_eq!(config.max_tokens, 4096);
    }
}
