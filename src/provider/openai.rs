use super::{
    parse_translations, send_with_retry, Pricing, Prompt, ProviderError, ProviderResponse,
    ProviderSettings, TranslationProvider,
};
use crate::model::TranslationBatch;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

const PROVIDER: &str = "openai";
const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const REASONING_MAX_TOKENS: u32 = 16000;
const DEFAULT_TEMPERATURE: f32 = 0.3;

/// OpenAI Chat Completion request
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_completion_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Reasoning models reject `temperature` and need a larger token budget
fn is_reasoning_model(model: &str) -> bool {
    model.starts_with("gpt-5")
        || model.starts_with("o1")
        || model.starts_with("o3")
        || model.starts_with("o4")
}

fn pricing_for(model: &str) -> Pricing {
    let (input_per_1k, output_per_1k) = if model.starts_with("gpt-4o-mini") {
        (0.00015, 0.0006)
    } else if model.starts_with("gpt-4o") {
        (0.0025, 0.01)
    } else if model.starts_with("gpt-4.1-mini") {
        (0.0004, 0.0016)
    } else {
        (0.01, 0.01)
    };
    Pricing {
        input_per_1k,
        output_per_1k,
    }
}

pub struct OpenAiProvider {
    client: reqwest::Client,
    settings: ProviderSettings,
    api_key: String,
    retry: RetryPolicy,
}

impl OpenAiProvider {
    pub fn new(settings: ProviderSettings, api_key: String, retry: RetryPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
            api_key,
            retry,
        }
    }

    fn api_url(&self) -> &str {
        self.settings.api_url.as_deref().unwrap_or(DEFAULT_API_URL)
    }

    fn build_request(&self, prompt: &Prompt) -> ChatRequest {
        let reasoning = is_reasoning_model(&self.settings.model);

        ChatRequest {
            model: self.settings.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: prompt.system.clone(),
                },
                Message {
                    role: "user".to_string(),
                    content: prompt.user.clone(),
                },
            ],
            max_completion_tokens: if reasoning {
                REASONING_MAX_TOKENS
            } else {
                self.settings.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
            },
            temperature: if reasoning {
                None
            } else {
                Some(self.settings.temperature.unwrap_or(DEFAULT_TEMPERATURE))
            },
            reasoning_effort: reasoning.then(|| "low".to_string()),
        }
    }

    async fn send_once(
        &self,
        request: &ChatRequest,
        expected: usize,
    ) -> Result<ProviderResponse, ProviderError> {
        let response = self
            .client
            .post(self.api_url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|source| ProviderError::Network {
                provider: PROVIDER,
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<failed to read body: {}>", e));
            return Err(ProviderError::Api {
                provider: PROVIDER,
                status: status.as_u16(),
                body,
            });
        }

        let chat: ChatResponse = response.json().await.map_err(|e| ProviderError::InvalidResponse {
            provider: PROVIDER,
            message: format!("failed to parse chat response: {}", e),
        })?;

        let content = chat
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| ProviderError::InvalidResponse {
                provider: PROVIDER,
                message: "response contained no choices".to_string(),
            })?;

        let (tokens_in, tokens_out) = chat
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));

        let results = parse_translations(content, expected).map_err(|message| {
            ProviderError::Unparseable {
                provider: PROVIDER,
                message,
                tokens_in,
                tokens_out,
            }
        })?;


        Ok(ProviderResponse {
            results,
            tokens_in,
            tokens_out,
        })
    }
}

#[async_trait]
impl TranslationProvider for OpenAiProvider {
    async fn translate(
        &self,
        batch: &TranslationBatch,
        prompt: &Prompt,
    ) -> Result<ProviderResponse, ProviderError> {
        let request = self.build_request(prompt);
        debug!(
            "Sending {} units to {} ({})",
            batch.len(),
            self.settings.model,
            batch.lang_code
        );

        send_with_retry(
            &self.retry,
            &format!("OpenAI translation to {}", batch.lang_code),
            || self.send_once(&request, batch.len()),
        )
        .await
    }

    fn model_fingerprint(&self) -> String {
        format!("{}:{}", PROVIDER, self.settings.model)
    }

    fn estimate_cost(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        pricing_for(&self.settings.model).cost(tokens_in, tokens_out)
    }
}
