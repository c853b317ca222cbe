use super::{
    parse_translations, send_with_retry, Pricing, Prompt, ProviderError, ProviderResponse,
    ProviderSettings, TranslationProvider,
};
use crate::model::TranslationBatch;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

const PROVIDER: &str = "anthropic";
const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_TEMPERATURE: f32 = 0.3;

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<Message>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

fn pricing_for(model: &str) -> Pricing {
    let (input_per_1k, output_per_1k) = if model.contains("haiku") {
        (0.0008, 0.004)
    } else if model.contains("sonnet") {
        (0.003, 0.015)
    } else if model.contains("opus") {
        (0.015, 0.075)
    } else {
        (0.01, 0.01)
    };
    Pricing {
        input_per_1k,
        output_per_1k,
    }
}

pub struct AnthropicProvider {
    client: reqwest::Client,
    settings: ProviderSettings,
    api_key: String,
    retry: RetryPolicy,
}

impl AnthropicProvider {
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

    fn build_request(&self, prompt: &Prompt) -> MessagesRequest {
        MessagesRequest {
            model: self.settings.model.clone(),
            max_tokens: self.settings.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: prompt.system.clone(),
            messages: vec![Message {
                role: "user",
                content: prompt.user.clone(),
            }],
            temperature: self.settings.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        }
    }

    async fn send_once(
        &self,
        request: &MessagesRequest,
        expected: usize,
    ) -> Result<ProviderResponse, ProviderError> {
        let response = self
            .client
            .post(self.api_url())
            .header("x-api-key", self.api_key.as_str())
            .header("anthropic-version", API_VERSION)
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

        let parsed: MessagesResponse =
            response.json().await.map_err(|e| ProviderError::InvalidResponse {
                provider: PROVIDER,
                message: format!("failed to parse messages response: {}", e),
            })?;

        let text: String = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();

        if text.is_empty() {
            return Err(ProviderError::InvalidResponse {
                provider: PROVIDER,
                message: "response contained no text blocks".to_string(),
            });
        }

        let (tokens_in, tokens_out) = parsed
            .usage
            .map(|u| (u.input_tokens, u.output_tokens))
            .unwrap_or((0, 0));

        let results = parse_translations(&text, expected).map_err(|message| {
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
impl TranslationProvider for AnthropicProvider {
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
            &format!("Anthropic translation to {}", batch.lang_code),
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
