//! LLM provider abstraction.
//!
//! The planner and validator never see a concrete provider. The orchestrator
//! holds a `Box<dyn TranslationProvider>` built by [`create_provider`] from
//! the `provider` section of the config.
//!
//! - `openai`: OpenAI Chat Completions
//! - `anthropic`: Anthropic Messages API
//! - `prompt`: prompt construction and reply parsing shared by both

mod anthropic;
mod openai;
pub mod prompt;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;
pub use prompt::{parse_translations, Prompt, PromptBuilder, PROMPT_VERSION};

use crate::model::{TranslationBatch, TranslationResult};
use crate::retry::{with_retry_if, RetryPolicy};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::debug;

/// Which provider implementation to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    /// Environment variable holding the API key.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OPENAI_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The `provider` section of the project config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// What a provider returns for one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    /// One result per batch unit, matched by position.
    pub results: Vec<TranslationResult>,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} API error ({status}): {body}")]
    Api {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("request to {provider} failed: {source}")]
    Network {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid response from {provider}: {message}")]
    InvalidResponse {
        provider: &'static str,
        message: String,
    },

    /// The reply arrived and was billed, but its content could not be read
    /// as translations.
    #[error("unparseable reply from {provider}: {message}")]
    Unparseable {
        provider: &'static str,
        message: String,
        tokens_in: u64,
        tokens_out: u64,
    },
}

impl ProviderError {
    /// Rate limits, server errors, network failures and malformed replies are
    /// worth another attempt. Other 4xx responses are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Api { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Network { .. } => true,
            ProviderError::InvalidResponse { .. } => true,
            ProviderError::Unparseable { .. } => true,
        }
    }

    /// Tokens billed for the failed call, as `(tokens_in, tokens_out)`.
    pub fn usage(&self) -> (u64, u64) {
        match self {
            ProviderError::Unparseable {
                tokens_in,
                tokens_out,
                ..
            } => (*tokens_in, *tokens_out),
            _ => (0, 0),
        }
    }
}

/// Retry `send` under `policy`, adding the tokens billed for unparseable
/// replies to whatever the last attempt returns.
///
/// Usage billed before a final network or API error is only logged, since
/// those errors carry no token counts.
pub(crate) async fn send_with_retry<F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut send: F,
) -> Result<ProviderResponse, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ProviderResponse, ProviderError>>,
{
    let billed_in = AtomicU64::new(0);
    let billed_out = AtomicU64::new(0);

    let outcome = with_retry_if(
        policy,
        operation_name,
        || {
            let attempt = send();
            let (billed_in, billed_out) = (&billed_in, &billed_out);
            async move {
                let result = attempt.await;
                if let Err(e) = &result {
                    let (tokens_in, tokens_out) = e.usage();
                    billed_in.fetch_add(tokens_in, Ordering::Relaxed);
                    billed_out.fetch_add(tokens_out, Ordering::Relaxed);
                }
                result
            }
        },
        ProviderError::is_retryable,
    )
    .await;

    let (billed_in, billed_out) = (billed_in.into_inner(), billed_out.into_inner());
    match outcome {
        Ok(mut response) => {
            response.tokens_in += billed_in;
            response.tokens_out += billed_out;
            Ok(response)
        }
        Err(ProviderError::Unparseable {
            provider, message, ..
        }) => Err(ProviderError::Unparseable {
            provider,
            message,
            tokens_in: billed_in,
            tokens_out: billed_out,
        }),
        Err(e) => {
            if billed_in + billed_out > 0 {
                debug!(
                    "{}: {} in / {} out tokens billed for unparseable replies before: {}",
                    operation_name, billed_in, billed_out, e
                );
            }
            Err(e)
        }
    }
}

/// USD prices per 1k tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl Pricing {
    pub fn cost(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        tokens_in as f64 / 1000.0 * self.input_per_1k
            + tokens_out as f64 / 1000.0 * self.output_per_1k
    }
}

#[async_trait]
pub trait TranslationProvider: Send + Sync {
    /// Translate every unit of `batch`, returning results in batch order.
    async fn translate(
        &self,
        batch: &TranslationBatch,
        prompt: &Prompt,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Stable identifier of the provider and model, e.g. `openai:gpt-4o-mini`.
    fn model_fingerprint(&self) -> String;

    fn estimate_cost(&self, tokens_in: u64, tokens_out: u64) -> f64;
}

/// Build the provider named by `settings`.
pub fn create_provider(
    settings: &ProviderSettings,
    api_key: String,
    retry: RetryPolicy,
) -> Box<dyn TranslationProvider> {
    match settings.kind {
        ProviderKind::OpenAi => Box::new(OpenAiProvider::new(settings.clone(), api_key, retry)),
        ProviderKind::Anthropic => {
            Box::new(AnthropicProvider::new(settings.clone(), api_key, retry))
        }
    }
}
