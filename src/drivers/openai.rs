//! Our OpenAI driver, which we also use for LiteLLM, Ollama and other
//! compatible gateways.

use std::time::Duration;

use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{CreateChatCompletionResponse, FinishReason},
};

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

use crate::{
    data_url::data_url,
    pages::Payload,
    prelude::*,
    prompt::RenderedPrompt,
    retry::{
        IsKnownTransient, retry_result_fatal, retry_result_ok, try_fatal,
        try_potentially_transient,
    },
};

use super::{
    AnalysisResponse, Driver, LlmOpts, LlmRetryResult, TokenUsage, required_env_var,
};

/// Talks to `/chat/completions` on OpenAI or a compatible gateway.
#[derive(Debug)]
pub struct OpenAiDriver {
    client: Client<OpenAIConfig>,
}

impl OpenAiDriver {
    /// Create a new driver using `OPENAI_API_KEY` and, optionally,
    /// `OPENAI_API_BASE`.
    pub fn new() -> Result<Self> {
        let api_key = required_env_var("OPENAI_API_KEY")?;
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Ok(api_base) = std::env::var("OPENAI_API_BASE") {
            config = config.with_api_base(api_base);
        }
        Ok(Self {
            client: Client::with_config(config).with_backoff(no_retry_backoff()),
        })
    }
}

/// A backoff that gives up at once. The dispatcher owns retries, so the
/// client must report a 429 instead of retrying it internally.
fn no_retry_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_max_elapsed_time(Some(Duration::ZERO))
        .build()
}

#[async_trait]
impl Driver for OpenAiDriver {
    #[instrument(level = "debug", skip_all, fields(model = model))]
    async fn analyze(
        &self,
        model: &str,
        prompt: &RenderedPrompt,
        payload: &Payload,
        llm_opts: &LlmOpts,
    ) -> LlmRetryResult<AnalysisResponse> {
        let req = build_request(model, prompt, payload, llm_opts);

        let chat = self.client.chat();
        let future = llm_opts.apply_timeout(chat.create_byot(req));
        let chat_result: Value = try_potentially_transient!(future.await);
        trace!(%chat_result, "OpenAI response");
        let response = try_fatal!(
            serde_json::from_value::<CreateChatCompletionResponse>(chat_result)
                .context("Error parsing OpenAI response")
        );

        let token_usage = response
            .usage
            .as_ref()
            .map(|usage| TokenUsage {
                input_tokens: u64::from(usage.prompt_tokens),
                output_tokens: u64::from(usage.completion_tokens),
            })
            .unwrap_or_default();

        let choice = match response.choices.first() {
            Some(choice) => choice,
            None => {
                return retry_result_fatal(anyhow!("No choices in OpenAI response"));
            }
        };
        if choice.finish_reason == Some(FinishReason::ContentFilter) {
            return retry_result_fatal(anyhow!(
                "Content filter triggered (may also be a RECITATION error for Gemini models)"
            ));
        }
        let text = choice.message.content.clone().unwrap_or_default();
        if text.trim().is_empty() {
            return retry_result_fatal(anyhow!("Empty content in OpenAI response"));
        }
        retry_result_ok(AnalysisResponse { text, token_usage })
    }
}

/// Build a chat completion request. Images become `data:` URLs, and PDFs
/// are sent as inline files.
fn build_request(
    model: &str,
    prompt: &RenderedPrompt,
    payload: &Payload,
    llm_opts: &LlmOpts,
) -> Value {
    let mut parts = vec![json!({ "type": "text", "text": prompt.user })];
    match payload {
        Payload::Text(text) => parts.push(json!({ "type": "text", "text": text })),
        Payload::Blobs(blobs) => {
            for blob in blobs {
                let url = data_url(&blob.mime_type, &blob.data);
                if blob.mime_type == "application/pdf" {
                    parts.push(json!({
                        "type": "file",
                        "file": { "filename": "pages.pdf", "file_data": url },
                    }));
                } else {
                    parts.push(json!({ "type": "image_url", "image_url": { "url": url } }));
                }
            }
        }
    }

    let mut messages = vec![];
    if let Some(developer) = &prompt.developer {
        messages.push(json!({ "role": "system", "content": developer }));
    }
    messages.push(json!({ "role": "user", "content": parts }));

    let mut req = json!({
        "model": model,
        "messages": messages,
        "max_completion_tokens": llm_opts.max_completion_tokens,
    });
    if let Some(temperature) = llm_opts.temperature {
        req["temperature"] = json!(temperature);
    }
    req
}

impl IsKnownTransient for OpenAIError {
    fn is_known_transient(&self) -> bool {
        match self {
            OpenAIError::Reqwest(err) => err.is_known_transient(),
            OpenAIError::ApiError(err) => {
                let error_type = err.r#type.as_deref().unwrap_or_default();
                error_type.contains("rate_limit")
                    || error_type.contains("overloaded")
                    || err.message.to_ascii_lowercase().contains("rate limit")
            }
            // Usually a truncated body from an overloaded gateway.
            OpenAIError::JSONDeserialize(_) => true,
            _ => false,
        }
    }
}
