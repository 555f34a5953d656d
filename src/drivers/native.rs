//! Native LLM driver, for talking to providers directly without a gateway.
//!
//! We use the [`genai`] crate, which picks an adapter based on the model
//! name. Blobs are sent as inline images, which Gemini also accepts for PDFs.

use std::sync::Arc;

use base64::{Engine as _, prelude::BASE64_STANDARD};
use genai::{
    Client,
    chat::{
        ChatMessage, ChatOptions, ChatRequest, ChatRole, ContentPart, ImageSource,
        MessageContent, Usage,
    },
    webc,
};

use crate::{
    pages::Payload,
    prelude::*,
    prompt::RenderedPrompt,
    retry::{IsKnownTransient, retry_result_ok, try_fatal, try_potentially_transient},
};

use super::{
    AnalysisResponse, Driver, LlmOpts, LlmRetryResult, TokenUsage, required_env_var,
};

/// Model name prefixes, and the API key each provider needs.
const PROVIDER_KEYS: &[(&str, &str)] = &[
    ("gemini", "GEMINI_API_KEY"),
    ("claude", "ANTHROPIC_API_KEY"),
    ("gpt", "OPENAI_API_KEY"),
    ("o1", "OPENAI_API_KEY"),
    ("o3", "OPENAI_API_KEY"),
    ("o4", "OPENAI_API_KEY"),
    ("command", "COHERE_API_KEY"),
    ("grok", "XAI_API_KEY"),
    ("deepseek", "DEEPSEEK_API_KEY"),
];

/// A driver backed by [`genai`].
#[derive(Debug)]
pub struct NativeDriver {
    client: Client,
}

impl NativeDriver {
    /// Create a new native driver, checking that `model`'s provider has an
    /// API key available.
    pub fn new(model: &str) -> Result<Self> {
        if let Some((_, env_var)) = PROVIDER_KEYS
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix))
        {
            required_env_var(env_var)?;
        } else {
            debug!(model, "No known API key for model, assuming a local provider");
        }
        Ok(Self {
            client: Client::default(),
        })
    }
}

#[async_trait]
impl Driver for NativeDriver {
    #[instrument(level = "debug", skip_all, fields(model = model))]
    async fn analyze(
        &self,
        model: &str,
        prompt: &RenderedPrompt,
        payload: &Payload,
        llm_opts: &LlmOpts,
    ) -> LlmRetryResult<AnalysisResponse> {
        if let Ok(service_target) = self.client.resolve_service_target(model).await {
            debug!(
                adapter_kind = %service_target.model.adapter_kind,
                "Using native driver"
            );
        }

        let req = to_genai_request(prompt, payload);
        let opts = ChatOptions {
            temperature: llm_opts.temperature.map(f64::from),
            max_tokens: Some(llm_opts.max_completion_tokens),
            ..ChatOptions::default()
        };

        let future =
            llm_opts.apply_timeout(self.client.exec_chat(model, req, Some(&opts)));
        let chat_res = try_potentially_transient!(future.await);

        let content = try_fatal!(
            chat_res
                .content
                .as_ref()
                .ok_or_else(|| anyhow!("No content in response: {:?}", chat_res))
        );
        let text = try_fatal!(content.text_as_str().ok_or_else(|| anyhow!(
            "Expected text content in response, found: {:?}",
            content
        )))
        .to_owned();

        let Usage {
            prompt_tokens,
            completion_tokens,
            ..
        } = chat_res.usage;
        let token_usage = TokenUsage {
            input_tokens: prompt_tokens
                .and_then(|n| u64::try_from(n).ok())
                .unwrap_or_default(),
            output_tokens: completion_tokens
                .and_then(|n| u64::try_from(n).ok())
                .unwrap_or_default(),
        };
        retry_result_ok(AnalysisResponse { text, token_usage })
    }
}

/// Convert a prompt and payload into a [`genai`] request.
fn to_genai_request(prompt: &RenderedPrompt, payload: &Payload) -> ChatRequest {
    let mut parts = vec![ContentPart::Text(prompt.user.clone())];
    match payload {
        Payload::Text(text) => parts.push(ContentPart::Text(text.clone())),
        Payload::Blobs(blobs) => {
            for blob in blobs {
                parts.push(ContentPart::Image {
                    content_type: blob.mime_type.clone(),
                    source: ImageSource::Base64(Arc::from(
                        BASE64_STANDARD.encode(&blob.data),
                    )),
                });
            }
        }
    }
    ChatRequest {
        system: prompt.developer.clone(),
        messages: vec![ChatMessage {
            role: ChatRole::User,
            content: MessageContent::Parts(parts),
            options: None,
        }],
        ..ChatRequest::default()
    }
}

impl IsKnownTransient for genai::Error {
    fn is_known_transient(&self) -> bool {
        match self {
            // These seem likely to be transient, but we have not observed them
            // in the wild yet.
            genai::Error::NoChatResponse { .. }
            | genai::Error::InvalidJsonResponseElement { .. } => true,
            genai::Error::WebAdapterCall { webc_error, .. }
            | genai::Error::WebModelCall { webc_error, .. } => {
                webc_error.is_known_transient()
            }
            _ => false,
        }
    }
}

impl IsKnownTransient for webc::Error {
    fn is_known_transient(&self) -> bool {
        match self {
            webc::Error::ResponseFailedNotJson { .. } => true,
            webc::Error::ResponseFailedStatus { status, .. } => {
                status.is_known_transient()
            }
            webc::Error::Reqwest(error) => error.is_known_transient(),
            _ => false,
        }
    }
}
