//! Anthropic Messages API driver.
//!
//! Anthropic models read PDFs natively, so this is the only driver that can
//! send a PDF sub-document without rasterizing it first.

use base64::{Engine as _, prelude::BASE64_STANDARD};
use reqwest::StatusCode;

use crate::{
    pages::Payload,
    prelude::*,
    prompt::RenderedPrompt,
    retry::{
        IsKnownTransient, retry_result_fatal, retry_result_ok, retry_result_transient,
        try_fatal, try_potentially_transient,
    },
};

use super::{
    AnalysisResponse, Driver, LlmOpts, LlmRetryResult, TokenUsage, required_env_var,
};

/// Default API server.
const DEFAULT_API_BASE: &str = "https://api.anthropic.com";

/// The API version we speak.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Talks to the Anthropic Messages API over HTTP.
#[derive(Debug)]
pub struct AnthropicDriver {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl AnthropicDriver {
    /// Create a new driver using `ANTHROPIC_API_KEY` and, optionally,
    /// `ANTHROPIC_API_BASE`.
    pub fn new() -> Result<Self> {
        let api_key = required_env_var("ANTHROPIC_API_KEY")?;
        let api_base = std::env::var("ANTHROPIC_API_BASE")
            .unwrap_or_else(|_| DEFAULT_API_BASE.to_owned());
        let client = reqwest::Client::builder()
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_owned(),
            api_key,
        })
    }
}

#[async_trait]
impl Driver for AnthropicDriver {
    #[instrument(level = "debug", skip_all, fields(model = model))]
    async fn analyze(
        &self,
        model: &str,
        prompt: &RenderedPrompt,
        payload: &Payload,
        llm_opts: &LlmOpts,
    ) -> LlmRetryResult<AnalysisResponse> {
        let body = build_request(model, prompt, payload, llm_opts);
        let url = format!("{}/v1/messages", self.api_base);

        // Time out the whole exchange, including reading the body.
        let future = llm_opts.apply_timeout(async {
            let response = self
                .client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send()
                .await?;
            let status = response.status();
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        });
        let (status, text) = try_potentially_transient!(future.await);

        if !status.is_success() {
            let error = ApiError::from_response(status, &text);
            return if error.is_known_transient() {
                debug!(%error, "Potentially transient error");
                retry_result_transient(error.into())
            } else {
                retry_result_fatal(error.into())
            };
        }

        let response = try_fatal!(
            serde_json::from_str::<MessagesResponse>(&text)
                .context("Error parsing Anthropic response")
        );
        trace!(?response, "Anthropic response");
        match response.into_analysis() {
            Ok(analysis) => retry_result_ok(analysis),
            Err(err) => retry_result_fatal(err),
        }
    }
}

/// Build a Messages API request. The page content goes before the prompt
/// text, which Anthropic recommends for long documents.
fn build_request(
    model: &str,
    prompt: &RenderedPrompt,
    payload: &Payload,
    llm_opts: &LlmOpts,
) -> Value {
    let mut content = vec![];
    match payload {
        Payload::Text(text) => content.push(json!({ "type": "text", "text": text })),
        Payload::Blobs(blobs) => {
            for blob in blobs {
                let block_type = if blob.mime_type == "application/pdf" {
                    "document"
                } else {
                    "image"
                };
                content.push(json!({
                    "type": block_type,
                    "source": {
                        "type": "base64",
                        "media_type": blob.mime_type,
                        "data": BASE64_STANDARD.encode(&blob.data),
                    },
                }));
            }
        }
    }
    content.push(json!({ "type": "text", "text": prompt.user }));

    let mut body = json!({
        "model": model,
        "max_tokens": llm_opts.max_completion_tokens,
        "messages": [{ "role": "user", "content": content }],
    });
    if let Some(developer) = &prompt.developer {
        body["system"] = json!(developer);
    }
    if let Some(temperature) = llm_opts.temperature {
        body["temperature"] = json!(temperature);
    }
    body
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

impl MessagesResponse {
    fn into_analysis(self) -> Result<AnalysisResponse> {
        if self.stop_reason.as_deref() == Some("max_tokens") {
            warn!("Response was truncated at max_tokens");
        }
        let text = self
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        if text.trim().is_empty() {
            return Err(anyhow!("No text content in Anthropic response"));
        }
        Ok(AnalysisResponse {
            text,
            token_usage: TokenUsage {
                input_tokens: self.usage.input_tokens,
                output_tokens: self.usage.output_tokens,
            },
        })
    }
}

/// An error response from the API.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    error_type: Option<String>,
    message: String,
}

impl ApiError {
    fn from_response(status: StatusCode, body: &str) -> Self {
        #[derive(Deserialize)]
        struct Envelope {
            error: Detail,
        }
        #[derive(Deserialize)]
        struct Detail {
            #[serde(rename = "type")]
            error_type: String,
            message: String,
        }

        match serde_json::from_str::<Envelope>(body) {
            Ok(envelope) => Self {
                status,
                error_type: Some(envelope.error.error_type),
                message: envelope.error.message,
            },
            Err(_) => Self {
                status,
                error_type: None,
                message: body.trim().to_owned(),
            },
        }
    }
}

impl IsKnownTransient for ApiError {
    fn is_known_transient(&self) -> bool {
        self.status.is_known_transient()
            || matches!(
                self.error_type.as_deref(),
                Some("rate_limit_error" | "overloaded_error")
            )
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_type {
            Some(error_type) => write!(
                f,
                "Anthropic API error {} ({}): {}",
                self.status, error_type, self.message
            ),
            None => write!(f, "Anthropic API error {}: {}", self.status, self.message),
        }
    }
}

impl std::error::Error for ApiError {}
