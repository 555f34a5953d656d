//! Echo driver for testing.
//!
//! This driver never talks to the network. It echoes back the payload, and
//! fails on request: text payloads containing [`FATAL_MARKER`] fail
//! permanently, and those containing [`TRANSIENT_MARKER`] fail transiently on
//! every attempt.

use crate::{
    pages::Payload,
    prelude::*,
    prompt::RenderedPrompt,
    retry::{retry_result_fatal, retry_result_ok, retry_result_transient},
};

use super::{AnalysisResponse, Driver, LlmOpts, LlmRetryResult, TokenUsage};

/// Text payloads containing this fail permanently.
pub const FATAL_MARKER: &str = "ECHO_FATAL";

/// Text payloads containing this fail transiently.
pub const TRANSIENT_MARKER: &str = "ECHO_TRANSIENT";

/// Echo driver for testing.
#[derive(Debug)]
pub struct EchoDriver;

impl EchoDriver {
    /// Create a new echo driver.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for EchoDriver {
    async fn analyze(
        &self,
        _model: &str,
        prompt: &RenderedPrompt,
        payload: &Payload,
        _llm_opts: &LlmOpts,
    ) -> LlmRetryResult<AnalysisResponse> {
        let echo = match payload {
            Payload::Text(text) if text.contains(FATAL_MARKER) => {
                return retry_result_fatal(anyhow!("echo driver: found {FATAL_MARKER}"));
            }
            Payload::Text(text) if text.contains(TRANSIENT_MARKER) => {
                return retry_result_transient(anyhow!(
                    "echo driver: found {TRANSIENT_MARKER}"
                ));
            }
            Payload::Text(text) => text.trim().to_owned(),
            Payload::Blobs(blobs) => {
                let bytes = blobs.iter().map(|blob| blob.data.len()).sum::<usize>();
                format!("{} blob(s), {} bytes", blobs.len(), bytes)
            }
        };

        // Count words as "tokens", so that cost accounting has something to
        // work with.
        let input_tokens = word_count(&prompt.user)
            + prompt.developer.as_deref().map(word_count).unwrap_or_default()
            + word_count(&echo);
        let output_tokens = word_count(&echo);
        retry_result_ok(AnalysisResponse {
            text: echo,
            token_usage: TokenUsage {
                input_tokens,
                output_tokens,
            },
        })
    }
}

fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

#[cfg(test)]
mod tests {
    use keen_retry::RetryResult;

    use crate::drivers::DriverType;

    use super::*;

    fn llm_opts() -> LlmOpts {
        LlmOpts {
            driver: DriverType::Echo,
            model: None,
            max_completion_tokens: 100,
            temperature: None,
            timeout: 10,
        }
    }

    fn prompt() -> RenderedPrompt {
        RenderedPrompt {
            developer: None,
            user: "Summarize this".to_owned(),
        }
    }

    #[tokio::test]
    async fn echoes_text_and_counts_words() {
        let payload = Payload::Text("three little words".to_owned());
        let result = EchoDriver::new()
            .analyze("echo", &prompt(), &payload, &llm_opts())
            .await;
        let RetryResult::Ok { output, .. } = result else {
            panic!("expected success");
        };
        assert_eq!(output.text, "three little words");
        assert_eq!(output.token_usage.input_tokens, 5);
        assert_eq!(output.token_usage.output_tokens, 3);
    }

    #[tokio::test]
    async fn markers_force_errors() {
        let driver = EchoDriver::new();
        let fatal = Payload::Text(format!("page {FATAL_MARKER}"));
        assert!(matches!(
            driver.analyze("echo", &prompt(), &fatal, &llm_opts()).await,
            RetryResult::Fatal { .. }
        ));
        let transient = Payload::Text(format!("page {TRANSIENT_MARKER}"));
        assert!(matches!(
            driver
                .analyze("echo", &prompt(), &transient, &llm_opts())
                .await,
            RetryResult::Transient { .. }
        ));
    }
}
