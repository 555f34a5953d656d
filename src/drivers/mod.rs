//! LLM drivers.
//!
//! A driver makes exactly one analysis call and classifies any failure as
//! transient or fatal. Retrying is the dispatcher's job, not the driver's.

use std::{error, fmt, ops::AddAssign, pin::Pin, time::Duration};

use clap::{Args, ValueEnum};
use futures::{FutureExt as _, TryFutureExt as _};
use keen_retry::RetryResult;
use schemars::JsonSchema;
use tokio::time;

use crate::{
    pages::Payload,
    prelude::*,
    prompt::RenderedPrompt,
    retry::IsKnownTransient,
};

pub mod anthropic;
pub mod echo;
pub mod native;
pub mod openai;

/// Our different driver types.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum DriverType {
    /// Anthropic's Messages API. Reads PDFs natively.
    #[default]
    Anthropic,

    /// OpenAI driver (also for LiteLLM, Ollama and other compatible gateways).
    #[clap(name = "openai")]
    OpenAI,

    /// Pick a native client based on the model name (Gemini, Claude, GPT...).
    Native,

    /// Offline driver which echoes its input. For testing.
    Echo,
}

impl DriverType {
    /// Instantiate an appropriate driver. Fails if credentials are missing.
    pub async fn create_driver(&self, model: &str) -> Result<Box<dyn Driver>> {
        match self {
            DriverType::Anthropic => Ok(Box::new(anthropic::AnthropicDriver::new()?)),
            DriverType::OpenAI => Ok(Box::new(openai::OpenAiDriver::new()?)),
            DriverType::Native => Ok(Box::new(native::NativeDriver::new(model)?)),
            DriverType::Echo => Ok(Box::new(echo::EchoDriver::new())),
        }
    }

    /// The model to use if none was given.
    pub fn default_model(&self) -> &'static str {
        match self {
            DriverType::Anthropic => "claude-3-5-haiku-20241022",
            DriverType::OpenAI => "gpt-4o-mini",
            DriverType::Native => "gemini-2.5-flash",
            DriverType::Echo => "echo",
        }
    }
}

/// Options for talking to the LLM.
#[derive(Args, Clone, Debug)]
pub struct LlmOpts {
    /// The LLM driver to use.
    #[clap(long, value_enum, default_value_t = DriverType::default())]
    pub driver: DriverType,

    /// The model to use. Defaults depend on the driver.
    #[clap(long)]
    pub model: Option<String>,

    /// An upper limit on the number of completion tokens to generate per
    /// unit.
    #[clap(long, default_value = "8192")]
    pub max_completion_tokens: u32,

    /// The temperature to use for sampling. Defaults to the model's default.
    #[clap(long)]
    pub temperature: Option<f32>,

    /// A timeout, in seconds, for each LLM call. Timed-out calls are retried.
    /// Note that even if a request times out, you'll probably still be
    /// charged.
    #[clap(long, default_value = "300")]
    pub timeout: u64,
}

impl LlmOpts {
    /// The model we'll actually use.
    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .unwrap_or_else(|| self.driver.default_model())
    }

    /// Apply our per-call timeout to a future.
    ///
    /// `'fut` is the lifetime of any data borrowed by `future`, which we
    /// carefully preserve in the boxed output.
    pub fn apply_timeout<'fut, T, E>(
        &self,
        future: impl Future<Output = Result<T, E>> + Send + 'fut,
    ) -> Pin<Box<dyn Future<Output = Result<T, LlmError<E>>> + Send + 'fut>>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let future = future.map_err(LlmError::Native);
        time::timeout(Duration::from_secs(self.timeout), future)
            // Flatten `Result<Result<T, LlmError<E>>, Elapsed>`.
            .map(|result| match result {
                Ok(inner) => inner,
                Err(_) => Err(LlmError::Timeout),
            })
            .boxed()
    }
}

/// A [`RetryResult`] for LLM requests. This allows [`Driver`] instances to
/// distinguish between errors that may be transient, and errors that are
/// definitely fatal.
pub type LlmRetryResult<T> = RetryResult<(), (), T, anyhow::Error>;

/// Interface trait for LLM drivers.
#[async_trait]
pub trait Driver: fmt::Debug + Send + Sync + 'static {
    /// Analyze one unit's payload using `prompt`.
    async fn analyze(
        &self,
        model: &str,
        prompt: &RenderedPrompt,
        payload: &Payload,
        llm_opts: &LlmOpts,
    ) -> LlmRetryResult<AnalysisResponse>;
}

/// The result of a successful analysis call.
#[derive(Clone, Debug)]
pub struct AnalysisResponse {
    /// The generated text.
    pub text: String,

    /// Token usage, as reported by the provider.
    pub token_usage: TokenUsage,
}

/// Token usage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, JsonSchema, Serialize)]
pub struct TokenUsage {
    /// How many tokens were used in the prompt (including the page content)?
    pub input_tokens: u64,

    /// How many tokens were generated?
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Was our token usage zero?
    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Read a required API key from the environment.
fn required_env_var(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(anyhow!(
            "missing credential: set {} in the environment or a .env file",
            name
        )),
    }
}

/// An error which occurred while calling an LLM.
///
/// Used internally by drivers to handle timeouts.
#[derive(Debug)]
pub enum LlmError<E> {
    /// A native error.
    Native(E),

    /// A timeout error.
    Timeout,
}

impl<E> IsKnownTransient for LlmError<E>
where
    E: IsKnownTransient,
{
    fn is_known_transient(&self) -> bool {
        match self {
            LlmError::Native(err) => err.is_known_transient(),
            // Overloaded servers and runaway responses both time out, and
            // both may do better next time.
            LlmError::Timeout => true,
        }
    }
}

impl<E> fmt::Display for LlmError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Native(err) => write!(f, "LLM error: {err}"),
            LlmError::Timeout => write!(f, "LLM request timed out"),
        }
    }
}

impl<E> error::Error for LlmError<E>
where
    E: error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            LlmError::Native(err) => Some(err),
            LlmError::Timeout => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_transient() {
        let opts = LlmOpts {
            driver: DriverType::Echo,
            model: None,
            max_completion_tokens: 100,
            temperature: None,
            timeout: 5,
        };
        let slow = async {
            time::sleep(Duration::from_secs(10)).await;
            Ok::<(), reqwest::StatusCode>(())
        };
        let err = opts.apply_timeout(slow).await.unwrap_err();
        assert!(matches!(err, LlmError::Timeout));
        assert!(err.is_known_transient());
    }

    #[test]
    fn default_model_depends_on_driver() {
        let opts = LlmOpts {
            driver: DriverType::Anthropic,
            model: None,
            max_completion_tokens: 100,
            temperature: None,
            timeout: 5,
        };
        assert_eq!(opts.model(), "claude-3-5-haiku-20241022");
    }
}
