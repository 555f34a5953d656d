use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod cost;
mod data_url;
mod drivers;
mod pages;
mod prelude;
mod prompt;
mod queues;
mod report;
mod results;
mod retry;
mod ui;

/// Analyze PDF documents page by page with an LLM.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - ANTHROPIC_API_KEY: Required by the default `anthropic` driver.
  - ANTHROPIC_API_BASE (optional): Override the Anthropic server URL.
  - OPENAI_API_KEY: Required by the `openai` driver.
  - OPENAI_API_BASE (optional): Override the server URL, for LiteLLM,
    Ollama and other compatible gateways.
  - GEMINI_API_KEY, etc.: Used by the `native` driver, depending on the
    model.
  - RUST_LOG (optional): Log filter, like `info` or `pdf_analyzer=debug`.

  These variables may be set in a standard `.env` file.

  Reading PDFs requires `pdfinfo`, `pdfseparate`, `pdfunite`, `pdftotext`
  and `pdftocairo` from poppler-utils.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Analyze each page (or group of pages) of a document, and write a
    /// report.
    Analyze(cmd::analyze::AnalyzeOpts),
    /// Print schemas for input and output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Analyze(opts) => opts.output_path.is_none(),
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Analyze(analyze_opts) => {
            cmd::analyze::cmd_analyze(ui, analyze_opts).await?;
        }
        Cmd::Schema(schema_opts) => {
            cmd::schema::cmd_schema(schema_opts).await?;
        }
    }
    Ok(())
}
