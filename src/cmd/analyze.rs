//! The `analyze` subcommand.

use std::{sync::Arc, time::Duration};

use clap::Args;
use futures::FutureExt as _;
use indicatif::ProgressBar;
use tokio::{
    sync::mpsc::{UnboundedReceiver, unbounded_channel},
    time::Instant,
};

use crate::{
    async_utils::JoinWorker,
    cost::PriceTable,
    drivers::{Driver, LlmOpts},
    pages::{LazyPayload, PageSourceOptions, open_page_source},
    prelude::*,
    prompt::{ChatPrompt, OutputLevel, PromptBindings},
    queues::dispatch::{AnalyzeFn, DispatchEvent, DispatchMode, Dispatcher, plan_units},
    report::{ReportFormat, display_summary, write_report},
    results::BatchResult,
    retry::{RetryPolicy, try_fatal},
    ui::{ProgressConfig, Ui},
};

/// Options for the `analyze` subcommand.
#[derive(Args, Debug)]
pub struct AnalyzeOpts {
    /// The PDF (or image, or form-feed separated text file) to analyze.
    pub document: PathBuf,

    /// How many units to analyze at once.
    #[clap(
        short = 'j',
        long = "jobs",
        default_value = "4",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub job_count: u32,

    /// Start units in waves of `--jobs`, waiting for each wave to finish
    /// before starting the next. The default is to start a new unit as soon
    /// as any slot frees up.
    #[clap(long)]
    pub waves: bool,

    /// How many times to call the LLM for each unit before giving up on
    /// transient errors.
    #[clap(
        long,
        default_value = "3",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub max_attempts: u32,

    /// The delay before the first retry, in milliseconds. Doubles after each
    /// retry.
    #[clap(long, default_value = "2000")]
    pub retry_delay_ms: u64,

    #[clap(flatten)]
    pub llm_opts: LlmOpts,

    #[clap(flatten)]
    pub page_opts: PageSourceOptions,

    /// Which built-in prompt to use.
    #[clap(long, value_enum, default_value_t = OutputLevel::default())]
    pub level: OutputLevel,

    /// A TOML or JSON prompt file, overriding `--level`.
    #[clap(long)]
    pub prompt: Option<PathBuf>,

    /// A TOML or JSON price table, merged over the built-in prices.
    #[clap(long)]
    pub price_table: Option<PathBuf>,

    /// The report format.
    #[clap(long, value_enum, default_value_t = ReportFormat::default())]
    pub format: ReportFormat,

    /// Where to write the report. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// Run the `analyze` subcommand.
///
/// Every setup step happens before the first LLM call, so that missing
/// credentials or an unreadable document cost nothing.
#[instrument(level = "debug", skip_all, fields(document = %opts.document.display()))]
pub async fn cmd_analyze(ui: Ui, opts: &AnalyzeOpts) -> Result<()> {
    // Set up our driver.
    let model = opts.llm_opts.model().to_owned();
    let driver: Arc<dyn Driver> =
        Arc::from(opts.llm_opts.driver.create_driver(&model).await?);

    // Load our prompt and prices.
    let prompt = Arc::new(match &opts.prompt {
        Some(path) => ChatPrompt::from_path(path).await?,
        None => ChatPrompt::builtin(opts.level)?,
    });
    let price_table = PriceTable::load(opts.price_table.as_deref()).await?;
    let price = price_table.lookup(&model);
    if price.fallback {
        warn!(
            model = %model,
            priced_as = %price.priced_as,
            "No price for model, using the default price"
        );
    }

    // Open the document and plan our units.
    let source = open_page_source(&opts.document, &opts.page_opts).await?;
    let kind = source.resolve_kind(opts.page_opts.payload)?;
    let total_pages = source.page_count();
    if total_pages == 0 {
        return Err(anyhow!(
            "document has no pages: {}",
            opts.document.display()
        ));
    }
    let max_pages = opts.page_opts.max_pages.map(usize::try_from).transpose()?;
    let page_count = match max_pages {
        Some(max_pages) if max_pages < total_pages => {
            warn!(max_pages, total_pages, "Only analyzing the first pages");
            max_pages
        }
        _ => total_pages,
    };
    let units = plan_units(
        page_count,
        usize::try_from(opts.page_opts.chunk_size)?,
        |range| LazyPayload::new(source.clone(), range, kind),
    );
    info!(
        pages = page_count,
        units = units.len(),
        ?kind,
        model = %model,
        "Starting analysis"
    );

    // Report progress as units finish.
    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "🔎",
            msg: "Analyzing pages",
            done_msg: "Analyzed pages",
        },
        units.len() as u64,
    );
    let (events_tx, events_rx) = unbounded_channel();
    let progress = watch_progress(pb, events_rx);

    // Each unit renders its prompt, extracts its pages (once) and calls the
    // driver. Setup-style failures inside a unit are permanent.
    let document_name = opts
        .document
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| opts.document.display().to_string());
    let analyze: AnalyzeFn<LazyPayload> = {
        let llm_opts = opts.llm_opts.clone();
        let model = model.clone();
        Arc::new(move |unit| {
            let driver = driver.clone();
            let prompt = prompt.clone();
            let llm_opts = llm_opts.clone();
            let model = model.clone();
            let document_name = document_name.clone();
            async move {
                let rendered = try_fatal!(prompt.render(&PromptBindings {
                    document_name: &document_name,
                    page_label: &unit.label,
                    first_page: unit.pages.first_page_number(),
                    last_page: unit.pages.last_page_number(),
                    total_pages,
                }));
                let payload = try_fatal!(unit.payload.get().await);
                driver.analyze(&model, &rendered, payload, &llm_opts).await
            }
            .boxed()
        })
    };

    // Run the batch.
    let policy = RetryPolicy::new(
        opts.max_attempts,
        Duration::from_millis(opts.retry_delay_ms),
    );
    let mode = if opts.waves {
        DispatchMode::Waves
    } else {
        DispatchMode::Gate
    };
    let dispatcher = Dispatcher::new(usize::try_from(opts.job_count)?, policy)
        .with_mode(mode)
        .with_events(events_tx);
    let started = Instant::now();
    let results = dispatcher.dispatch(units, analyze).await;
    // Close the event stream.
    drop(dispatcher);
    progress.join().await?;
    let results = results?;
    let wall_clock = started.elapsed();

    // Report.
    let batch = BatchResult::build(&opts.document, price, total_pages, results, wall_clock);
    write_report(&batch, opts.format, opts.output_path.as_deref()).await?;
    display_summary(&ui, &batch);
    Ok(())
}

/// Update `pb` from dispatch events until the event stream closes.
fn watch_progress(pb: ProgressBar, mut events: UnboundedReceiver<DispatchEvent>) -> JoinWorker {
    JoinWorker::from_handle(tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                DispatchEvent::UnitStarted { index, label } => {
                    debug!(unit = index, %label, "Unit started");
                }
                DispatchEvent::RetryScheduled {
                    index,
                    label,
                    attempt,
                    delay,
                    error,
                } => {
                    warn!(
                        unit = index,
                        %label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "Retrying after transient error"
                    );
                }
                DispatchEvent::UnitSucceeded { index, attempts } => {
                    debug!(unit = index, attempts, "Unit succeeded");
                    pb.inc(1);
                }
                DispatchEvent::UnitFailed {
                    index,
                    label,
                    error,
                } => {
                    error!(
                        unit = index,
                        %label,
                        kind = ?error.kind,
                        error = %error.message,
                        "Unit failed"
                    );
                    pb.inc(1);
                }
                DispatchEvent::WaveFinished { wave, waves } => {
                    debug!(wave, waves, "Wave finished");
                }
            }
        }
        pb.finish_using_style();
        Ok(())
    }))
}
