//! The batch dispatcher.
//!
//! Runs every [`Unit`] of a batch through an analysis function, with at most
//! `concurrency` units in flight. Transient failures are retried with
//! exponential backoff while the unit keeps its slot, so a struggling unit
//! slows the batch down rather than piling more requests onto an overloaded
//! provider.
//!
//! Results are written into a pre-sized container at each unit's own index,
//! so the output order never depends on completion order. Per-unit failures
//! are data. Only programming errors (a panicking analysis function, a
//! missing or duplicate result) make [`Dispatcher::dispatch`] fail.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::{FutureExt as _, future::join_all};
use keen_retry::RetryResult;
use schemars::JsonSchema;
use tokio::{sync::mpsc::UnboundedSender, time::Instant};

use crate::{
    async_utils::BoxedFuture,
    drivers::{AnalysisResponse, LlmRetryResult, TokenUsage},
    pages::PageRange,
    prelude::*,
    retry::{RetryPolicy, Sleeper, TokioSleeper},
};

use super::work::{WorkFn, WorkQueue};

/// One indivisible piece of work.
#[derive(Debug)]
pub struct Unit<T> {
    /// Position in the batch. Results are reported in this order.
    pub index: usize,

    /// The pages covered by this unit.
    pub pages: PageRange,

    /// A human-readable label, like "page 7" or "chunk 3, pages 11-15".
    pub label: String,

    /// Whatever the analysis function needs to do its job.
    pub payload: T,
}

/// Split `page_count` pages into units of `chunk_size` consecutive pages.
pub fn plan_units<T>(
    page_count: usize,
    chunk_size: usize,
    mut make_payload: impl FnMut(PageRange) -> T,
) -> Vec<Unit<T>> {
    let chunk_size = chunk_size.max(1);
    (0..page_count)
        .step_by(chunk_size)
        .enumerate()
        .map(|(index, first)| {
            let pages = PageRange::new(first, (first + chunk_size).min(page_count) - 1);
            let label = if chunk_size == 1 {
                format!("page {}", pages)
            } else if pages.is_single() {
                format!("chunk {}, page {}", index + 1, pages)
            } else {
                format!("chunk {}, pages {}", index + 1, pages)
            };
            Unit {
                index,
                pages,
                label,
                payload: make_payload(pages),
            }
        })
        .collect()
}

/// Did the unit succeed?
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Ok,
    Failed,
}

/// How an error was classified.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Might have gone away with more retries.
    Transient,
    /// Will not go away on retry.
    Permanent,
}

/// A classified per-unit error.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct UnitError {
    pub kind: ErrorKind,
    pub message: String,
}

impl UnitError {
    fn new(kind: ErrorKind, error: &anyhow::Error) -> Self {
        Self {
            kind,
            message: format!("{error:#}"),
        }
    }
}

/// The outcome of one unit.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct UnitResult {
    /// Position in the batch.
    pub index: usize,

    /// Human-readable label.
    pub label: String,

    /// First page covered, counting from 1.
    pub first_page: usize,

    /// Last page covered, counting from 1.
    pub last_page: usize,

    pub status: UnitStatus,

    /// The analysis, if we got one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    /// Why we didn't get an analysis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<UnitError>,

    /// Transient errors which were retried.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_errors: Vec<String>,

    /// How many times we called the analysis function.
    pub attempts: u32,

    /// Tokens used by the successful call. Zero for failed units.
    #[serde(flatten)]
    pub token_usage: TokenUsage,

    /// Time from acquiring a slot to finishing, including backoff.
    #[serde(rename = "elapsed_secs", with = "duration_secs")]
    #[schemars(with = "f64")]
    pub elapsed: Duration,

    /// When the unit finished.
    pub completed_at: DateTime<Utc>,
}

impl UnitResult {
    /// Did this unit succeed?
    pub fn is_ok(&self) -> bool {
        self.status == UnitStatus::Ok
    }
}

/// (De)serialize a [`Duration`] as fractional seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Progress notifications. Purely informational.
#[derive(Clone, Debug)]
pub enum DispatchEvent {
    UnitStarted {
        index: usize,
        label: String,
    },
    RetryScheduled {
        index: usize,
        label: String,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    UnitSucceeded {
        index: usize,
        attempts: u32,
    },
    UnitFailed {
        index: usize,
        label: String,
        error: UnitError,
    },
    WaveFinished {
        wave: usize,
        waves: usize,
    },
}

/// How units are fed to the workers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// Start a new unit whenever a slot frees up.
    #[default]
    Gate,
    /// Run units in waves of `concurrency`, waiting for each wave to finish
    /// before starting the next.
    Waves,
}

/// The per-unit analysis function.
pub type AnalyzeFn<T> = Arc<
    dyn Fn(Arc<Unit<T>>) -> BoxedFuture<LlmRetryResult<AnalysisResponse>>
        + Send
        + Sync
        + 'static,
>;

/// Pre-sized, index-addressed result storage.
struct ResultSlots {
    slots: Mutex<Vec<Option<UnitResult>>>,
}

impl ResultSlots {
    fn new(len: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; len]),
        }
    }

    /// Store `result` at its index. Each index may only be written once.
    fn fill(&self, result: UnitResult) -> Result<()> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| anyhow!("result slots were poisoned"))?;
        let len = slots.len();
        let slot = slots
            .get_mut(result.index)
            .ok_or_else(|| anyhow!("unit index {} out of range ({len})", result.index))?;
        if slot.is_some() {
            return Err(anyhow!("result for unit {} written twice", result.index));
        }
        *slot = Some(result);
        Ok(())
    }

    /// Take all the results. Every slot must have been filled.
    fn take_all(&self) -> Result<Vec<UnitResult>> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| anyhow!("result slots were poisoned"))?;
        std::mem::take(&mut *slots)
            .into_iter()
            .enumerate()
            .map(|(index, slot)| slot.ok_or_else(|| anyhow!("no result for unit {index}")))
            .collect()
    }
}

/// Everything a worker needs to run one unit.
struct UnitContext<T> {
    analyze: AnalyzeFn<T>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    events: Option<UnboundedSender<DispatchEvent>>,
    slots: ResultSlots,
}

impl<T> UnitContext<T> {
    fn emit(&self, event: DispatchEvent) {
        if let Some(events) = &self.events {
            // Nobody listening is fine.
            let _ = events.send(event);
        }
    }
}

/// Runs batches of units with bounded concurrency and retries.
pub struct Dispatcher {
    concurrency: usize,
    policy: RetryPolicy,
    mode: DispatchMode,
    sleeper: Arc<dyn Sleeper>,
    events: Option<UnboundedSender<DispatchEvent>>,
}

impl Dispatcher {
    /// Create a dispatcher running at most `concurrency` units at once. A
    /// `concurrency` of 0 is treated as 1.
    pub fn new(concurrency: usize, policy: RetryPolicy) -> Self {
        Self {
            concurrency: concurrency.max(1),
            policy,
            mode: DispatchMode::default(),
            sleeper: Arc::new(TokioSleeper),
            events: None,
        }
    }

    /// Choose how units are fed to workers.
    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Replace the backoff sleeper.
    #[cfg(test)]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Send progress events to `events`.
    pub fn with_events(mut self, events: UnboundedSender<DispatchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run every unit to a terminal state, and return one result per unit,
    /// in unit order.
    #[instrument(
        level = "debug",
        skip_all,
        fields(
            units = units.len(),
            concurrency = self.concurrency,
            max_attempts = self.policy.max_attempts(),
            mode = ?self.mode
        )
    )]
    pub async fn dispatch<T>(
        &self,
        units: Vec<Unit<T>>,
        analyze: AnalyzeFn<T>,
    ) -> Result<Vec<UnitResult>>
    where
        T: Send + Sync + 'static,
    {
        let unit_count = units.len();
        if unit_count == 0 {
            return Ok(vec![]);
        }

        let ctx = Arc::new(UnitContext {
            analyze,
            policy: self.policy,
            sleeper: self.sleeper.clone(),
            events: self.events.clone(),
            slots: ResultSlots::new(unit_count),
        });
        let work_fn: WorkFn<Unit<T>, Result<()>> = {
            let ctx = ctx.clone();
            Arc::new(move |unit| run_unit(ctx.clone(), unit).boxed())
        };
        let (queue, worker) = WorkQueue::new(self.concurrency, work_fn);

        let submitted = match self.mode {
            DispatchMode::Gate => submit_all(&queue, units).await,
            DispatchMode::Waves => {
                let waves = unit_count.div_ceil(self.concurrency);
                let mut units = units.into_iter();
                let mut submitted = Ok(());
                for wave in 1..=waves {
                    let batch = units.by_ref().take(self.concurrency).collect::<Vec<_>>();
                    submitted = submit_all(&queue, batch).await;
                    if submitted.is_err() {
                        break;
                    }
                    debug!(wave, waves, "Wave finished");
                    ctx.emit(DispatchEvent::WaveFinished { wave, waves });
                }
                submitted
            }
        };

        // Closing the queue lets the worker exit. A panic in any unit shows
        // up here.
        drop(queue);
        worker.join().await.context("batch worker failed")?;
        submitted?;
        ctx.slots.take_all()
    }
}

/// Submit `units` and wait for all of them to finish.
async fn submit_all<T>(
    queue: &WorkQueue<Unit<T>, Result<()>>,
    units: Vec<Unit<T>>,
) -> Result<()>
where
    T: Send + Sync + 'static,
{
    let outcomes = join_all(units.into_iter().map(|unit| queue.process(unit))).await;
    for outcome in outcomes {
        outcome??;
    }
    Ok(())
}

/// Run one unit until it succeeds, fails permanently, or runs out of
/// attempts, and record the result.
#[instrument(level = "debug", skip_all, fields(unit = unit.index, label = %unit.label))]
async fn run_unit<T>(ctx: Arc<UnitContext<T>>, unit: Unit<T>) -> Result<()>
where
    T: Send + Sync + 'static,
{
    let started = Instant::now();
    let unit = Arc::new(unit);
    ctx.emit(DispatchEvent::UnitStarted {
        index: unit.index,
        label: unit.label.clone(),
    });

    let mut retry = ctx.policy.start();
    let mut retry_errors = vec![];
    let outcome = loop {
        let attempt = retry.begin_attempt();
        trace!(attempt, "Calling analysis function");
        match (ctx.analyze)(unit.clone()).await {
            RetryResult::Ok { output, .. } => break Ok(output),
            RetryResult::Fatal { error, .. } => {
                break Err(UnitError::new(ErrorKind::Permanent, &error));
            }
            RetryResult::Transient { error, .. } => match retry.next_delay() {
                Some(delay) => {
                    let message = format!("{error:#}");
                    debug!(attempt, ?delay, error = %message, "Retrying after transient error");
                    ctx.emit(DispatchEvent::RetryScheduled {
                        index: unit.index,
                        label: unit.label.clone(),
                        attempt,
                        delay,
                        error: message.clone(),
                    });
                    retry_errors.push(message);
                    ctx.sleeper.sleep(delay).await;
                }
                None => break Err(UnitError::new(ErrorKind::Transient, &error)),
            },
        }
    };

    let attempts = retry.attempts();
    let (status, output, error, token_usage) = match outcome {
        Ok(response) => {
            if response.token_usage.is_zero() {
                warn!("No token usage reported, this unit will be priced at zero");
            }
            ctx.emit(DispatchEvent::UnitSucceeded {
                index: unit.index,
                attempts,
            });
            (
                UnitStatus::Ok,
                Some(response.text),
                None,
                response.token_usage,
            )
        }
        Err(error) => {
            ctx.emit(DispatchEvent::UnitFailed {
                index: unit.index,
                label: unit.label.clone(),
                error: error.clone(),
            });
            (UnitStatus::Failed, None, Some(error), TokenUsage::default())
        }
    };
    ctx.slots.fill(UnitResult {
        index: unit.index,
        label: unit.label.clone(),
        first_page: unit.pages.first_page_number(),
        last_page: unit.pages.last_page_number(),
        status,
        output,
        error,
        retry_errors,
        attempts,
        token_usage,
        elapsed: started.elapsed(),
        completed_at: Utc::now(),
    })
}
