//! Async item processing with backpressure.
//!
//! The key concepts here are borrowed from ["Queues Don't Fix
//! Overload"](https://ferd.ca/queues-don-t-fix-overload.html). A [`WorkQueue`]
//! runs a single background task which processes at most
//! `concurrency_limit` items at once. Everything else waits in the channel.
//!
//! This is a strictly in-process queue for closely related subtasks of one
//! larger job. It makes no attempt at priorities or fairness.

use std::sync::Arc;

use futures::{
    SinkExt as _, StreamExt as _,
    channel::{mpsc, oneshot},
};

use crate::{
    async_utils::{BoxedFuture, JoinWorker},
    prelude::*,
};

/// An input, plus a one-shot channel on which to return the result.
struct WorkItem<Input, Output> {
    input: Input,
    tx: oneshot::Sender<Output>,
}

/// An async work function.
pub type WorkFn<Input, Output> =
    Arc<dyn Fn(Input) -> BoxedFuture<Output> + Send + Sync + 'static>;

/// A bounded pool of workers fed through a channel.
///
/// Dropping the queue closes the channel. The background task then finishes
/// the items already submitted and exits, which can be observed by joining the
/// [`JoinWorker`] returned from [`WorkQueue::new`].
pub struct WorkQueue<Input, Output>
where
    Input: 'static,
    Output: 'static,
{
    tx: mpsc::Sender<WorkItem<Input, Output>>,
}

impl<Input, Output> WorkQueue<Input, Output>
where
    Input: Send + 'static,
    Output: Send + 'static,
{
    /// Create a new work queue which runs at most `concurrency_limit` calls to
    /// `work_fn` at once.
    pub fn new(concurrency_limit: usize, work_fn: WorkFn<Input, Output>) -> (Self, JoinWorker) {
        let concurrency_limit = concurrency_limit.max(1);
        let (tx, rx) = mpsc::channel(concurrency_limit);
        let worker = tokio::spawn(async move {
            rx.for_each_concurrent(concurrency_limit, |item: WorkItem<Input, Output>| {
                let work_fn = work_fn.clone();
                async move {
                    let result = work_fn(item.input).await;
                    if item.tx.send(result).is_err() {
                        debug!("failed to send work item result because receiver was dropped");
                    }
                }
            })
            .await;
            Ok(())
        });
        (Self { tx }, JoinWorker::from_handle(worker))
    }

    /// Submit `input` and wait for its output.
    ///
    /// Fails only if the background task has gone away, which normally means
    /// that `work_fn` panicked.
    pub async fn process(&self, input: Input) -> Result<Output> {
        let (tx, rx) = oneshot::channel();
        let mut sender = self.tx.clone();
        sender
            .send(WorkItem { input, tx })
            .await
            .context("failed to send work item")?;
        rx.await.context("work item was dropped before it finished")
    }
}
