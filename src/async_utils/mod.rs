//! Small async building blocks shared by the work queue, the dispatcher and
//! the page sources.

use std::pin::Pin;

use tokio::task::JoinHandle;

use crate::prelude::*;

pub mod io;

/// A type alias for a boxed, sendable future.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// A handle for a background worker. Awaiting it waits for the worker to
/// finish, and turns a panic in the worker into an error.
pub struct JoinWorker {
    future: BoxedFuture<Result<()>>,
}

impl JoinWorker {
    /// Create a new worker handle from a [`JoinHandle`].
    pub fn from_handle(handle: JoinHandle<Result<()>>) -> Self {
        Self {
            future: Box::pin(async move { handle.await.context("could not join task")? }),
        }
    }

    /// Wait for the worker to complete.
    pub async fn join(self) -> Result<()> {
        self.future.await
    }
}

/// Log the output of an external command, and fail if it exited
/// unsuccessfully.
///
/// Some tools exit with status 0 even after printing errors, so
/// `is_error_line` may be used to treat matching stderr lines as a failure.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
    is_error_line: Option<&dyn Fn(&str) -> bool>,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );
    if !stderr.trim().is_empty() {
        warn!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
    }

    if output.status.success() {
        match is_error_line {
            Some(is_error_line) if stderr.lines().any(is_error_line) => Err(anyhow!(
                "{} printed error output:\n{}",
                command_name,
                stderr,
            )),
            _ => Ok(()),
        }
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}
