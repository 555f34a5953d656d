//! Queues and dispatchers for running many LLM calls at once.

pub mod dispatch;
pub mod work;
