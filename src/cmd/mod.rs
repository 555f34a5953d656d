//! Command-line entry points.

pub mod analyze;
pub mod schema;
