//! StrobeScan CLI library
//!
//! The argument surface and output sinks, separated from `main` so the
//! integration tests can exercise them without spawning a process.

pub mod args;
pub mod output;

pub use args::{Args, OutputFormat};
pub use output::{NdjsonSink, TextSink};
