//! Incremental ingestion of commodity candles into a local DuckDB store.
//!
//! A run plans the missing part of each requested series, splits it into
//! request windows, fetches them through a shared rate limiter and session,
//! and writes normalized candles together with their daily summaries.

pub mod config;
pub mod chunker;
pub mod coverage;
pub mod limiter;
pub mod retry;
pub mod providers;
pub mod smartapi;
pub mod normalize;
pub mod storage;
pub mod memory;
pub mod writer;
pub mod report;
pub mod orchestrator;
pub mod catalog;

#[cfg(test)]
mod testing;

pub use config::*;
pub use chunker::*;
pub use coverage::*;
pub use limiter::*;
pub use retry::*;
pub use providers::*;
pub use smartapi::*;
pub use normalize::*;
pub use storage::*;
pub use memory::*;
pub use writer::*;
pub use report::*;
pub use orchestrator::*;
pub use catalog::*;
