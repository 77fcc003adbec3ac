//! Transfer engine - chunked, resumable, integrity-checked remote fetches
//!
//! This module implements the fetch pipeline:
//! - Range planning and disjoint chunk workers
//! - Crash-safe progress in SQLite
//! - Exponential backoff on transient failures
//! - Single-stream fallback for servers without range support
//! - Cooperative cancellation

mod backoff;
mod chunk_worker;
mod coordinator;
mod planner;
mod progress;
mod single_stream;
mod transfer;

pub use coordinator::*;
pub use planner::*;
pub use progress::*;
pub use single_stream::*;
pub use transfer::*;
