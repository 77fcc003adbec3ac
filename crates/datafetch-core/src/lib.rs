//! Datafetch Core - Transfer Engine
//!
//! This crate provides the core transfer functionality for Datafetch.
//! It handles chunked resumable downloads, checksum verification, and
//! archive extraction.

pub mod checksum;
mod error;
mod extract;

pub mod engine;

pub use error::*;
pub use extract::{extract, ExtractOptions};

pub use engine::{CancelHandle, TransferEngine};
pub use datafetch_types as types;
