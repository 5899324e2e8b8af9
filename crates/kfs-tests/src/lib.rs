//! Integration and end-to-end tests for KFS.
//!
//! This crate provides:
//! - A table harness that opens shard tables in temporary directories
//! - Integration tests for routing, fan-out, eviction, and persistence

pub mod harness;

pub use harness::{init_tracing, TestTable};
