//! Shared primitives used by all `hornet` crates.
//!
//! This crate is intentionally minimal and dependency-light, so it can sit at the bottom of the
//! dependency graph.

pub mod config;
pub mod error;
pub mod ids;
pub mod partition_set;
pub mod profiler;
