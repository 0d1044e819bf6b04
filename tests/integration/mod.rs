//! Integration test suite for switchboard.
//!
//! These tests drive the orchestrator end to end with mock workers, from
//! raw request to response.
//!
//! # Test Categories
//!
//! - `scenarios`: single requests through success, failure, retry and timeout
//! - `concurrency`: ceilings, cancellation and idempotent aggregation
//! - `properties`: randomized dependency graphs
//!
//! Timing-sensitive tests run on paused tokio time, so none of them sleep
//! for real.

mod fixtures;

mod concurrency;
mod properties;
