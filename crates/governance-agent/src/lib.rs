//! Composition root pieces for the governance agent
//!
//! Split out of the binary so the router can be exercised by integration tests.

pub mod api;
pub mod config;
pub mod monitor;
