// ABOUTME: Library root for lockstep - exposes public types for testing.
// ABOUTME: The main binary is in main.rs.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod remote;
pub mod report;
pub mod rollback;
pub mod services;
pub mod snapshot;
pub mod verify;
