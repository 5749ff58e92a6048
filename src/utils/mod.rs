//! Shared helpers: tracing bootstrap and retry policies.

pub mod bootstrap;
pub mod retry;
