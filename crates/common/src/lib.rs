//! Ambient infrastructure shared by the parload crates: environment-tunable
//! knobs, tracing setup, backoff, the async FIFO queue the worker pools hang
//! off of, and the fatal-error shutdown signal.

pub mod backoff;
pub mod env;
pub mod fifo_queue;
pub mod knobs;
pub mod shutdown;
