#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod error;
mod job;
mod scheduler;
mod table;
mod task;

use std::any::Any;

pub use crate::error::SchedulerError;
pub use crate::job::{JobHandle, JobSystem};
pub use crate::scheduler::Scheduler;
pub use crate::task::{Priority, TaskGroup, TaskHandle};

/// Installs a global `tracing` subscriber reading the filter from
/// `RUST_LOG`, for binaries that don't bring their own.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

/// Renders a caught panic payload for the failure log. Panics raised via
/// `panic!` carry a `&str` or `String`; anything else is opaque.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("unknown panic payload")
    }
}
