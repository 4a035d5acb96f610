use thiserror::Error;

/// Errors surfaced while constructing a scheduler or job system.
///
/// Failures *inside* scheduled work are not part of this taxonomy: a task
/// closure reports failure through its own `anyhow::Result`, which is caught
/// at the worker boundary and recorded on the task record instead of being
/// propagated.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}
