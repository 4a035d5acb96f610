//! Task-facing value types: priorities, handles, and handle groups.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::scheduler::TaskShared;

/// Dispatch priority of a task.
///
/// Priority only biases the position a runnable task takes in the shared
/// dispatch queue; it is an approximation, not a strict ordering contract.
/// No FIFO guarantee exists between tasks of the same priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Inserted at the front of the dispatch queue.
    High,
    /// Inserted near the midpoint of the dispatch queue.
    #[default]
    Medium,
    /// Inserted at the back of the dispatch queue.
    Low,
}

/// A reference-counted handle to a scheduled task.
///
/// Cloning a handle increments the underlying record's reference count and
/// dropping it decrements it, so external handle lifetime is fully decoupled
/// from execution lifetime: the scheduler holds one implicit reference to
/// every in-flight task, and a caller may drop its handle before or after the
/// work finishes without affecting correctness.
///
/// The empty handle ([`TaskHandle::none`]) references nothing; it is accepted
/// anywhere a dependency is, and is silently ignored there.
#[derive(Clone, Default)]
pub struct TaskHandle {
    raw: Option<RawTask>,
}

pub(crate) struct RawTask {
    shared: Arc<TaskShared>,
    index: u32,
}

impl Clone for RawTask {
    fn clone(&self) -> Self {
        self.shared.table.incref(self.index);
        RawTask {
            shared: Arc::clone(&self.shared),
            index: self.index,
        }
    }
}

impl Drop for RawTask {
    fn drop(&mut self) {
        self.shared.table.release(self.index);
    }
}

impl TaskHandle {
    /// The empty handle. Waiting on it returns `false`; using it as a
    /// dependency is a no-op.
    pub fn none() -> Self {
        TaskHandle { raw: None }
    }

    /// Wraps an already-counted reference: the slot's initial reference count
    /// covers the handle returned to the caller, so no increment happens
    /// here.
    pub(crate) fn adopt(shared: Arc<TaskShared>, index: u32) -> Self {
        TaskHandle {
            raw: Some(RawTask { shared, index }),
        }
    }

    pub(crate) fn raw(&self) -> Option<&RawTask> {
        self.raw.as_ref()
    }

    /// Blocks until the task completes. Returns `false` only for the empty
    /// handle.
    ///
    /// Beware that a task abandoned by a scheduler shutdown never completes,
    /// so an unbounded wait on it never returns.
    pub fn wait(&self) -> bool {
        let Some(raw) = &self.raw else { return false };
        let record = raw.shared.table.get(raw.index);
        let state = record.data.state.lock().unwrap();
        let _state = record
            .data
            .done
            .wait_while(state, |state| !state.complete)
            .unwrap();
        true
    }

    /// Blocks until the task completes or `timeout` elapses. The timeout
    /// affects only the waiter; the task keeps running and completes
    /// independently.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(raw) = &self.raw else { return false };
        let record = raw.shared.table.get(raw.index);
        let state = record.data.state.lock().unwrap();
        let (_state, result) = record
            .data
            .done
            .wait_timeout_while(state, timeout, |state| !state.complete)
            .unwrap();
        !result.timed_out()
    }

    /// Whether the task has finished executing (successfully or not).
    pub fn is_complete(&self) -> bool {
        let Some(raw) = &self.raw else { return false };
        let record = raw.shared.table.get(raw.index);
        let state = record.data.state.lock().unwrap();
        state.complete
    }

    /// Whether the task ran to completion without returning an error or
    /// panicking. Always `false` before completion; dependents that need
    /// failure-aware chaining inspect this after waiting.
    pub fn succeeded(&self) -> bool {
        let Some(raw) = &self.raw else { return false };
        let record = raw.shared.table.get(raw.index);
        let state = record.data.state.lock().unwrap();
        state.complete && state.succeeded
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.raw {
            Some(raw) => f.debug_tuple("TaskHandle").field(&raw.index).finish(),
            None => f.write_str("TaskHandle(none)"),
        }
    }
}

impl RawTask {
    pub(crate) fn shared(&self) -> &Arc<TaskShared> {
        &self.shared
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }
}

/// An ordered collection of task handles, usable both as an aggregate wait
/// target and as a dependency set for [`Scheduler::submit_after`].
///
/// [`Scheduler::submit_after`]: crate::Scheduler::submit_after
#[derive(Debug, Clone, Default)]
pub struct TaskGroup {
    tasks: Vec<TaskHandle>,
}

impl TaskGroup {
    pub fn new() -> Self {
        TaskGroup::default()
    }

    pub fn add(&mut self, task: TaskHandle) {
        self.tasks.push(task);
    }

    pub fn handles(&self) -> &[TaskHandle] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits on every member in turn, indefinitely.
    pub fn wait_all(&self) -> bool {
        for task in &self.tasks {
            task.wait();
        }
        true
    }

    /// Waits on every member in turn, failing fast once the cumulative
    /// elapsed time exceeds `timeout`.
    pub fn wait_all_timeout(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        for task in &self.tasks {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return false;
            }
            if !task.wait_timeout(timeout - elapsed) {
                return false;
            }
        }
        true
    }
}

impl From<Vec<TaskHandle>> for TaskGroup {
    fn from(tasks: Vec<TaskHandle>) -> Self {
        TaskGroup { tasks }
    }
}

impl FromIterator<TaskHandle> for TaskGroup {
    fn from_iter<I: IntoIterator<Item = TaskHandle>>(iter: I) -> Self {
        TaskGroup {
            tasks: iter.into_iter().collect(),
        }
    }
}

impl Extend<TaskHandle> for TaskGroup {
    fn extend<I: IntoIterator<Item = TaskHandle>>(&mut self, iter: I) {
        self.tasks.extend(iter);
    }
}
