//! The data-parallel job system.
//!
//! Where the scheduler runs dependency graphs of one-shot closures, the job
//! system applies one closure independently to every index of a range:
//! fork-join, no dependencies, no priorities. The surviving indices (after an
//! optional predicate pass) are split into contiguous slices, one per worker,
//! and each slice lands on that worker's private queue to bound contention
//! and keep slice locality.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::error::SchedulerError;
use crate::table::{Recycle, SlotTable};

const INITIAL_SLOTS: usize = 256;

type JobFn = Arc<dyn Fn(usize) + Send + Sync + 'static>;

/// One contiguous slice of a job's compacted index list.
struct Batch {
    index: u32,
    indices: Vec<usize>,
}

pub(crate) struct JobShared {
    table: SlotTable<JobRecord>,
    running: AtomicBool,
}

/// One job record. `remaining` counts surviving elements; each worker
/// subtracts however many it consumed in one batch, and the subtraction that
/// reaches zero completes the job.
#[derive(Default)]
pub(crate) struct JobRecord {
    state: Mutex<JobState>,
    done: Condvar,
    remaining: AtomicUsize,
}

#[derive(Default)]
struct JobState {
    complete: bool,
    work: Option<JobFn>,
}

impl Recycle for JobRecord {
    fn recycle(&self) {
        self.state.lock().unwrap().work = None;
    }
}

/// A fork-join worker pool for embarrassingly-parallel per-element work.
///
/// Independent from any [`Scheduler`]: it keeps its own handle table and its
/// own threads. With a worker count of zero, [`JobSystem::schedule`] runs
/// every index inline on the caller's stack.
///
/// [`Scheduler`]: crate::Scheduler
pub struct JobSystem {
    shared: Arc<JobShared>,
    senders: Mutex<Vec<Sender<Batch>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl JobSystem {
    pub fn new(worker_count: usize) -> Result<Self, SchedulerError> {
        let shared = Arc::new(JobShared {
            table: SlotTable::new(INITIAL_SLOTS, None),
            running: AtomicBool::new(true),
        });

        let system = JobSystem {
            shared: Arc::clone(&shared),
            senders: Mutex::new(Vec::with_capacity(worker_count)),
            workers: Mutex::new(Vec::with_capacity(worker_count)),
            worker_count,
        };

        for i in 0..worker_count {
            let (sender, receiver) = unbounded();
            let shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("workgraph-job-{i}"))
                .spawn(move || worker_loop(shared, receiver));
            match spawned {
                Ok(handle) => {
                    system.senders.lock().unwrap().push(sender);
                    system.workers.lock().unwrap().push(handle);
                }
                Err(err) => {
                    system.shutdown();
                    return Err(err.into());
                }
            }
        }

        tracing::debug!(workers = worker_count, "job system started");
        Ok(system)
    }

    /// Schedules `work(i)` for every `i` in `0..count`. By the time the
    /// returned handle's wait succeeds, the closure has been invoked exactly
    /// once per index.
    pub fn schedule<F>(&self, count: usize, work: F) -> JobHandle
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.schedule_where(count, |_| true, work)
    }

    /// Like [`JobSystem::schedule`] but filters the range through `predicate`
    /// up front; only surviving indices are distributed. If nothing survives
    /// (or `count` is zero) the returned handle is already complete and no
    /// worker time is spent. Scheduling after shutdown abandons the work and
    /// returns an already-complete handle, so waits on it still return.
    pub fn schedule_where<P, F>(&self, count: usize, predicate: P, work: F) -> JobHandle
    where
        P: Fn(usize) -> bool,
        F: Fn(usize) + Send + Sync + 'static,
    {
        let indices: Vec<usize> = (0..count).filter(|&i| predicate(i)).collect();

        if indices.is_empty() {
            return self.complete_handle();
        }

        if self.worker_count == 0 {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                for &i in &indices {
                    work(i);
                }
            }));
            if let Err(payload) = outcome {
                tracing::warn!(
                    "job panicked: {}",
                    crate::panic_message(payload.as_ref())
                );
            }
            return self.complete_handle();
        }

        // Shutdown clears the senders under this lock, so once the check
        // below passes the queues stay connected for the whole distribution.
        let senders = self.senders.lock().unwrap();
        if senders.is_empty() {
            drop(senders);
            tracing::warn!("job scheduled during shutdown; work abandoned");
            return self.complete_handle();
        }

        // One reference for the in-flight job, one for the caller's handle.
        let (index, slot) = self.shared.table.allocate(2);
        let record = &slot.data;
        {
            let mut state = record.state.lock().unwrap();
            state.complete = false;
            state.work = Some(Arc::new(work));
        }
        record.remaining.store(indices.len(), Ordering::Release);

        // The record is fully populated before any batch is sent, so workers
        // never observe a half-built job.
        let slices = senders.len().min(indices.len());
        let per_slice = indices.len().div_ceil(slices);
        for (worker, slice) in indices.chunks(per_slice).enumerate() {
            let batch = Batch {
                index,
                indices: slice.to_vec(),
            };
            // Workers drop their receivers only after shutdown clears the
            // senders, which needs this lock; the send cannot fail here.
            let _ = senders[worker].send(batch);
        }

        JobHandle::adopt(Arc::clone(&self.shared), index)
    }

    /// Allocates an already-complete record: only the caller's handle
    /// references it, since there is no in-flight work.
    fn complete_handle(&self) -> JobHandle {
        let (index, slot) = self.shared.table.allocate(1);
        let mut state = slot.data.state.lock().unwrap();
        state.complete = true;
        state.work = None;
        slot.data.remaining.store(0, Ordering::Release);
        drop(state);

        JobHandle::adopt(Arc::clone(&self.shared), index)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Stops the pool and joins every worker. Idempotent. Batches still
    /// queued are abandoned without executing.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        // Dropping the senders disconnects every worker's queue; workers
        // drain what is buffered (skipping execution) and exit.
        self.senders.lock().unwrap().clear();
        let mut workers = self.workers.lock().unwrap();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
        tracing::debug!("job system stopped");
    }

    #[cfg(test)]
    fn free_len(&self) -> usize {
        self.shared.table.free_len()
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<JobShared>, receiver: Receiver<Batch>) {
    for batch in receiver.iter() {
        if !shared.running.load(Ordering::Acquire) {
            // Shutdown: drain the queue without executing anything.
            continue;
        }

        let slot = shared.table.get(batch.index);
        let record = &slot.data;
        let work = record.state.lock().unwrap().work.clone();
        let consumed = batch.indices.len();

        if let Some(work) = work {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                for &i in &batch.indices {
                    work(i);
                }
            }));
            if let Err(payload) = outcome {
                // The slice still counts as consumed below, so a panicking
                // job cannot leave its waiters hanging.
                tracing::warn!(
                    "job batch panicked: {}",
                    crate::panic_message(payload.as_ref())
                );
            }
        }

        if record.remaining.fetch_sub(consumed, Ordering::AcqRel) == consumed {
            let mut state = record.state.lock().unwrap();
            state.complete = true;
            state.work = None;
            drop(state);
            record.done.notify_all();
            shared.table.release(batch.index);
        }
    }
}

/// A reference-counted handle to a scheduled job. Same ownership semantics
/// as [`TaskHandle`]: cloning and dropping adjust the record's reference
/// count, and the job system keeps one implicit reference while slices are
/// in flight.
///
/// [`TaskHandle`]: crate::TaskHandle
#[derive(Clone, Default)]
pub struct JobHandle {
    raw: Option<RawJob>,
}

struct RawJob {
    shared: Arc<JobShared>,
    index: u32,
}

impl Clone for RawJob {
    fn clone(&self) -> Self {
        self.shared.table.incref(self.index);
        RawJob {
            shared: Arc::clone(&self.shared),
            index: self.index,
        }
    }
}

impl Drop for RawJob {
    fn drop(&mut self) {
        self.shared.table.release(self.index);
    }
}

impl JobHandle {
    /// The empty handle; waits on it return `false`.
    pub fn none() -> Self {
        JobHandle { raw: None }
    }

    fn adopt(shared: Arc<JobShared>, index: u32) -> Self {
        JobHandle {
            raw: Some(RawJob { shared, index }),
        }
    }

    /// Blocks until every element of the job has been processed. Returns
    /// `false` only for the empty handle.
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

    /// Blocks until the job completes or `timeout` elapses; the timeout
    /// affects only the waiter.
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

    pub fn is_complete(&self) -> bool {
        let Some(raw) = &self.raw else { return false };
        let record = raw.shared.table.get(raw.index);
        let state = record.data.state.lock().unwrap();
        state.complete
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.raw {
            Some(raw) => f.debug_tuple("JobHandle").field(&raw.index).finish(),
            None => f.write_str("JobHandle(none)"),
        }
    }
}
