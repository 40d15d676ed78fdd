//! Named worker queues and the delayed-task facility.
//!
//! A `Stage` with one worker is a strict FIFO: the migration stage relies on
//! that to keep schema merges from interleaving. Waiting on a task from one of
//! the stage's own workers would park the only thread able to run it, so
//! `TaskHandle::wait` refuses instead of hanging.

use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage {stage} is shut down")]
    ShutDown { stage: String },
    #[error("waiting on stage {stage} from its own worker would deadlock")]
    WouldDeadlock { stage: String },
    #[error("task on stage {stage} ended without a result")]
    Abandoned { stage: String },
    #[error("task on stage {stage} did not finish within {waited_ms}ms")]
    Timeout { stage: String, waited_ms: u128 },
    #[error("failed to spawn worker for stage {stage}: {source}")]
    Spawn {
        stage: String,
        #[source]
        source: io::Error,
    },
}

type Job = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct StageQueue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct StageShared {
    name: String,
    queue: Mutex<StageQueue>,
    available: Condvar,
    in_flight: AtomicUsize,
    workers: Mutex<HashSet<ThreadId>>,
}

impl StageShared {
    fn is_worker(&self, id: ThreadId) -> bool {
        self.workers.lock().contains(&id)
    }
}

pub struct Stage {
    shared: Arc<StageShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Stage {
    pub fn new(name: impl Into<String>, workers: usize) -> Result<Self, StageError> {
        let shared = Arc::new(StageShared {
            name: name.into(),
            queue: Mutex::new(StageQueue::default()),
            available: Condvar::new(),
            in_flight: AtomicUsize::new(0),
            workers: Mutex::new(HashSet::new()),
        });
        let mut handles = Vec::with_capacity(workers.max(1));
        for idx in 0..workers.max(1) {
            let worker = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", shared.name, idx))
                .spawn(move || worker_loop(worker))
                .map_err(|source| StageError::Spawn {
                    stage: shared.name.clone(),
                    source,
                })?;
            shared.workers.lock().insert(handle.thread().id());
            handles.push(handle);
        }
        Ok(Self {
            shared,
            handles: Mutex::new(handles),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queues a fire-and-forget job.
    pub fn execute<F>(&self, job: F) -> Result<(), StageError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return Err(StageError::ShutDown {
                stage: self.shared.name.clone(),
            });
        }
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        queue.jobs.push_back(Box::new(job));
        drop(queue);
        self.shared.available.notify_one();
        Ok(())
    }

    /// Queues a job whose result can be awaited through the returned handle.
    pub fn submit<T, F>(&self, job: F) -> Result<TaskHandle<T>, StageError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        self.execute(move || {
            let _ = tx.send(job());
        })?;
        Ok(TaskHandle {
            receiver: rx,
            stage: self.shared.clone(),
        })
    }

    /// Jobs queued or running.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn is_worker_thread(&self) -> bool {
        self.shared.is_worker(thread::current().id())
    }

    /// Stops accepting work, lets the workers drain what is queued and joins
    /// them. Safe to call more than once.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown && self.handles.lock().is_empty() {
                return;
            }
            queue.shutdown = true;
        }
        self.shared.available.notify_all();
        let current = thread::current().id();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("event=stage_worker_join_failed stage={}", self.shared.name);
            }
        }
        debug!("event=stage_stopped stage={}", self.shared.name);
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<StageShared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break Some(job);
                }
                if queue.shutdown {
                    break None;
                }
                shared.available.wait(&mut queue);
            }
        };
        let Some(job) = job else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("event=stage_task_panicked stage={}", shared.name);
        }
        shared.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct TaskHandle<T> {
    receiver: mpsc::Receiver<T>,
    stage: Arc<StageShared>,
}

impl<T> TaskHandle<T> {
    pub fn wait(self) -> Result<T, StageError> {
        self.guard_against_self_wait()?;
        self.receiver.recv().map_err(|_| StageError::Abandoned {
            stage: self.stage.name.clone(),
        })
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<T, StageError> {
        self.guard_against_self_wait()?;
        self.receiver.recv_timeout(timeout).map_err(|err| match err {
            mpsc::RecvTimeoutError::Timeout => StageError::Timeout {
                stage: self.stage.name.clone(),
                waited_ms: timeout.as_millis(),
            },
            mpsc::RecvTimeoutError::Disconnected => StageError::Abandoned {
                stage: self.stage.name.clone(),
            },
        })
    }

    fn guard_against_self_wait(&self) -> Result<(), StageError> {
        if self.stage.is_worker(thread::current().id()) {
            return Err(StageError::WouldDeadlock {
                stage: self.stage.name.clone(),
            });
        }
        Ok(())
    }
}

pub type ScheduledTask = Box<dyn FnOnce() + Send>;

/// Runs work after a delay, off every stage.
pub trait TaskScheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: ScheduledTask);
}

struct ScheduledEntry {
    due: Instant,
    seq: u64,
    task: ScheduledTask,
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for ScheduledEntry {}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEntry {
    // Reversed so the max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct SchedulerState {
    entries: BinaryHeap<ScheduledEntry>,
    shutdown: bool,
}

struct SchedulerShared {
    state: Mutex<SchedulerState>,
    wake: Condvar,
    seq: AtomicU64,
}

/// Single background thread firing tasks at their deadline. Pending tasks are
/// discarded on shutdown.
pub struct ThreadScheduler {
    shared: Arc<SchedulerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadScheduler {
    pub fn new(name: &str) -> Result<Self, StageError> {
        let shared = Arc::new(SchedulerShared {
            state: Mutex::new(SchedulerState::default()),
            wake: Condvar::new(),
            seq: AtomicU64::new(0),
        });
        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || scheduler_loop(worker))
            .map_err(|source| StageError::Spawn {
                stage: name.to_string(),
                source,
            })?;
        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn pending(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn shutdown(&self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("event=scheduler_join_failed");
            }
        }
    }
}

impl TaskScheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            warn!(
                "event=scheduled_task_rejected reason=shutdown delay_ms={}",
                delay.as_millis()
            );
            return;
        }
        state.entries.push(ScheduledEntry {
            due: Instant::now() + delay,
            seq: self.shared.seq.fetch_add(1, Ordering::Relaxed),
            task,
        });
        drop(state);
        self.shared.wake.notify_one();
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn scheduler_loop(shared: Arc<SchedulerShared>) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                let next_due = state.entries.peek().map(|entry| entry.due);
                match next_due {
                    Some(due) if due <= Instant::now() => {
                        break state.entries.pop().map(|entry| entry.task);
                    }
                    Some(due) => {
                        shared.wake.wait_until(&mut state, due);
                    }
                    None => shared.wake.wait(&mut state),
                }
            }
        };
        if let Some(task) = task {
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!("event=scheduled_task_panicked");
            }
        }
    }
}
