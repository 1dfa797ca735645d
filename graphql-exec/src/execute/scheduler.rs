//! The cooperative work scheduler.
//!
//! A single driver per request pops tasks from LIFO stacks (depth-first
//! execution bounds in-flight state) and drives their futures through one
//! `FuturesUnordered` set. The immediate stack drains first, then the
//! deferred stack; serial tasks live on their own stack and run exclusively:
//! while a serial task executes no other task may start, and the next serial
//! task starts only once everything it spawned has drained. Between steps the
//! loop kicks the batch dispatcher.
//!
//! Branches are logical scopes of tasks: each has a running-task counter and
//! a completion signal fired when the counter returns to zero. Branch `-1`
//! (the system branch) is exempt from tracking. A branch's tasks must
//! register their child tasks before completing, otherwise the branch could
//! complete early.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::FutureExt;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::dispatch::BatchDispatcher;
use crate::error::ExecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u32);

/// A logical scope for scheduler tasks. The id is never reused within a
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BranchId(pub i32);

impl BranchId {
    /// Exempt from branch tracking; used for bookkeeping tasks.
    pub const SYSTEM: BranchId = BranchId(-1);
}

/// A unit of work the scheduler can drive.
pub(crate) trait ExecutorTask: Send {
    fn branch(&self) -> BranchId;

    fn is_serial(&self) -> bool {
        false
    }

    fn is_deferred(&self) -> bool {
        false
    }

    fn execute(self: Box<Self>, cancellation: CancellationToken) -> BoxFuture<'static, ()>;
}

struct Envelope {
    id: TaskId,
    branch: BranchId,
    serial: bool,
    task: Box<dyn ExecutorTask>,
}

struct BranchState {
    running: usize,
    total: usize,
    done: watch::Sender<bool>,
}

impl BranchState {
    fn new() -> Self {
        let (done, _) = watch::channel(false);
        BranchState {
            running: 0,
            total: 0,
            done,
        }
    }
}

struct SchedState {
    immediate: Vec<Envelope>,
    serial: Vec<Envelope>,
    deferred: Vec<Envelope>,
    branches: HashMap<i32, BranchState>,
    next_task: u32,
    next_branch: i32,
    cancelled: bool,
    /// While held, the deferred stack does not drain. The streaming driver
    /// holds it until the initial payload has been snapshotted, so deferred
    /// work (and its null propagation) cannot mutate data the initial
    /// response is about to deliver.
    deferred_held: bool,
}

pub(crate) struct WorkScheduler {
    state: Mutex<SchedState>,
    signal: Notify,
    cancellation: CancellationToken,
}

impl WorkScheduler {
    pub(crate) fn new(cancellation: CancellationToken) -> Arc<Self> {
        Arc::new(WorkScheduler {
            state: Mutex::new(SchedState {
                immediate: Vec::new(),
                serial: Vec::new(),
                deferred: Vec::new(),
                branches: HashMap::new(),
                next_task: 1,
                next_branch: 0,
                cancelled: false,
                deferred_held: false,
            }),
            signal: Notify::new(),
            cancellation,
        })
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Keeps deferred tasks parked until [`WorkScheduler::release_deferred`].
    pub(crate) fn hold_deferred(&self) {
        self.state.lock().deferred_held = true;
    }

    pub(crate) fn release_deferred(&self) {
        self.state.lock().deferred_held = false;
        self.signal.notify_one();
    }

    /// Allocates a fresh execution branch.
    pub(crate) fn create_branch(&self) -> BranchId {
        let mut state = self.state.lock();
        let id = state.next_branch;
        state.next_branch += 1;
        state.branches.insert(id, BranchState::new());
        BranchId(id)
    }

    /// Pushes a task onto its stack and bumps its branch's in-flight counter.
    /// A no-op after cancellation: pooled contexts are abandoned, not reused,
    /// so lingering tasks must not leak into a future request.
    pub(crate) fn register(&self, task: Box<dyn ExecutorTask>) -> TaskId {
        let mut state = self.state.lock();
        if state.cancelled || self.cancellation.is_cancelled() {
            return TaskId(0);
        }
        let id = TaskId(state.next_task);
        state.next_task += 1;
        let branch = task.branch();
        if branch != BranchId::SYSTEM {
            let entry = state
                .branches
                .entry(branch.0)
                .or_insert_with(BranchState::new);
            entry.running += 1;
            entry.total += 1;
        }
        let serial = task.is_serial();
        let envelope = Envelope {
            id,
            branch,
            serial,
            task,
        };
        if serial {
            state.serial.push(envelope);
        } else if envelope.task.is_deferred() {
            state.deferred.push(envelope);
        } else {
            state.immediate.push(envelope);
        }
        drop(state);
        self.signal.notify_one();
        id
    }

    pub(crate) fn register_all(&self, tasks: Vec<Box<dyn ExecutorTask>>) {
        for task in tasks {
            self.register(task);
        }
    }

    fn complete(&self, branch: BranchId) {
        if branch == BranchId::SYSTEM {
            return;
        }
        let mut state = self.state.lock();
        if let Some(entry) = state.branches.get_mut(&branch.0) {
            entry.running = entry.running.saturating_sub(1);
            if entry.running == 0 {
                // send_replace: the value must stick even with no subscriber
                // yet attached.
                entry.done.send_replace(true);
            }
        }
    }

    /// Awaits the given branch's completion signal or cancellation.
    ///
    /// Callers must only wait on branches that already have registered tasks;
    /// forks register their tasks before any await point, so this holds by
    /// construction.
    pub(crate) async fn wait_for_completion(&self, branch: BranchId) -> Result<(), ExecError> {
        if branch == BranchId::SYSTEM {
            return Ok(());
        }
        let receiver = {
            let state = self.state.lock();
            state.branches.get(&branch.0).map(|entry| entry.done.subscribe())
        };
        let Some(mut receiver) = receiver else {
            return Ok(());
        };
        if *receiver.borrow() {
            return Ok(());
        }
        loop {
            tokio::select! {
                changed = receiver.changed() => {
                    if changed.is_err() || *receiver.borrow() {
                        return Ok(());
                    }
                }
                _ = self.cancellation.cancelled() => {
                    return Err(ExecError::Cancelled);
                }
            }
        }
    }

    /// The dispatch loop: drives every registered task to completion and
    /// returns once the scheduler is quiescent.
    pub(crate) async fn run(&self, dispatcher: &Arc<BatchDispatcher>) -> Result<(), ExecError> {
        let mut inflight: FuturesUnordered<BoxFuture<'static, (TaskId, BranchId, bool)>> =
            FuturesUnordered::new();
        let mut serial_running = false;

        loop {
            if self.cancellation.is_cancelled() {
                self.mark_cancelled();
                return Err(ExecError::Cancelled);
            }

            dispatcher.begin_dispatch();

            if !serial_running {
                loop {
                    let envelope = {
                        let mut state = self.state.lock();
                        if let Some(envelope) = state.immediate.pop() {
                            Some(envelope)
                        } else if inflight.is_empty() {
                            // The serial lane only opens when nothing else is
                            // in flight; deferred work waits behind it.
                            match state.serial.pop() {
                                Some(envelope) => Some(envelope),
                                None if state.deferred_held => None,
                                None => state.deferred.pop(),
                            }
                        } else if state.serial.is_empty() && !state.deferred_held {
                            state.deferred.pop()
                        } else {
                            None
                        }
                    };
                    let Some(envelope) = envelope else { break };
                    let Envelope {
                        id,
                        branch,
                        serial,
                        task,
                    } = envelope;
                    tracing::trace!(task = id.0, branch = branch.0, serial, "starting task");
                    let cancellation = self.cancellation.clone();
                    inflight.push(
                        task.execute(cancellation)
                            .map(move |()| (id, branch, serial))
                            .boxed(),
                    );
                    if serial {
                        serial_running = true;
                        break;
                    }
                }
            }

            {
                let state = self.state.lock();
                let idle = inflight.is_empty()
                    && state.immediate.is_empty()
                    && state.serial.is_empty()
                    && state.deferred.is_empty();
                if idle {
                    return Ok(());
                }
            }

            tokio::select! {
                Some((id, branch, was_serial)) = inflight.next(), if !inflight.is_empty() => {
                    tracing::trace!(task = id.0, branch = branch.0, "task completed");
                    if was_serial {
                        serial_running = false;
                    }
                    self.complete(branch);
                }
                _ = self.signal.notified() => {}
                _ = dispatcher.progress_signal().notified() => {}
                _ = self.cancellation.cancelled() => {}
            }
        }
    }

    fn mark_cancelled(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        state.immediate.clear();
        state.serial.clear();
        state.deferred.clear();
    }
}
