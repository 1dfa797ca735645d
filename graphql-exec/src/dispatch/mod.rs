//! The batch dispatcher.
//!
//! Coordinates "batches" — groups of key lookups coalesced by data-loader
//! helpers. A single background coordinator per dispatcher (started lazily)
//! evaluates enqueued batches: a batch that has stopped growing (observed via
//! [`Batch::touch`]) is dispatched proactively for latency; under continuous
//! load a max-age ceiling prevents starvation. Older, settled batches take
//! precedence so newer ones can accumulate more keys.
//!
//! Dispatched batches run as spawned futures with no capacity limit: a
//! resolver running inside a dispatched batch may schedule and await further
//! batches without deadlocking.

use std::cmp::Ordering;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::FutureExt;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::execute::resolver::ResolverError;

/// Default ceiling a batch may wait before it is dispatched regardless of
/// growth, in microseconds.
pub const DEFAULT_MAX_BATCH_WAIT_US: u64 = 50_000;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Enqueued,
    Dispatching,
    Completed,
}

/// A group of coalesced key lookups.
pub trait Batch: Send + Sync + 'static {
    fn size(&self) -> usize;
    fn status(&self) -> BatchStatus;
    fn created_at(&self) -> Instant;
    fn modified_at(&self) -> Instant;
    /// Double-poll quiescence probe: returns `true` once the batch has been
    /// touched twice with no intervening modification.
    fn touch(&self) -> bool;
    /// Evaluates and dispatches the batch. Errors are reported to the
    /// diagnostic sink; propagating them to awaiting tasks is the batch's
    /// own responsibility.
    fn dispatch(
        self: Arc<Self>,
        cancellation: CancellationToken,
    ) -> BoxFuture<'static, Result<(), ResolverError>>;
}

/// Timestamp and touch bookkeeping for [`Batch`] implementors.
#[derive(Debug)]
pub struct BatchStamp {
    created: Instant,
    inner: Mutex<StampInner>,
}

#[derive(Debug)]
struct StampInner {
    modified: Instant,
    touches: u32,
}

impl BatchStamp {
    pub fn new() -> Self {
        let now = Instant::now();
        BatchStamp {
            created: now,
            inner: Mutex::new(StampInner {
                modified: now,
                touches: 0,
            }),
        }
    }

    /// Call when keys are added: resets the quiescence probe.
    pub fn modified(&self) {
        let mut inner = self.inner.lock();
        inner.modified = Instant::now();
        inner.touches = 0;
    }

    pub fn touch(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.touches += 1;
        inner.touches >= 2
    }

    pub fn created_at(&self) -> Instant {
        self.created
    }

    pub fn modified_at(&self) -> Instant {
        self.inner.lock().modified
    }
}

impl Default for BatchStamp {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEvent {
    CoordinatorStarted,
    Enqueued,
    Evaluated,
    Dispatched,
    CoordinatorCompleted,
}

pub trait DispatchObserver: Send + Sync {
    fn on_event(&self, event: DispatchEvent);
}

struct DispatcherState {
    enqueued: Vec<Arc<dyn Batch>>,
    observers: Vec<Arc<dyn DispatchObserver>>,
    last_enqueued: Option<Instant>,
}

/// Per-request-scope batch dispatcher. All batch mutation happens under the
/// single `sync` mutex; event broadcasts happen outside locks.
pub struct BatchDispatcher {
    sync: Mutex<DispatcherState>,
    signal: Notify,
    progress: Notify,
    cancellation: CancellationToken,
    max_batch_wait: Duration,
    started: AtomicBool,
}

impl BatchDispatcher {
    pub fn new(max_batch_wait: Duration) -> Arc<Self> {
        Arc::new(BatchDispatcher {
            sync: Mutex::new(DispatcherState {
                enqueued: Vec::new(),
                observers: Vec::new(),
                last_enqueued: None,
            }),
            signal: Notify::new(),
            progress: Notify::new(),
            cancellation: CancellationToken::new(),
            max_batch_wait,
            started: AtomicBool::new(false),
        })
    }

    /// Enqueues a batch for evaluation.
    pub fn schedule(self: &Arc<Self>, batch: Arc<dyn Batch>) {
        {
            let mut state = self.sync.lock();
            state.enqueued.push(batch);
            state.last_enqueued = Some(Instant::now());
        }
        self.emit(DispatchEvent::Enqueued);
        self.ensure_started();
        self.signal.notify_one();
    }

    /// Signals the coordinator to start or continue evaluation.
    pub fn begin_dispatch(self: &Arc<Self>) {
        self.ensure_started();
        self.signal.notify_one();
    }

    pub fn subscribe(&self, observer: Arc<dyn DispatchObserver>) {
        self.sync.lock().observers.push(observer);
    }

    /// A signal fired whenever an in-flight dispatch completes; the work
    /// scheduler parks on it between steps.
    pub fn progress_signal(&self) -> &Notify {
        &self.progress
    }

    /// Cancels the coordinator and lets it drain. Subsequent schedules are
    /// ignored by the exiting coordinator.
    pub fn shutdown(&self) {
        self.cancellation.cancel();
        self.signal.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    fn ensure_started(self: &Arc<Self>) {
        if self
            .started
            .compare_exchange(
                false,
                true,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            )
            .is_ok()
        {
            tokio::spawn(self.clone().run());
        }
    }

    fn emit(&self, event: DispatchEvent) {
        let observers: Vec<Arc<dyn DispatchObserver>> = self.sync.lock().observers.clone();
        for observer in observers {
            observer.on_event(event);
        }
    }

    async fn run(self: Arc<Self>) {
        self.emit(DispatchEvent::CoordinatorStarted);
        tracing::trace!("batch dispatch coordinator started");
        let mut inflight: FuturesUnordered<BoxFuture<'static, Result<(), ResolverError>>> =
            FuturesUnordered::new();

        loop {
            if self.cancellation.is_cancelled() {
                break;
            }

            // Reap completed dispatches without blocking.
            let mut completed_any = false;
            while let Some(Some(result)) = inflight.next().now_or_never() {
                completed_any = true;
                if let Err(error) = result {
                    tracing::error!(error = %error.message, "batch dispatch failed");
                }
            }
            if completed_any {
                self.progress.notify_waiters();
            }

            let drained: Vec<Arc<dyn Batch>> = {
                let mut state = self.sync.lock();
                state.enqueued.drain(..).collect()
            };

            if drained.is_empty() && inflight.is_empty() {
                tokio::select! {
                    _ = self.signal.notified() => {}
                    _ = self.cancellation.cancelled() => {}
                }
                continue;
            }

            let mut dispatched_any = false;
            if !drained.is_empty() {
                self.emit(DispatchEvent::Evaluated);
                // Oldest modification first: settled batches dispatch ahead
                // of ones still accumulating keys.
                let mut queue: std::collections::BinaryHeap<PrioritizedBatch> =
                    drained.into_iter().map(PrioritizedBatch).collect();
                let mut keep: Vec<Arc<dyn Batch>> = Vec::new();
                while let Some(PrioritizedBatch(batch)) = queue.pop() {
                    let settled = batch.touch();
                    let age = batch.created_at().elapsed();
                    if settled || age >= self.max_batch_wait {
                        tracing::trace!(size = batch.size(), "dispatching batch");
                        inflight.push(batch.dispatch(self.cancellation.clone()));
                        self.emit(DispatchEvent::Dispatched);
                        dispatched_any = true;
                    } else {
                        keep.push(batch);
                    }
                }
                if !keep.is_empty() {
                    let mut state = self.sync.lock();
                    // Newer enqueues may have arrived; keep them behind the
                    // retained batches.
                    keep.append(&mut state.enqueued);
                    state.enqueued = keep;
                }
            }

            if !dispatched_any {
                let recent_activity = completed_any
                    || self
                        .sync
                        .lock()
                        .last_enqueued
                        .is_some_and(|at| at.elapsed() < POLL_INTERVAL);
                if recent_activity {
                    tokio::task::yield_now().await;
                } else {
                    tokio::select! {
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                        _ = self.signal.notified() => {}
                        result = inflight.next(), if !inflight.is_empty() => {
                            if let Some(Err(error)) = result {
                                tracing::error!(error = %error.message, "batch dispatch failed");
                            }
                            self.progress.notify_waiters();
                        }
                        _ = self.cancellation.cancelled() => {}
                    }
                }
            }
        }

        self.emit(DispatchEvent::CoordinatorCompleted);
        tracing::trace!("batch dispatch coordinator completed");
    }
}

struct PrioritizedBatch(Arc<dyn Batch>);

impl PartialEq for PrioritizedBatch {
    fn eq(&self, other: &Self) -> bool {
        self.0.modified_at() == other.0.modified_at()
    }
}

impl Eq for PrioritizedBatch {}

impl PartialOrd for PrioritizedBatch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrioritizedBatch {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap and the oldest modification must
        // pop first.
        other.0.modified_at().cmp(&self.0.modified_at())
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex as SyncMutex;
    use tokio::sync::oneshot;

    use super::*;

    struct TestBatch {
        stamp: BatchStamp,
        status: SyncMutex<BatchStatus>,
        on_dispatch: SyncMutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl TestBatch {
        fn new(on_dispatch: impl FnOnce() + Send + 'static) -> Arc<Self> {
            Arc::new(TestBatch {
                stamp: BatchStamp::new(),
                status: SyncMutex::new(BatchStatus::Enqueued),
                on_dispatch: SyncMutex::new(Some(Box::new(on_dispatch))),
            })
        }
    }

    impl Batch for TestBatch {
        fn size(&self) -> usize {
            1
        }

        fn status(&self) -> BatchStatus {
            *self.status.lock()
        }

        fn created_at(&self) -> Instant {
            self.stamp.created_at()
        }

        fn modified_at(&self) -> Instant {
            self.stamp.modified_at()
        }

        fn touch(&self) -> bool {
            self.stamp.touch()
        }

        fn dispatch(
            self: Arc<Self>,
            _cancellation: CancellationToken,
        ) -> BoxFuture<'static, Result<(), ResolverError>> {
            *self.status.lock() = BatchStatus::Dispatching;
            let callback = self.on_dispatch.lock().take();
            async move {
                if let Some(callback) = callback {
                    callback();
                }
                *self.status.lock() = BatchStatus::Completed;
                Ok(())
            }
            .boxed()
        }
    }

    struct RecordingObserver(SyncMutex<Vec<DispatchEvent>>);

    impl DispatchObserver for RecordingObserver {
        fn on_event(&self, event: DispatchEvent) {
            self.0.lock().push(event);
        }
    }

    #[tokio::test]
    async fn touched_batches_dispatch_without_waiting_for_max_age() {
        let dispatcher = BatchDispatcher::new(Duration::from_secs(30));
        let (tx, rx) = oneshot::channel();
        let tx = SyncMutex::new(Some(tx));
        dispatcher.schedule(TestBatch::new(move || {
            let _ = tx.lock().take().map(|tx| tx.send(()));
        }));
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("batch must dispatch before the max-age ceiling")
            .expect("dispatch callback");
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn observers_see_the_event_lifecycle() {
        let observer = Arc::new(RecordingObserver(SyncMutex::new(Vec::new())));
        let dispatcher = BatchDispatcher::new(Duration::from_millis(50));
        dispatcher.subscribe(observer.clone());
        let (tx, rx) = oneshot::channel();
        let tx = SyncMutex::new(Some(tx));
        dispatcher.schedule(TestBatch::new(move || {
            let _ = tx.lock().take().map(|tx| tx.send(()));
        }));
        rx.await.expect("dispatched");
        // Give the coordinator a beat to finish emitting.
        tokio::task::yield_now().await;
        let events = observer.0.lock().clone();
        assert!(events.contains(&DispatchEvent::Enqueued));
        assert!(events.contains(&DispatchEvent::Evaluated));
        assert!(events.contains(&DispatchEvent::Dispatched));
        let enqueued_at = events
            .iter()
            .position(|e| *e == DispatchEvent::Enqueued)
            .expect("enqueued event");
        let dispatched_at = events
            .iter()
            .position(|e| *e == DispatchEvent::Dispatched)
            .expect("dispatched event");
        assert!(enqueued_at < dispatched_at);
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn nested_batches_do_not_deadlock() {
        let dispatcher = BatchDispatcher::new(Duration::from_millis(50));
        let mut outer_results = Vec::new();
        for _ in 0..8 {
            let (outer_tx, outer_rx) = oneshot::channel();
            let (inner_tx, inner_rx) = oneshot::channel();
            let inner_tx = SyncMutex::new(Some(inner_tx));
            let inner = TestBatch::new(move || {
                let _ = inner_tx.lock().take().map(|tx| tx.send(()));
            });
            let nested_dispatcher = dispatcher.clone();
            let outer_tx = SyncMutex::new(Some((outer_tx, inner_rx)));
            let outer = OuterBatch::new(move || {
                let (outer_tx, inner_rx) = outer_tx.lock().take().expect("dispatch once");
                nested_dispatcher.schedule(inner.clone());
                async move {
                    // The outer dispatch completes only after the nested
                    // batch dispatched; a capacity limit would deadlock here.
                    inner_rx.await.expect("inner batch dispatched");
                    let _ = outer_tx.send(());
                }
                .boxed()
            });
            dispatcher.schedule(outer);
            outer_results.push(outer_rx);
        }
        for rx in outer_results {
            tokio::time::timeout(Duration::from_secs(5), rx)
                .await
                .expect("no deadlock")
                .expect("outer completed");
        }
        dispatcher.shutdown();
    }

    struct OuterBatch {
        stamp: BatchStamp,
        body: SyncMutex<Option<Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>>>,
    }

    impl OuterBatch {
        fn new(body: impl FnOnce() -> BoxFuture<'static, ()> + Send + 'static) -> Arc<Self> {
            Arc::new(OuterBatch {
                stamp: BatchStamp::new(),
                body: SyncMutex::new(Some(Box::new(body))),
            })
        }
    }

    impl Batch for OuterBatch {
        fn size(&self) -> usize {
            1
        }

        fn status(&self) -> BatchStatus {
            BatchStatus::Enqueued
        }

        fn created_at(&self) -> Instant {
            self.stamp.created_at()
        }

        fn modified_at(&self) -> Instant {
            self.stamp.modified_at()
        }

        fn touch(&self) -> bool {
            self.stamp.touch()
        }

        fn dispatch(
            self: Arc<Self>,
            _cancellation: CancellationToken,
        ) -> BoxFuture<'static, Result<(), ResolverError>> {
            let body = self.body.lock().take();
            async move {
                if let Some(body) = body {
                    body().await;
                }
                Ok(())
            }
            .boxed()
        }
    }
}
