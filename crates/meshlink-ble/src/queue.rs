//! Operation queue
//!
//! All radio commands are funnelled through a single worker that runs one
//! operation at a time, ordered by priority and then by submission sequence.
//! After starting an operation the worker blocks until the operation signals
//! release; only then is the next entry popped.
//!
//! Release is carried by a [`ReleaseGuard`] owned by the operation's context.
//! The guard signals on drop, so success, error, timeout, panic and
//! cancellation all release exactly once.

use std::any::Any;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use meshlink_core::errors::TransportError;
use meshlink_core::{MeshConfig, MeshError, MeshResult, Priority};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::radio::Schedulers;

// ----------------------------------------------------------------------------
// Operations
// ----------------------------------------------------------------------------

/// A unit of radio work executed by the queue worker
#[async_trait]
pub trait Operation: Send + 'static {
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    fn priority(&self) -> Priority {
        Priority::Normal
    }

    /// Deadline for the whole operation; the queue default applies when `None`
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn execute(self, ctx: OperationContext<Self::Output>) -> MeshResult<Self::Output>;
}

/// Handed to a running operation.
///
/// The radio stays held until the operation returns, even if the context is
/// dropped earlier; call [`OperationContext::release`] to free it sooner.
pub struct OperationContext<T> {
    results: mpsc::UnboundedSender<MeshResult<T>>,
    release: Arc<ReleaseGuard>,
}

impl<T> OperationContext<T> {
    /// Stream an intermediate result to the submitter. Returns false once
    /// nobody is listening.
    pub fn emit(&self, item: T) -> bool {
        self.results.send(Ok(item)).is_ok()
    }

    /// Free the radio before the operation finishes
    pub fn release(&self) {
        self.release.release();
    }

    pub fn is_cancelled(&self) -> bool {
        self.results.is_closed()
    }
}

impl<T> fmt::Debug for OperationContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("released", &self.release.is_released())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Closure-backed operation, built with [`operation`]
pub struct FnOperation<T, F> {
    name: &'static str,
    priority: Priority,
    timeout: Option<Duration>,
    f: F,
    _output: PhantomData<fn() -> T>,
}

/// Wrap a closure as an operation
pub fn operation<T, F, Fut>(name: &'static str, f: F) -> FnOperation<T, F>
where
    T: Send + 'static,
    F: FnOnce(OperationContext<T>) -> Fut + Send + 'static,
    Fut: Future<Output = MeshResult<T>> + Send + 'static,
{
    FnOperation {
        name,
        priority: Priority::Normal,
        timeout: None,
        f,
        _output: PhantomData,
    }
}

impl<T, F> FnOperation<T, F> {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl<T, F, Fut> Operation for FnOperation<T, F>
where
    T: Send + 'static,
    F: FnOnce(OperationContext<T>) -> Fut + Send + 'static,
    Fut: Future<Output = MeshResult<T>> + Send + 'static,
{
    type Output = T;

    fn name(&self) -> &'static str {
        self.name
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn execute(self, ctx: OperationContext<T>) -> MeshResult<T> {
        (self.f)(ctx).await
    }
}

// ----------------------------------------------------------------------------
// Release Signal
// ----------------------------------------------------------------------------

/// Signals the queue worker that the radio is free again.
///
/// Backed by a single-permit [`Notify`]: releasing before the worker starts
/// waiting still unblocks it.
#[derive(Debug)]
pub struct ReleaseGuard {
    signal: Arc<Notify>,
    released: AtomicBool,
}

/// The worker's side of a [`ReleaseGuard`]
#[derive(Debug)]
pub struct ReleaseWaiter {
    signal: Arc<Notify>,
}

impl ReleaseGuard {
    pub fn pair() -> (ReleaseGuard, ReleaseWaiter) {
        let signal = Arc::new(Notify::new());
        (
            ReleaseGuard {
                signal: signal.clone(),
                released: AtomicBool::new(false),
            },
            ReleaseWaiter { signal },
        )
    }

    /// Signal release; later calls are no-ops
    pub fn release(&self) {
        if !self.released.swap(true, AtomicOrdering::AcqRel) {
            self.signal.notify_one();
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(AtomicOrdering::Acquire)
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl ReleaseWaiter {
    pub async fn wait(&self) {
        self.signal.notified().await;
    }
}

// ----------------------------------------------------------------------------
// Operation Handle
// ----------------------------------------------------------------------------

/// Result stream of a submitted operation.
///
/// Dropping the handle before the operation starts cancels it.
pub struct OperationHandle<T> {
    name: &'static str,
    results: mpsc::UnboundedReceiver<MeshResult<T>>,
}

impl<T> OperationHandle<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wait for the first result
    pub async fn result(mut self) -> MeshResult<T> {
        self.results
            .recv()
            .await
            .unwrap_or_else(|| Err(TransportError::QueueClosed.into()))
    }
}

impl<T> Stream for OperationHandle<T> {
    type Item = MeshResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.results.poll_recv(cx)
    }
}

impl<T> fmt::Debug for OperationHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHandle")
            .field("name", &self.name)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Queue Entries
// ----------------------------------------------------------------------------

enum JobOutcome {
    Completed,
    Failed,
    TimedOut,
}

trait Job: Send {
    fn is_cancelled(&self) -> bool;
    fn timeout(&self) -> Option<Duration>;
    fn run(self: Box<Self>, release: ReleaseGuard, deadline: Duration) -> BoxFuture<'static, JobOutcome>;
}

struct PendingOperation<O: Operation> {
    operation: O,
    results: mpsc::UnboundedSender<MeshResult<O::Output>>,
}

impl<O: Operation> Job for PendingOperation<O> {
    fn is_cancelled(&self) -> bool {
        self.results.is_closed()
    }

    fn timeout(&self) -> Option<Duration> {
        self.operation.timeout()
    }

    fn run(self: Box<Self>, release: ReleaseGuard, deadline: Duration) -> BoxFuture<'static, JobOutcome> {
        let PendingOperation { operation, results } = *self;
        let name = operation.name();
        let release = Arc::new(release);
        let ctx = OperationContext {
            results: results.clone(),
            release: release.clone(),
        };

        async move {
            let execution = AssertUnwindSafe(operation.execute(ctx)).catch_unwind();
            let outcome = match tokio::time::timeout(deadline, execution).await {
                Ok(Ok(Ok(output))) => {
                    let _ = results.send(Ok(output));
                    JobOutcome::Completed
                }
                Ok(Ok(Err(e))) => {
                    debug!("Operation {} failed: {}", name, e);
                    let _ = results.send(Err(e));
                    JobOutcome::Failed
                }
                Ok(Err(panic)) => {
                    let reason = panic_message(panic.as_ref());
                    error!("Operation {} panicked: {}", name, reason);
                    let _ = results.send(Err(TransportError::Fault {
                        operation: name,
                        reason,
                    }
                    .into()));
                    JobOutcome::Failed
                }
                Err(_) => {
                    warn!("Operation {} timed out after {:?}", name, deadline);
                    let _ = results.send(Err(MeshError::timeout(name, deadline)));
                    JobOutcome::TimedOut
                }
            };
            drop(release);
            outcome
        }
        .boxed()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct QueueEntry {
    name: &'static str,
    priority: Priority,
    sequence: u64,
    job: Box<dyn Job>,
}

// Max-heap: higher priority first, then lower sequence first
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueueEntry {}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    executed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

/// Snapshot of queue activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub submitted: u64,
    pub executed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub pending: usize,
}

// ----------------------------------------------------------------------------
// Operation Queue
// ----------------------------------------------------------------------------

#[derive(Default)]
struct QueueState {
    entries: BinaryHeap<QueueEntry>,
    closed: bool,
}

struct QueueInner {
    state: Mutex<QueueState>,
    sequence: AtomicU64,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    counters: Counters,
    default_timeout: Duration,
    release_warning: Duration,
    executor: Handle,
}

impl QueueInner {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn next_entry(&self) -> QueueEntry {
        loop {
            if let Some(entry) = self.lock_state().entries.pop() {
                return entry;
            }
            self.wake.notified().await;
        }
    }

    /// Wait for the running operation to release. Returns false on shutdown.
    async fn await_release(
        &self,
        name: &'static str,
        waiter: &ReleaseWaiter,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let started = Instant::now();
        loop {
            tokio::select! {
                _ = waiter.wait() => return true,
                _ = tokio::time::sleep(self.release_warning) => {
                    warn!(
                        "Operation {} has held the radio for {}ms without releasing",
                        name,
                        started.elapsed().as_millis()
                    );
                }
                _ = shutdown.wait_for(|closed| *closed) => return false,
            }
        }
    }
}

/// Serializing queue in front of the radio
#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<QueueInner>,
}

impl OperationQueue {
    /// Create the queue and spawn its worker on the io scheduler
    pub fn start(schedulers: &Schedulers, config: &MeshConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(QueueInner {
            state: Mutex::new(QueueState::default()),
            sequence: AtomicU64::new(0),
            wake: Notify::new(),
            shutdown,
            counters: Counters::default(),
            default_timeout: config.operation_timeout,
            release_warning: config.release_warning,
            executor: schedulers.io.clone(),
        });
        schedulers.io.spawn(run_worker(inner.clone()));
        info!("Operation queue started");
        Self { inner }
    }

    /// Enqueue an operation and return its result stream
    pub fn submit<O: Operation>(&self, operation: O) -> OperationHandle<O::Output> {
        let (results, receiver) = mpsc::unbounded_channel();
        let name = operation.name();
        let handle = OperationHandle {
            name,
            results: receiver,
        };

        let mut state = self.inner.lock_state();
        if state.closed {
            drop(state);
            debug!("Rejecting {} on a closed queue", name);
            let _ = results.send(Err(TransportError::QueueClosed.into()));
            return handle;
        }

        let sequence = self.inner.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        state.entries.push(QueueEntry {
            name,
            priority: operation.priority(),
            sequence,
            job: Box::new(PendingOperation { operation, results }),
        });
        drop(state);

        self.inner
            .counters
            .submitted
            .fetch_add(1, AtomicOrdering::Relaxed);
        self.inner.wake.notify_one();
        handle
    }

    /// Stop the worker and fail every pending entry with `QueueClosed`
    pub fn shutdown(&self) {
        let drained: Vec<QueueEntry> = {
            let mut state = self.inner.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.entries.drain().collect()
        };
        self.inner.shutdown.send_replace(true);
        info!(
            "Operation queue shut down, {} pending operations dropped",
            drained.len()
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    pub fn stats(&self) -> QueueStats {
        let counters = &self.inner.counters;
        QueueStats {
            submitted: counters.submitted.load(AtomicOrdering::Relaxed),
            executed: counters.executed.load(AtomicOrdering::Relaxed),
            skipped: counters.skipped.load(AtomicOrdering::Relaxed),
            failed: counters.failed.load(AtomicOrdering::Relaxed),
            timed_out: counters.timed_out.load(AtomicOrdering::Relaxed),
            pending: self.inner.lock_state().entries.len(),
        }
    }
}

impl fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationQueue")
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn run_worker(inner: Arc<QueueInner>) {
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        let entry = tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => break,
            entry = inner.next_entry() => entry,
        };

        if entry.job.is_cancelled() {
            debug!(
                "Skipping cancelled operation {} (#{})",
                entry.name, entry.sequence
            );
            inner.counters.skipped.fetch_add(1, AtomicOrdering::Relaxed);
            continue;
        }

        let name = entry.name;
        let deadline = entry.job.timeout().unwrap_or(inner.default_timeout);
        let (guard, waiter) = ReleaseGuard::pair();
        inner.counters.executed.fetch_add(1, AtomicOrdering::Relaxed);

        let tracker = inner.clone();
        let job = entry.job.run(guard, deadline);
        inner.executor.spawn(async move {
            match job.await {
                JobOutcome::Completed => {}
                JobOutcome::Failed => {
                    tracker.counters.failed.fetch_add(1, AtomicOrdering::Relaxed);
                }
                JobOutcome::TimedOut => {
                    tracker
                        .counters
                        .timed_out
                        .fetch_add(1, AtomicOrdering::Relaxed);
                }
            }
        });

        if !inner.await_release(name, &waiter, &mut shutdown).await {
            break;
        }
    }

    info!("Operation queue worker stopped");
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::sync::oneshot;

    fn queue() -> OperationQueue {
        OperationQueue::start(
            &Schedulers::current().unwrap(),
            &MeshConfig::default().with_release_warning(Duration::from_millis(50)),
        )
    }

    /// Submit an operation that holds the radio until the returned sender fires
    fn block(queue: &OperationQueue) -> (oneshot::Sender<()>, OperationHandle<()>) {
        let (tx, rx) = oneshot::channel::<()>();
        let handle = queue.submit(
            operation("block", move |_ctx| async move {
                let _ = rx.await;
                Ok(())
            })
            .with_priority(Priority::Critical)
            .with_timeout(Duration::from_secs(3600)),
        );
        (tx, handle)
    }

    #[tokio::test]
    async fn test_release_before_wait_unblocks() {
        let (guard, waiter) = ReleaseGuard::pair();
        guard.release();
        guard.release();
        tokio::time::timeout(Duration::from_secs(1), waiter.wait())
            .await
            .unwrap();
        assert!(guard.is_released());
    }

    #[tokio::test]
    async fn test_drop_signals_release() {
        let (guard, waiter) = ReleaseGuard::pair();
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fifo_order_within_priority() {
        let queue = queue();
        let order = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..5)
            .map(|i| {
                let order = order.clone();
                queue.submit(operation("record", move |_ctx| async move {
                    order.lock().unwrap().push(i);
                    Ok(i)
                }))
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.result().await.unwrap(), i);
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_priority_before_sequence() {
        let queue = queue();
        let (gate, blocker) = block(&queue);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for priority in [Priority::Low, Priority::Normal, Priority::High, Priority::Normal] {
            let order = order.clone();
            handles.push(queue.submit(
                operation("record", move |_ctx| async move {
                    order.lock().unwrap().push(priority);
                    Ok(())
                })
                .with_priority(priority),
            ));
        }

        gate.send(()).unwrap();
        blocker.result().await.unwrap();
        for handle in handles {
            handle.result().await.unwrap();
        }
        assert_eq!(
            *order.lock().unwrap(),
            vec![Priority::High, Priority::Normal, Priority::Normal, Priority::Low]
        );
    }

    #[tokio::test]
    async fn test_early_release_lets_next_operation_run() {
        let queue = queue();
        let (gate, gate_rx) = oneshot::channel::<()>();
        let slow = queue.submit(operation("slow", move |ctx: OperationContext<()>| async move {
            ctx.release();
            let _ = gate_rx.await;
            Ok(())
        }));

        let fast = queue.submit(operation("fast", |_ctx| async { Ok(7u8) }));
        assert_eq!(fast.result().await.unwrap(), 7);

        gate.send(()).unwrap();
        slow.result().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_operation_is_skipped() {
        let queue = queue();
        let (gate, blocker) = block(&queue);
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        let cancelled = queue.submit(operation("cancelled", move |_ctx| async move {
            flag.store(true, AtomicOrdering::SeqCst);
            Ok(())
        }));
        drop(cancelled);

        gate.send(()).unwrap();
        blocker.result().await.unwrap();
        queue
            .submit(operation("after", |_ctx| async { Ok(()) }))
            .result()
            .await
            .unwrap();

        assert!(!ran.load(AtomicOrdering::SeqCst));
        assert_eq!(queue.stats().skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_typed_and_releases() {
        let queue = queue();
        let stuck = queue.submit(
            operation("stuck", |_ctx| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .with_timeout(Duration::from_secs(1)),
        );

        let err = stuck.result().await.unwrap_err();
        assert!(err.is_timeout());
        assert!(matches!(
            err,
            MeshError::Transport(TransportError::Timeout {
                operation: "stuck",
                duration_ms: 1000
            })
        ));

        let next = queue.submit(operation("next", |_ctx| async { Ok(1u8) }));
        assert_eq!(next.result().await.unwrap(), 1);
        assert_eq!(queue.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn test_panic_becomes_fault() {
        let queue = queue();
        let faulty = queue.submit(operation("faulty", |_ctx| async {
            if true {
                panic!("radio driver exploded");
            }
            Ok(())
        }));

        let err = faulty.result().await.unwrap_err();
        match err {
            MeshError::Transport(TransportError::Fault { operation, reason }) => {
                assert_eq!(operation, "faulty");
                assert!(reason.contains("exploded"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let next = queue.submit(operation("next", |_ctx| async { Ok(()) }));
        assert!(next.result().await.is_ok());
    }

    #[tokio::test]
    async fn test_errors_surface_on_handle_and_queue_keeps_running() {
        let queue = queue();
        let denied = queue.submit(operation("connect", |_ctx| async {
            Err::<(), _>(TransportError::PermissionDenied.into())
        }));
        assert!(matches!(
            denied.result().await,
            Err(MeshError::Transport(TransportError::PermissionDenied))
        ));

        let next = queue.submit(operation("next", |_ctx| async { Ok(()) }));
        assert!(next.result().await.is_ok());
        assert_eq!(queue.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_emitted_items_stream_before_final_result() {
        let queue = queue();
        let handle = queue.submit(operation("notifications", |ctx: OperationContext<u32>| async move {
            for i in 0..3 {
                assert!(ctx.emit(i));
            }
            Ok(3)
        }));

        let items: Vec<u32> = handle.map(|r| r.unwrap()).collect().await;
        assert_eq!(items, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_and_rejects_new() {
        let queue = queue();
        let (_gate, _blocker) = block(&queue);
        let pending = queue.submit(operation("pending", |_ctx| async { Ok(()) }));

        queue.shutdown();
        assert!(queue.is_closed());
        assert!(matches!(
            pending.result().await,
            Err(MeshError::Transport(TransportError::QueueClosed))
        ));

        let late = queue.submit(operation("late", |_ctx| async { Ok(()) }));
        assert!(matches!(
            late.result().await,
            Err(MeshError::Transport(TransportError::QueueClosed))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_operation_keeps_worker_waiting() {
        let queue = queue();
        let (gate, blocker) = block(&queue);
        let next = queue.submit(operation("next", |_ctx| async { Ok(()) }));

        // Several stall warnings elapse; the next entry must not start
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(queue.stats().pending, 1);

        gate.send(()).unwrap();
        blocker.result().await.unwrap();
        next.result().await.unwrap();
    }
}
