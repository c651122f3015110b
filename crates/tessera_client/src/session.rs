//! Write sessions: buffering, flush policy, and backpressure.
//!
//! A session groups writes into batchers for efficiency. Batching is not
//! a transaction: within one flush some operations may succeed while
//! others fail, and partial results are visible to concurrent readers.
//! Failed operations are reported through the session's error collector,
//! not through the apply or flush call that carried them.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::sync::Notify;
use tracing::trace;

use crate::batcher::{Batcher, StatusCallback};
use crate::client::{Client, ClientInner};
use crate::error::{ClientError, Result};
use crate::error_collector::{ErrorCollector, RowError};
use crate::location::Locator;
use crate::op::WriteOp;

/// Default mutation buffer budget, in bytes.
pub const DEFAULT_MUTATION_BUFFER_BYTES: usize = 7 * 1024 * 1024;

/// How long an open batcher may sit before a background-mode session
/// flushes it on its own.
const BACKGROUND_FLUSH_WAIT: Duration = Duration::from_millis(10);

/// When the session sends accumulated writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushMode {
    /// Every write is sent in-band with the apply call and its result
    /// awaited. No batching occurs; an explicit flush has no work to do.
    /// This is the default.
    AutoFlushSync,
    /// Applies return once the write is buffered; dispatch happens in the
    /// background, batched with other writes from the same session. When
    /// buffer space runs out, apply waits for a prior flush to complete.
    AutoFlushBackground,
    /// Applies only buffer. Nothing is sent until an explicit flush; an
    /// apply that would overrun the buffer fails with
    /// [`ClientError::BufferSpaceExhausted`].
    ManualFlush,
}

struct BudgetUsage {
    bytes: usize,
    ops: usize,
}

/// Mutation-buffer accounting shared between a session and its batchers.
///
/// `used` covers operations charged against the buffer (buffered and
/// in-flight until their batcher completes). `pending` additionally
/// counts synchronous-mode operations, which bypass the buffer but still
/// make the session "busy".
pub(crate) struct Budget {
    bytes_limit: Mutex<usize>,
    ops_limit: Mutex<usize>,
    used: Mutex<BudgetUsage>,
    pending_ops: Mutex<usize>,
    freed: Notify,
}

impl Budget {
    fn new(bytes_limit: usize, ops_limit: usize) -> Self {
        Self {
            bytes_limit: Mutex::new(bytes_limit),
            ops_limit: Mutex::new(ops_limit),
            used: Mutex::new(BudgetUsage { bytes: 0, ops: 0 }),
            pending_ops: Mutex::new(0),
            freed: Notify::new(),
        }
    }

    fn set_bytes_limit(&self, bytes: usize) {
        *self.bytes_limit.lock().unwrap() = bytes;
    }

    fn set_ops_limit(&self, ops: usize) {
        *self.ops_limit.lock().unwrap() = ops;
    }

    /// Try to reserve space for one operation of `bytes` size.
    ///
    /// With `admit_when_idle`, an operation larger than the whole budget
    /// is still admitted while nothing else is charged, so background
    /// mode cannot wedge on a single oversized write.
    pub(crate) fn try_charge(&self, bytes: usize, admit_when_idle: bool) -> bool {
        let bytes_limit = *self.bytes_limit.lock().unwrap();
        let ops_limit = *self.ops_limit.lock().unwrap();
        let mut used = self.used.lock().unwrap();
        let fits = used.ops < ops_limit && used.bytes.saturating_add(bytes) <= bytes_limit;
        if fits || (admit_when_idle && used.ops == 0) {
            used.ops += 1;
            used.bytes += bytes;
            *self.pending_ops.lock().unwrap() += 1;
            true
        } else {
            false
        }
    }

    /// Count an operation that bypasses buffer accounting.
    pub(crate) fn add_pending(&self, ops: usize) {
        *self.pending_ops.lock().unwrap() += ops;
    }

    pub(crate) fn release(&self, bytes: usize, ops: usize) {
        {
            let mut used = self.used.lock().unwrap();
            used.bytes = used.bytes.saturating_sub(bytes);
            used.ops = used.ops.saturating_sub(ops);
        }
        self.release_pending(ops);
    }

    pub(crate) fn release_pending(&self, ops: usize) {
        {
            let mut pending = self.pending_ops.lock().unwrap();
            *pending = pending.saturating_sub(ops);
        }
        self.freed.notify_waiters();
    }

    pub(crate) fn pending(&self) -> usize {
        *self.pending_ops.lock().unwrap()
    }

    pub(crate) fn freed_notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.freed.notified()
    }
}

pub(crate) struct SessionInner {
    client: Arc<ClientInner>,
    collector: Arc<ErrorCollector>,
    budget: Arc<Budget>,
    flush_mode: Mutex<FlushMode>,
    timeout: Mutex<Duration>,
    priority: AtomicI32,
    closed: AtomicBool,
    open_batcher: Mutex<Option<Arc<Batcher>>>,
}

impl SessionInner {
    /// Take the open batcher, closing it to new writes.
    fn take_open(&self) -> Option<Arc<Batcher>> {
        self.open_batcher.lock().unwrap().take()
    }

    /// Take the open batcher only if it is still `batcher`.
    fn take_if_current(&self, batcher: &Arc<Batcher>) -> bool {
        let mut open = self.open_batcher.lock().unwrap();
        match open.as_ref() {
            Some(current) if Arc::ptr_eq(current, batcher) => {
                *open = None;
                true
            }
            _ => false,
        }
    }
}

/// Context for batched data access. Cheap to clone; clones share state.
///
/// `apply`, `flush`, `flush_async`, `close` and the counters are safe to
/// call concurrently from multiple tasks. The configuration setters are
/// not safe to call concurrently with in-flight applies; serialize
/// configuration changes against traffic.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(client: Arc<ClientInner>) -> Self {
        let collector = Arc::new(ErrorCollector::new(client.error_buffer_capacity));
        let timeout = client.default_timeout;
        Self {
            inner: Arc::new(SessionInner {
                client,
                collector,
                budget: Arc::new(Budget::new(DEFAULT_MUTATION_BUFFER_BYTES, usize::MAX)),
                flush_mode: Mutex::new(FlushMode::AutoFlushSync),
                timeout: Mutex::new(timeout),
                priority: AtomicI32::new(0),
                closed: AtomicBool::new(false),
                open_batcher: Mutex::new(None),
            }),
        }
    }

    /// Switch the flush mode for subsequent applies. Fails while any
    /// operation is buffered or in flight.
    pub fn set_flush_mode(&self, mode: FlushMode) -> Result<()> {
        if self.has_pending_operations() {
            return Err(ClientError::IllegalState(
                "cannot change flush mode with pending operations".into(),
            ));
        }
        *self.inner.flush_mode.lock().unwrap() = mode;
        Ok(())
    }

    /// Budget for outbound writes, in bytes. In background mode an apply
    /// that would overrun it waits; in manual mode it fails.
    pub fn set_mutation_buffer_space(&self, bytes: usize) {
        self.inner.budget.set_bytes_limit(bytes);
    }

    /// Budget for outbound writes, as an operation count.
    pub fn set_mutation_buffer_max_ops(&self, ops: usize) {
        self.inner.budget.set_ops_limit(ops);
    }

    /// Deadline applied to each outbound request issued on behalf of this
    /// session.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.inner.timeout.lock().unwrap() = timeout;
    }

    /// Accepted for forward compatibility; does not affect scheduling.
    pub fn set_priority(&self, priority: i32) {
        self.inner.priority.store(priority, Ordering::Relaxed);
    }

    pub fn priority(&self) -> i32 {
        self.inner.priority.load(Ordering::Relaxed)
    }

    pub fn flush_mode(&self) -> FlushMode {
        *self.inner.flush_mode.lock().unwrap()
    }

    pub fn client(&self) -> Client {
        Client::from_inner(Arc::clone(&self.inner.client))
    }

    /// Apply one write operation, transferring its ownership in.
    ///
    /// In `AutoFlushSync` mode the operation's own result is returned
    /// once delivery completes. In the buffering modes acceptance is the
    /// only thing reported here; delivery failures surface later through
    /// the error collector. A malformed operation (unset key columns,
    /// unknown table) fails synchronously and is also recorded in the
    /// collector so the operation can be recovered.
    pub async fn apply(&self, op: WriteOp) -> Result<()> {
        self.check_open()?;
        let key = match op.encoded_key() {
            Ok(key) => key,
            Err(err) => {
                self.inner
                    .collector
                    .record(RowError::new(op, err.clone(), false));
                return Err(err);
            }
        };

        match self.flush_mode() {
            FlushMode::AutoFlushSync => self.apply_sync(op, key).await,
            FlushMode::AutoFlushBackground => {
                let size = op.size_hint();
                self.charge_waiting(size).await;
                self.buffer_op(op, key, size, None);
                Ok(())
            }
            FlushMode::ManualFlush => {
                let size = op.size_hint();
                if !self.inner.budget.try_charge(size, false) {
                    return Err(ClientError::BufferSpaceExhausted(Box::new(op)));
                }
                self.buffer_op(op, key, size, None);
                Ok(())
            }
        }
    }

    /// Like [`Session::apply`] but never waits. The callback fires with
    /// the operation's terminal status, possibly on a background task or
    /// inline when the outcome is already known; it must not block.
    pub fn apply_async(
        &self,
        op: WriteOp,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let callback: StatusCallback = Box::new(callback);
        if let Err(err) = self.check_open() {
            callback(Err(err));
            return;
        }
        let key = match op.encoded_key() {
            Ok(key) => key,
            Err(err) => {
                self.inner
                    .collector
                    .record(RowError::new(op, err.clone(), false));
                callback(Err(err));
                return;
            }
        };

        match self.flush_mode() {
            FlushMode::AutoFlushSync => {
                let batcher = self.one_shot_batcher();
                self.inner.budget.add_pending(1);
                batcher.add(op, key, 0, Some(callback));
                batcher.flush(None);
            }
            FlushMode::AutoFlushBackground => {
                let size = op.size_hint();
                if self.inner.budget.try_charge(size, true) {
                    self.buffer_op(op, key, size, Some(callback));
                } else {
                    // Admission has to wait for space; hand the wait to a
                    // background task so this call does not.
                    let session = self.clone();
                    tokio::spawn(async move {
                        session.charge_waiting(size).await;
                        session.buffer_op(op, key, size, Some(callback));
                    });
                }
            }
            FlushMode::ManualFlush => {
                let size = op.size_hint();
                if self.inner.budget.try_charge(size, false) {
                    self.buffer_op(op, key, size, Some(callback));
                } else {
                    callback(Err(ClientError::BufferSpaceExhausted(Box::new(op))));
                }
            }
        }
    }

    /// Flush everything buffered since the previous flush and wait for
    /// delivery. Succeeds only if the flushed batcher produced no row
    /// errors; otherwise reports a summary and the caller drains the
    /// collector for details. Completes immediately when nothing is
    /// buffered.
    pub async fn flush(&self) -> Result<()> {
        let Some(batcher) = self.inner.take_open() else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        batcher.flush(Some(Box::new(move |result| {
            let _ = tx.send(result);
        })));
        rx.await
            .unwrap_or_else(|_| Err(ClientError::Transport("flush result dropped".into())))
    }

    /// Non-waiting flush. The callback fires when every operation
    /// buffered before this call has completed; with nothing buffered it
    /// fires inline, before any outbound request. Operations applied
    /// after this call belong to the next batcher and do not delay the
    /// callback.
    pub fn flush_async(&self, callback: impl FnOnce(Result<()>) + Send + 'static) {
        match self.inner.take_open() {
            None => callback(Ok(())),
            Some(batcher) => batcher.flush(Some(Box::new(callback))),
        }
    }

    /// Release the session. Fails while any operation is buffered or in
    /// flight; flush first.
    pub fn close(&self) -> Result<()> {
        if self.has_pending_operations() {
            return Err(ClientError::IllegalState(
                "session has buffered or in-flight operations".into(),
            ));
        }
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// True while any operation is buffered or dispatched but not yet
    /// resolved.
    pub fn has_pending_operations(&self) -> bool {
        self.inner.budget.pending() > 0
    }

    /// Operations accepted but not yet dispatched. Only manual-flush
    /// sessions buffer without dispatching, so this is 0 in the other
    /// modes.
    pub fn count_buffered_operations(&self) -> usize {
        if self.flush_mode() != FlushMode::ManualFlush {
            return 0;
        }
        self.inner
            .open_batcher
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, |b| b.buffered_ops())
    }

    pub fn count_pending_errors(&self) -> usize {
        self.inner.collector.len()
    }

    /// Drain collected row errors. The second element reports whether the
    /// collector overflowed (dropped errors) since the previous drain.
    pub fn pending_errors(&self) -> (Vec<RowError>, bool) {
        self.inner.collector.drain()
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(ClientError::IllegalState("session is closed".into()))
        } else {
            Ok(())
        }
    }

    fn timeout(&self) -> Duration {
        *self.inner.timeout.lock().unwrap()
    }

    fn one_shot_batcher(&self) -> Arc<Batcher> {
        Batcher::new(
            Arc::clone(&self.inner.client.locator),
            Arc::clone(&self.inner.client.transport),
            Arc::clone(&self.inner.collector),
            Arc::clone(&self.inner.budget),
            self.timeout(),
            false,
        )
    }

    async fn apply_sync(&self, op: WriteOp, key: Vec<u8>) -> Result<()> {
        let batcher = self.one_shot_batcher();
        self.inner.budget.add_pending(1);
        let (tx, rx) = oneshot::channel();
        batcher.add(
            op,
            key,
            0,
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        );
        batcher.flush(None);
        rx.await
            .unwrap_or_else(|_| Err(ClientError::Transport("write result dropped".into())))
    }

    /// Wait until the budget admits an operation of `bytes` size,
    /// flushing the open batcher so waited-for space can actually appear.
    async fn charge_waiting(&self, bytes: usize) {
        loop {
            let notified = self.inner.budget.freed_notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.budget.try_charge(bytes, true) {
                return;
            }
            trace!(bytes, "mutation buffer full, waiting for space");
            self.flush_open_for_space();
            notified.await;
        }
    }

    fn flush_open_for_space(&self) {
        if let Some(batcher) = self.inner.take_open() {
            batcher.flush(None);
        }
    }

    /// Append to the open batcher, creating it lazily.
    fn buffer_op(&self, op: WriteOp, key: Vec<u8>, charged: usize, callback: Option<StatusCallback>) {
        // Start resolving the destination right away; the result warms the
        // location cache and any hard failure resurfaces at dispatch.
        self.prefetch_location(op.table_name().to_string(), key.clone());

        let background = self.flush_mode() == FlushMode::AutoFlushBackground;
        let mut open = self.inner.open_batcher.lock().unwrap();
        let batcher = open.get_or_insert_with(|| {
            let batcher = Batcher::new(
                Arc::clone(&self.inner.client.locator),
                Arc::clone(&self.inner.client.transport),
                Arc::clone(&self.inner.collector),
                Arc::clone(&self.inner.budget),
                self.timeout(),
                true,
            );
            if background {
                self.schedule_background_flush(&batcher);
            }
            batcher
        });
        // Added under the lock so a concurrent flush cannot retire the
        // batcher between lookup and append.
        batcher.add(op, key, charged, callback);
    }

    fn prefetch_location(&self, table: String, key: Vec<u8>) {
        let locator = Arc::clone(&self.inner.client.locator);
        tokio::spawn(async move {
            if let Err(err) = locator.tablet_for_key(&table, &key).await {
                trace!(table = %table, error = %err, "location prefetch failed");
            }
        });
    }

    /// Flush the given batcher after a short dwell, unless something else
    /// (an explicit flush, a full buffer) already retired it.
    fn schedule_background_flush(&self, batcher: &Arc<Batcher>) {
        let session = Arc::downgrade(&self.inner);
        let batcher = Arc::downgrade(batcher);
        tokio::spawn(async move {
            tokio::time::sleep(BACKGROUND_FLUSH_WAIT).await;
            let (Some(inner), Some(batcher)) = (session.upgrade(), batcher.upgrade()) else {
                return;
            };
            if inner.take_if_current(&batcher) {
                batcher.flush(None);
            }
        });
    }
}
