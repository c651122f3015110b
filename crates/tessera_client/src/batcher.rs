//! Grouped dispatch of buffered write operations.
//!
//! A batcher collects the operations a session accepted between two flush
//! points, then turns them into the minimal number of outbound requests:
//! one per destination tablet. Groups are dispatched concurrently; one
//! tablet failing never blocks or fails the others. Per-operation
//! failures land in the session's error collector.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ClientError, Result, RowErrorCode};
use crate::error_collector::{ErrorCollector, RowError};
use crate::location::{Locator, ReplicaSelection, TabletInfo};
use crate::op::WriteOp;
use crate::rpc::{RowOp, WriteRequest};
use crate::session::Budget;
use crate::transport::Transport;

/// Callback invoked with an operation's or flush's terminal status.
pub(crate) type StatusCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Lifecycle: accepts writes while `Open`, stops accepting at the flush
/// trigger, and is `Done` once every per-tablet request has completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Open,
    Flushing,
    Done,
}

struct PendingOp {
    op: WriteOp,
    key: Vec<u8>,
    /// Bytes charged against the mutation buffer for this op.
    charged: usize,
    callback: Option<StatusCallback>,
}

struct BatcherInner {
    phase: Phase,
    ops: Vec<PendingOp>,
    completions: Vec<StatusCallback>,
}

pub(crate) struct Batcher {
    locator: Arc<dyn Locator>,
    transport: Arc<dyn Transport>,
    collector: Arc<ErrorCollector>,
    budget: Arc<Budget>,
    timeout: Duration,
    /// Whether the ops in here were charged against the mutation buffer.
    /// One-shot batchers built for synchronous applies are not.
    charges_buffer: bool,
    inner: Mutex<BatcherInner>,
    groups_left: AtomicUsize,
    failures: AtomicUsize,
}

impl Batcher {
    pub(crate) fn new(
        locator: Arc<dyn Locator>,
        transport: Arc<dyn Transport>,
        collector: Arc<ErrorCollector>,
        budget: Arc<Budget>,
        timeout: Duration,
        charges_buffer: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            locator,
            transport,
            collector,
            budget,
            timeout,
            charges_buffer,
            inner: Mutex::new(BatcherInner {
                phase: Phase::Open,
                ops: Vec::new(),
                completions: Vec::new(),
            }),
            groups_left: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        })
    }

    /// Accept one operation. The caller has already charged the budget
    /// with `charged` bytes (0 for buffer-exempt ops).
    pub(crate) fn add(
        &self,
        op: WriteOp,
        key: Vec<u8>,
        charged: usize,
        callback: Option<StatusCallback>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.phase, Phase::Open, "add after flush trigger");
        inner.ops.push(PendingOp {
            op,
            key,
            charged,
            callback,
        });
    }

    /// Operations accepted and not yet dispatched.
    pub(crate) fn buffered_ops(&self) -> usize {
        self.inner.lock().unwrap().ops.len()
    }

    /// Close the batcher to new writes and kick off grouped dispatch.
    /// `completion` fires once every group's request has completed; it
    /// fires immediately if the batcher is already done.
    pub(crate) fn flush(self: &Arc<Self>, completion: Option<StatusCallback>) {
        let ops = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(cb) = completion {
                if inner.phase == Phase::Done {
                    drop(inner);
                    cb(self.result());
                    return;
                }
                inner.completions.push(cb);
            }
            if inner.phase != Phase::Open {
                return;
            }
            inner.phase = Phase::Flushing;
            std::mem::take(&mut inner.ops)
        };

        if ops.is_empty() {
            self.finalize();
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.dispatch(ops).await;
        });
    }

    /// Resolve destinations, group per tablet, send groups concurrently.
    async fn dispatch(self: Arc<Self>, ops: Vec<PendingOp>) {
        let total = ops.len();
        let mut groups: Vec<(TabletInfo, Vec<PendingOp>)> = Vec::new();
        let mut by_dest: HashMap<(String, u64), usize> = HashMap::new();

        for pending in ops {
            let table = pending.op.table_name().to_string();
            match self.locator.tablet_for_key(&table, &pending.key).await {
                Ok(tablet) => {
                    let slot = *by_dest.entry((table, tablet.tablet_id)).or_insert_with(|| {
                        groups.push((tablet, Vec::new()));
                        groups.len() - 1
                    });
                    groups[slot].1.push(pending);
                }
                // A key that cannot be placed fails alone; the rest of the
                // batch still goes out.
                Err(err) => self.fail_op(pending, err, false),
            }
        }

        debug!(ops = total, groups = groups.len(), "dispatching write batch");

        if groups.is_empty() {
            self.finalize();
            return;
        }

        self.groups_left.store(groups.len(), Ordering::SeqCst);
        for (tablet, group) in groups {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.dispatch_group(tablet, group).await;
                if this.groups_left.fetch_sub(1, Ordering::SeqCst) == 1 {
                    this.finalize();
                }
            });
        }
    }

    /// Send one per-tablet request and reconcile per-row results.
    async fn dispatch_group(&self, tablet: TabletInfo, group: Vec<PendingOp>) {
        // Writes always go to the leader replica.
        let replica = match tablet.pick_replica(ReplicaSelection::LeaderOnly) {
            Ok(r) => r.clone(),
            Err(err) => {
                warn!(tablet = tablet.tablet_id, error = %err, "no leader for write group");
                self.fail_group(group, err, false);
                return;
            }
        };

        let table = group[0].op.table_name().to_string();
        let request = WriteRequest {
            table,
            tablet_id: tablet.tablet_id,
            ops: group
                .iter()
                .map(|p| RowOp {
                    kind: p.op.kind(),
                    cells: p.op.row().cells().to_vec(),
                })
                .collect(),
        };

        match tokio::time::timeout(self.timeout, self.transport.write(&replica, request)).await {
            Err(_) => {
                // The server may still apply a timed-out request.
                warn!(
                    tablet = tablet.tablet_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "write request timed out"
                );
                let status = ClientError::TimedOut(format!(
                    "write to tablet {} did not complete within {:?}",
                    tablet.tablet_id, self.timeout
                ));
                self.fail_group(group, status, true);
            }
            Ok(Err(err)) => {
                warn!(tablet = tablet.tablet_id, error = %err, "write request failed");
                let ambiguous = err.is_ambiguous();
                self.fail_group(group, err, ambiguous);
            }
            Ok(Ok(response)) => {
                let mut row_errors: HashMap<usize, (RowErrorCode, String)> = HashMap::new();
                for status in response.row_errors {
                    row_errors.insert(status.index, (status.code, status.message));
                }
                for (idx, pending) in group.into_iter().enumerate() {
                    match row_errors.remove(&idx) {
                        Some((code, message)) => {
                            self.fail_op(pending, ClientError::Row { code, message }, false)
                        }
                        None => self.succeed_op(pending),
                    }
                }
            }
        }
    }

    fn fail_group(&self, group: Vec<PendingOp>, status: ClientError, possibly_successful: bool) {
        for pending in group {
            self.fail_op(pending, status.clone(), possibly_successful);
        }
    }

    /// Terminal success for one op: return its buffer space, then tell
    /// the caller.
    fn succeed_op(&self, pending: PendingOp) {
        self.release_op(pending.charged);
        if let Some(cb) = pending.callback {
            cb(Ok(()));
        }
    }

    /// Terminal failure for one op. The collector entry is recorded
    /// before the callback fires so a woken caller can drain it
    /// immediately.
    fn fail_op(&self, pending: PendingOp, status: ClientError, possibly_successful: bool) {
        self.failures.fetch_add(1, Ordering::SeqCst);
        self.collector
            .record(RowError::new(pending.op, status.clone(), possibly_successful));
        self.release_op(pending.charged);
        if let Some(cb) = pending.callback {
            cb(Err(status));
        }
    }

    fn release_op(&self, charged: usize) {
        if self.charges_buffer {
            self.budget.release(charged, 1);
        } else {
            self.budget.release_pending(1);
        }
    }

    fn result(&self) -> Result<()> {
        match self.failures.load(Ordering::SeqCst) {
            0 => Ok(()),
            failures => Err(ClientError::SomeOperationsFailed { failures }),
        }
    }

    /// Mark the batcher done and fire flush completions. Buffer space was
    /// already returned op by op.
    fn finalize(&self) {
        let completions = {
            let mut inner = self.inner.lock().unwrap();
            if inner.phase == Phase::Done {
                return;
            }
            inner.phase = Phase::Done;
            std::mem::take(&mut inner.completions)
        };

        let result = self.result();
        for cb in completions {
            cb(result.clone());
        }
    }
}
