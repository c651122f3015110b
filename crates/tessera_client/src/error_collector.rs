//! Bounded collection of per-operation write failures.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::{ClientError, Result};
use crate::op::WriteOp;

/// One failed write operation paired with its failure status.
///
/// The batcher that produced the failure gives up ownership of the
/// operation; the caller takes it back with [`RowError::release_failed_op`].
#[derive(Debug)]
pub struct RowError {
    status: ClientError,
    op: Option<WriteOp>,
    possibly_successful: bool,
}

impl RowError {
    pub(crate) fn new(op: WriteOp, status: ClientError, possibly_successful: bool) -> Self {
        Self {
            status,
            op: Some(op),
            possibly_successful,
        }
    }

    /// The failure that occurred.
    pub fn status(&self) -> &ClientError {
        &self.status
    }

    /// The operation that failed, unless already released.
    pub fn failed_op(&self) -> Option<&WriteOp> {
        self.op.as_ref()
    }

    /// Take back ownership of the failed operation. May be called at most
    /// once; a second call fails with `IllegalState`.
    pub fn release_failed_op(&mut self) -> Result<WriteOp> {
        self.op.take().ok_or_else(|| {
            ClientError::IllegalState("failed operation was already released".into())
        })
    }

    /// True when the server may have applied the operation despite the
    /// client observing a failure, e.g. a timed-out request the server
    /// might still have processed.
    pub fn was_possibly_successful(&self) -> bool {
        self.possibly_successful
    }
}

struct CollectorState {
    errors: VecDeque<RowError>,
    dropped: u64,
    overflowed: bool,
}

/// Capacity-bounded, ordered holding area for [`RowError`]s.
///
/// Retention is FIFO: once full, the oldest `capacity` errors are kept
/// and newer ones are counted as dropped. Draining returns everything
/// held and resets the overflow flag, so the flag always describes the
/// window since the previous drain.
pub struct ErrorCollector {
    capacity: usize,
    state: Mutex<CollectorState>,
}

impl ErrorCollector {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(CollectorState {
                errors: VecDeque::new(),
                dropped: 0,
                overflowed: false,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Errors dropped by the retention bound since the last drain.
    pub fn dropped(&self) -> u64 {
        self.state.lock().unwrap().dropped
    }

    pub(crate) fn record(&self, err: RowError) {
        let mut state = self.state.lock().unwrap();
        if state.errors.len() < self.capacity {
            state.errors.push_back(err);
        } else {
            state.dropped += 1;
            state.overflowed = true;
        }
    }

    /// Remove and return all held errors, plus whether any were dropped
    /// since the previous drain. Atomic with respect to `record`.
    pub(crate) fn drain(&self) -> (Vec<RowError>, bool) {
        let mut state = self.state.lock().unwrap();
        let errors = state.errors.drain(..).collect();
        let overflowed = state.overflowed;
        state.overflowed = false;
        state.dropped = 0;
        (errors, overflowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::OpKind;
    use crate::row::Row;
    use crate::schema::{ColumnSchema, Schema};
    use crate::value::{DataType, Value};
    use std::sync::Arc;

    fn dummy_op(k: i64) -> WriteOp {
        let schema = Arc::new(
            Schema::new(vec![ColumnSchema::new("k", DataType::Int64, false)], 1).unwrap(),
        );
        let mut row = Row::new(schema);
        row.set("k", Value::Int64(k)).unwrap();
        WriteOp::new(OpKind::Insert, Arc::from("t"), row)
    }

    fn failure(k: i64) -> RowError {
        RowError::new(dummy_op(k), ClientError::Transport("boom".into()), false)
    }

    #[test]
    fn retains_oldest_when_over_capacity() {
        let collector = ErrorCollector::new(2);
        for k in 0..5 {
            collector.record(failure(k));
        }
        assert_eq!(collector.len(), 2);
        assert_eq!(collector.dropped(), 3);

        let (errors, overflowed) = collector.drain();
        assert!(overflowed);
        let keys: Vec<i64> = errors
            .iter()
            .map(|e| match e.failed_op().unwrap().row().get("k").unwrap() {
                Value::Int64(v) => *v,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(keys, vec![0, 1]);
    }

    #[test]
    fn drain_resets_overflow_window() {
        let collector = ErrorCollector::new(1);
        collector.record(failure(0));
        collector.record(failure(1));
        let (_, overflowed) = collector.drain();
        assert!(overflowed);

        collector.record(failure(2));
        let (errors, overflowed) = collector.drain();
        assert_eq!(errors.len(), 1);
        assert!(!overflowed);
    }

    #[test]
    fn release_failed_op_is_single_shot() {
        let mut err = failure(7);
        assert!(err.release_failed_op().is_ok());
        assert!(matches!(
            err.release_failed_op(),
            Err(ClientError::IllegalState(_))
        ));
        assert!(err.failed_op().is_none());
    }
}
