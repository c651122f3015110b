//! Wire messages exchanged with tablet servers.
//!
//! These are plain serde structs; the transport decides how they travel.
//! One `WriteRequest` carries every operation a batcher grouped for a
//! single destination tablet, in submission order.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::RowErrorCode;
use crate::op::OpKind;
use crate::predicate::ColumnRangePredicate;
use crate::scanner::ReadMode;
use crate::value::Value;

/// One operation inside a grouped write request. Cells are positional in
/// the table's full schema.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RowOp {
    pub kind: OpKind,
    pub cells: Vec<Option<Value>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteRequest {
    pub table: String,
    pub tablet_id: u64,
    pub ops: Vec<RowOp>,
}

/// Failure of one row inside an otherwise delivered write request.
/// `index` refers to the position in [`WriteRequest::ops`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RowStatus {
    pub index: usize,
    pub code: RowErrorCode,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteResponse {
    /// Commit timestamp assigned by the serving tablet, hybrid-clock
    /// microseconds.
    pub timestamp_micros: u64,
    pub row_errors: Vec<RowStatus>,
}

/// Configuration carried by the first request of a per-tablet scan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewScan {
    pub table: String,
    pub tablet_id: u64,
    /// Projected column indices into the table schema.
    pub projection: Vec<usize>,
    pub predicates: Vec<ColumnRangePredicate>,
    /// Encoded primary-key bounds, lower inclusive, upper exclusive.
    /// Empty means unbounded on that side.
    pub lower_key: Bytes,
    pub upper_key: Bytes,
    pub read_mode: ReadMode,
    pub snapshot_micros: Option<u64>,
    /// Byte-size hint for the response. Zero asks the server to assign a
    /// scanner and timestamp without returning rows.
    pub batch_size_bytes: u32,
}

/// Follow-up page fetch within one tablet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContinueScan {
    pub scanner_id: u64,
    /// Continuation token from the previous [`ScanResponse`].
    pub token: Bytes,
    pub batch_size_bytes: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ScanRequest {
    Open(NewScan),
    Continue(ContinueScan),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanResponse {
    pub scanner_id: u64,
    /// Projected rows in primary-key order.
    pub rows: Vec<Vec<Option<Value>>>,
    /// Cursor to resume from. Meaningful only while `has_more` is true.
    pub token: Bytes,
    pub has_more: bool,
    /// Snapshot the scan is pinned to; absent for latest-visible reads.
    pub snapshot_micros: Option<u64>,
}
