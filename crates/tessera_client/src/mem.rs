//! In-process tablet cluster.
//!
//! `MemCluster` implements both [`Locator`] and [`Transport`] against
//! versioned in-memory tablets, so the whole client stack can run inside
//! one process: tests and the workload generator drive real sessions and
//! scanners against it. Tables are range-partitioned by split rows; rows
//! keep a version chain per key, which is what makes snapshot reads
//! repeatable.
//!
//! Writes commit atomically under the tablet lock, so by the time a
//! snapshot timestamp is readable every lower-timestamped write has
//! settled; there is no separate wait step like a real server needs.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use crate::error::{ClientError, Result, RowErrorCode};
use crate::keys;
use crate::location::{Locator, ReplicaInfo, TabletInfo};
use crate::op::OpKind;
use crate::predicate::ColumnRangePredicate;
use crate::rpc::{
    ContinueScan, NewScan, RowStatus, ScanRequest, ScanResponse, WriteRequest, WriteResponse,
};
use crate::scanner::ReadMode;
use crate::schema::Schema;
use crate::transport::Transport;
use crate::value::Value;

/// How long a stalled write sleeps; the client's deadline fires first.
const STALL_SLEEP: Duration = Duration::from_secs(3600);

/// Injected failure for write requests against one tablet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InjectedWriteFault {
    /// The request fails outright; the server did not apply it.
    Fail,
    /// The request is applied, then the response never arrives. The
    /// client observes a timeout and cannot tell the write happened.
    Stall,
}

struct WriteFault {
    fault: InjectedWriteFault,
    remaining: u32,
}

struct RowVersion {
    micros: u64,
    /// `None` is a tombstone.
    cells: Option<Vec<Option<Value>>>,
}

struct MemTablet {
    tablet_id: u64,
    start_key: Vec<u8>,
    end_key: Vec<u8>,
    replicas: Vec<ReplicaInfo>,
    rows: Mutex<BTreeMap<Vec<u8>, Vec<RowVersion>>>,
}

impl MemTablet {
    fn contains(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice() && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }

    fn info(&self) -> TabletInfo {
        TabletInfo {
            tablet_id: self.tablet_id,
            start_key: Bytes::from(self.start_key.clone()),
            end_key: Bytes::from(self.end_key.clone()),
            replicas: self.replicas.clone(),
        }
    }
}

struct MemTable {
    schema: Arc<Schema>,
    /// Tablets in ascending key order, covering the whole keyspace.
    tablets: Vec<Arc<MemTablet>>,
}

struct ScanCursor {
    table: String,
    tablet_id: u64,
    projection: Vec<usize>,
    predicates: Vec<ColumnRangePredicate>,
    lower: Vec<u8>,
    upper: Vec<u8>,
    /// Pinned snapshot; `None` reads latest-visible at every batch.
    snapshot: Option<u64>,
    resume_after: Option<Vec<u8>>,
}

struct MemInner {
    num_replicas: usize,
    tables: Mutex<HashMap<String, Arc<MemTable>>>,
    next_tablet_id: AtomicU64,
    clock: Mutex<u64>,
    scans: Mutex<HashMap<u64, ScanCursor>>,
    next_scanner_id: AtomicU64,
    write_faults: Mutex<HashMap<u64, WriteFault>>,
    fail_next_scan: AtomicBool,
}

/// Single-process tablet cluster backing tests and workloads.
#[derive(Clone)]
pub struct MemCluster {
    inner: Arc<MemInner>,
}

impl MemCluster {
    pub fn new(num_replicas: usize) -> Self {
        Self {
            inner: Arc::new(MemInner {
                num_replicas: num_replicas.max(1),
                tables: Mutex::new(HashMap::new()),
                next_tablet_id: AtomicU64::new(1),
                clock: Mutex::new(0),
                scans: Mutex::new(HashMap::new()),
                next_scanner_id: AtomicU64::new(1),
                write_faults: Mutex::new(HashMap::new()),
                fail_next_scan: AtomicBool::new(false),
            }),
        }
    }

    /// Create a range-partitioned table. Each split row is a full key
    /// tuple; k split rows produce k+1 tablets. Fixture-only surface:
    /// table administration is a control-plane concern, not part of the
    /// client proper.
    pub fn create_table(&self, name: &str, schema: Schema, split_rows: &[Vec<Value>]) -> Result<()> {
        let mut split_keys = Vec::with_capacity(split_rows.len());
        for row in split_rows {
            split_keys.push(encode_split_key(&schema, row)?);
        }
        split_keys.sort();
        split_keys.dedup();

        let mut tables = self.inner.tables.lock().unwrap();
        if tables.contains_key(name) {
            return Err(ClientError::InvalidArgument(format!(
                "table {name} already exists"
            )));
        }

        let mut bounds = vec![Vec::new()];
        bounds.extend(split_keys);
        let mut tablets = Vec::with_capacity(bounds.len());
        for (idx, start) in bounds.iter().enumerate() {
            let end = bounds.get(idx + 1).cloned().unwrap_or_default();
            let tablet_id = self.inner.next_tablet_id.fetch_add(1, Ordering::SeqCst);
            tablets.push(Arc::new(MemTablet {
                tablet_id,
                start_key: start.clone(),
                end_key: end,
                replicas: self.replicas_for(tablet_id),
                rows: Mutex::new(BTreeMap::new()),
            }));
        }

        trace!(table = name, tablets = tablets.len(), "created table");
        tables.insert(
            name.to_string(),
            Arc::new(MemTable {
                schema: Arc::new(schema),
                tablets,
            }),
        );
        Ok(())
    }

    /// Current hybrid-clock reading, microseconds. Strictly monotonic.
    pub fn now_micros(&self) -> u64 {
        let physical = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        let mut last = self.inner.clock.lock().unwrap();
        let now = physical.max(*last + 1);
        *last = now;
        now
    }

    pub fn tablet_count(&self, table: &str) -> usize {
        self.inner
            .tables
            .lock()
            .unwrap()
            .get(table)
            .map_or(0, |t| t.tablets.len())
    }

    /// Make the next `times` write requests against the table's
    /// `tablet_index`-th tablet fail with `fault`.
    pub fn inject_write_fault(
        &self,
        table: &str,
        tablet_index: usize,
        fault: InjectedWriteFault,
        times: u32,
    ) -> Result<()> {
        if times == 0 {
            return Ok(());
        }
        let tablet_id = {
            let tables = self.inner.tables.lock().unwrap();
            let table = tables
                .get(table)
                .ok_or_else(|| ClientError::TabletNotFound(format!("table {table} unknown")))?;
            table
                .tablets
                .get(tablet_index)
                .ok_or_else(|| {
                    ClientError::InvalidArgument(format!("tablet index {tablet_index} out of range"))
                })?
                .tablet_id
        };
        self.inner
            .write_faults
            .lock()
            .unwrap()
            .insert(tablet_id, WriteFault { fault, remaining: times });
        Ok(())
    }

    /// Make the next scan request fail.
    pub fn inject_scan_fault(&self) {
        self.inner.fail_next_scan.store(true, Ordering::SeqCst);
    }

    fn replicas_for(&self, tablet_id: u64) -> Vec<ReplicaInfo> {
        let n = self.inner.num_replicas;
        let leader = (tablet_id as usize) % n;
        (0..n)
            .map(|idx| ReplicaInfo {
                addr: format!("mem:{idx}"),
                is_leader: idx == leader,
            })
            .collect()
    }

    fn table(&self, name: &str) -> Result<Arc<MemTable>> {
        self.inner
            .tables
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::TabletNotFound(format!("table {name} unknown")))
    }

    fn tablet(&self, table: &str, tablet_id: u64) -> Result<Arc<MemTablet>> {
        let table = self.table(table)?;
        table
            .tablets
            .iter()
            .find(|t| t.tablet_id == tablet_id)
            .cloned()
            .ok_or_else(|| ClientError::TabletNotFound(format!("tablet {tablet_id} unknown")))
    }

    /// Take one charge of an injected fault for this tablet, if any.
    fn take_write_fault(&self, tablet_id: u64) -> Option<InjectedWriteFault> {
        let mut faults = self.inner.write_faults.lock().unwrap();
        let entry = faults.get_mut(&tablet_id)?;
        entry.remaining -= 1;
        let fault = entry.fault;
        if entry.remaining == 0 {
            faults.remove(&tablet_id);
        }
        Some(fault)
    }

    fn apply_write(&self, request: &WriteRequest) -> Result<WriteResponse> {
        let table = self.table(&request.table)?;
        let tablet = self.tablet(&request.table, request.tablet_id)?;
        let schema = &table.schema;
        let commit_micros = self.now_micros();

        let mut row_errors = Vec::new();
        let mut rows = tablet.rows.lock().unwrap();
        for (index, op) in request.ops.iter().enumerate() {
            match apply_row_op(schema, &tablet, &mut rows, op.kind, &op.cells, commit_micros) {
                Ok(()) => {}
                Err((code, message)) => row_errors.push(RowStatus {
                    index,
                    code,
                    message,
                }),
            }
        }

        Ok(WriteResponse {
            timestamp_micros: commit_micros,
            row_errors,
        })
    }

    fn open_scan(&self, new: &NewScan) -> Result<ScanResponse> {
        let table = self.table(&new.table)?;
        let tablet = self.tablet(&new.table, new.tablet_id)?;

        let snapshot = match new.read_mode {
            ReadMode::ReadAtSnapshot => Some(new.snapshot_micros.unwrap_or_else(|| self.now_micros())),
            ReadMode::ReadLatest => None,
        };
        let scanner_id = self.inner.next_scanner_id.fetch_add(1, Ordering::SeqCst);
        let mut cursor = ScanCursor {
            table: new.table.clone(),
            tablet_id: new.tablet_id,
            projection: new.projection.clone(),
            predicates: new.predicates.clone(),
            lower: new.lower_key.to_vec(),
            upper: new.upper_key.to_vec(),
            snapshot,
            resume_after: None,
        };

        // A zero hint asks for no rows on the first round-trip; the
        // scanner and snapshot are still assigned.
        if new.batch_size_bytes == 0 {
            let response = ScanResponse {
                scanner_id,
                rows: Vec::new(),
                token: Bytes::new(),
                has_more: true,
                snapshot_micros: snapshot,
            };
            self.inner.scans.lock().unwrap().insert(scanner_id, cursor);
            return Ok(response);
        }

        let response =
            self.collect_page(scanner_id, &mut cursor, &table, &tablet, new.batch_size_bytes)?;
        if response.has_more {
            self.inner.scans.lock().unwrap().insert(scanner_id, cursor);
        }
        Ok(response)
    }

    fn continue_scan(&self, cont: &ContinueScan) -> Result<ScanResponse> {
        let mut cursor = self
            .inner
            .scans
            .lock()
            .unwrap()
            .remove(&cont.scanner_id)
            .ok_or_else(|| {
                ClientError::Transport(format!("scanner {} is not open", cont.scanner_id))
            })?;

        let table = self.table(&cursor.table)?;
        let tablet = self.tablet(&cursor.table, cursor.tablet_id)?;
        let batch = if cont.batch_size_bytes == 0 {
            1
        } else {
            cont.batch_size_bytes
        };
        let response = self.collect_page(cont.scanner_id, &mut cursor, &table, &tablet, batch)?;
        if response.has_more {
            self.inner
                .scans
                .lock()
                .unwrap()
                .insert(cont.scanner_id, cursor);
        }
        Ok(response)
    }

    /// Collect up to `batch_bytes` worth of visible, matching rows.
    fn collect_page(
        &self,
        scanner_id: u64,
        cursor: &mut ScanCursor,
        table: &MemTable,
        tablet: &MemTablet,
        batch_bytes: u32,
    ) -> Result<ScanResponse> {
        let read_at = match cursor.snapshot {
            Some(ts) => ts,
            None => self.now_micros(),
        };

        // Intersect the tablet's bounds with the scan's bounds and the
        // resume point.
        let mut lower = tablet.start_key.clone();
        if cursor.lower > lower {
            lower = cursor.lower.clone();
        }
        let start: Bound<Vec<u8>> = match cursor.resume_after.take() {
            Some(key) => Bound::Excluded(key),
            None => Bound::Included(lower),
        };
        let upper = match (tablet.end_key.is_empty(), cursor.upper.is_empty()) {
            (true, true) => Vec::new(),
            (true, false) => cursor.upper.clone(),
            (false, true) => tablet.end_key.clone(),
            (false, false) => tablet.end_key.clone().min(cursor.upper.clone()),
        };
        let end: Bound<Vec<u8>> = if upper.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(upper)
        };

        let rows = tablet.rows.lock().unwrap();
        let mut out = Vec::new();
        let mut bytes = 0usize;
        let mut token = Bytes::new();
        let mut has_more = false;

        for (key, versions) in rows.range((start, end)) {
            let Some(cells) = visible_cells(versions, read_at) else {
                continue;
            };
            if !cursor
                .predicates
                .iter()
                .all(|p| p.matches(&table.schema, cells))
            {
                continue;
            }
            let projected: Vec<Option<Value>> = cursor
                .projection
                .iter()
                .map(|idx| cells.get(*idx).cloned().flatten())
                .collect();
            bytes += projected
                .iter()
                .flatten()
                .map(|v| v.size_hint())
                .sum::<usize>()
                + projected.len();
            out.push(projected);
            if bytes >= batch_bytes as usize {
                token = Bytes::from(key.clone());
                cursor.resume_after = Some(key.clone());
                has_more = true;
                break;
            }
        }

        Ok(ScanResponse {
            scanner_id,
            rows: out,
            token,
            has_more,
            snapshot_micros: cursor.snapshot,
        })
    }
}

#[async_trait]
impl Locator for MemCluster {
    async fn table_schema(&self, table: &str) -> Result<Schema> {
        Ok(self.table(table)?.schema.as_ref().clone())
    }

    async fn tablet_for_key(&self, table: &str, key: &[u8]) -> Result<TabletInfo> {
        let table = self.table(table)?;
        table
            .tablets
            .iter()
            .find(|t| t.contains(key))
            .map(|t| t.info())
            .ok_or_else(|| ClientError::TabletNotFound("no tablet covers key".into()))
    }

    async fn tablet_after(&self, table: &str, prev_end_key: &[u8]) -> Result<Option<TabletInfo>> {
        if prev_end_key.is_empty() {
            return Ok(None);
        }
        let table = self.table(table)?;
        Ok(table
            .tablets
            .iter()
            .find(|t| t.start_key.as_slice() >= prev_end_key)
            .map(|t| t.info()))
    }
}

#[async_trait]
impl Transport for MemCluster {
    async fn write(&self, _replica: &ReplicaInfo, request: WriteRequest) -> Result<WriteResponse> {
        match self.take_write_fault(request.tablet_id) {
            Some(InjectedWriteFault::Fail) => {
                return Err(ClientError::Transport(format!(
                    "injected write failure for tablet {}",
                    request.tablet_id
                )))
            }
            Some(InjectedWriteFault::Stall) => {
                // Apply, then never answer: the ambiguous-outcome case.
                let _ = self.apply_write(&request)?;
                tokio::time::sleep(STALL_SLEEP).await;
                return Err(ClientError::Transport("stalled write".into()));
            }
            None => {}
        }
        self.apply_write(&request)
    }

    async fn scan(&self, _replica: &ReplicaInfo, request: ScanRequest) -> Result<ScanResponse> {
        if self.inner.fail_next_scan.swap(false, Ordering::SeqCst) {
            return Err(ClientError::Transport("injected scan failure".into()));
        }
        match &request {
            ScanRequest::Open(new) => self.open_scan(new),
            ScanRequest::Continue(cont) => self.continue_scan(cont),
        }
    }

    async fn close_scanner(&self, _replica: &ReplicaInfo, scanner_id: u64) -> Result<()> {
        if self.inner.fail_next_scan.swap(false, Ordering::SeqCst) {
            return Err(ClientError::Transport("injected scan failure".into()));
        }
        self.inner.scans.lock().unwrap().remove(&scanner_id);
        Ok(())
    }
}

/// Latest version at or below `read_at`, skipping tombstones.
fn visible_cells(versions: &[RowVersion], read_at: u64) -> Option<&Vec<Option<Value>>> {
    versions
        .iter()
        .rev()
        .find(|v| v.micros <= read_at)
        .and_then(|v| v.cells.as_ref())
}

fn encode_split_key(schema: &Schema, row: &[Value]) -> Result<Vec<u8>> {
    if row.is_empty() || row.len() > schema.num_key_columns() {
        return Err(ClientError::InvalidArgument(format!(
            "split row has {} value(s), key has {} column(s)",
            row.len(),
            schema.num_key_columns()
        )));
    }
    for (idx, value) in row.iter().enumerate() {
        let col = schema.column(idx).unwrap();
        if value.data_type() != col.data_type() {
            return Err(ClientError::InvalidArgument(format!(
                "split value for {} is {}, column is {}",
                col.name(),
                value.data_type(),
                col.data_type()
            )));
        }
    }
    Ok(keys::encode_composite(&row.iter().collect::<Vec<_>>()))
}

fn apply_row_op(
    schema: &Schema,
    tablet: &MemTablet,
    rows: &mut BTreeMap<Vec<u8>, Vec<RowVersion>>,
    kind: OpKind,
    cells: &[Option<Value>],
    commit_micros: u64,
) -> std::result::Result<(), (RowErrorCode, String)> {
    if cells.len() != schema.columns().len() {
        return Err((
            RowErrorCode::InvalidRow,
            format!(
                "row has {} cell(s), schema has {}",
                cells.len(),
                schema.columns().len()
            ),
        ));
    }
    let mut key_parts = Vec::with_capacity(schema.num_key_columns());
    for idx in 0..schema.num_key_columns() {
        match &cells[idx] {
            Some(value) => key_parts.push(value),
            None => {
                return Err((
                    RowErrorCode::InvalidRow,
                    format!("key column {} is not set", schema.column(idx).unwrap().name()),
                ))
            }
        }
    }
    let key = keys::encode_composite(&key_parts);
    if !tablet.contains(&key) {
        return Err((
            RowErrorCode::InvalidRow,
            "key is outside the tablet's range".into(),
        ));
    }

    let versions = rows.entry(key).or_default();
    let live = versions.last().and_then(|v| v.cells.as_ref());
    match kind {
        OpKind::Insert => {
            if live.is_some() {
                return Err((RowErrorCode::AlreadyPresent, "key already exists".into()));
            }
            versions.push(RowVersion {
                micros: commit_micros,
                cells: Some(cells.to_vec()),
            });
        }
        OpKind::Update => {
            let Some(current) = live else {
                return Err((RowErrorCode::NotFound, "key does not exist".into()));
            };
            // Partial update: unset cells keep their current value.
            let merged: Vec<Option<Value>> = current
                .iter()
                .zip(cells.iter())
                .map(|(old, new)| new.clone().or_else(|| old.clone()))
                .collect();
            versions.push(RowVersion {
                micros: commit_micros,
                cells: Some(merged),
            });
        }
        OpKind::Delete => {
            if live.is_none() {
                return Err((RowErrorCode::NotFound, "key does not exist".into()));
            }
            versions.push(RowVersion {
                micros: commit_micros,
                cells: None,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSchema;
    use crate::value::DataType;

    fn schema() -> Schema {
        Schema::new(
            vec![
                ColumnSchema::new("k", DataType::Int64, false),
                ColumnSchema::new("v", DataType::String, true),
            ],
            1,
        )
        .unwrap()
    }

    #[test]
    fn split_rows_partition_the_keyspace() {
        let cluster = MemCluster::new(3);
        cluster
            .create_table("t", schema(), &[vec![Value::Int64(100)], vec![Value::Int64(200)]])
            .unwrap();
        assert_eq!(cluster.tablet_count("t"), 3);
    }

    #[test]
    fn clock_is_strictly_monotonic() {
        let cluster = MemCluster::new(1);
        let a = cluster.now_micros();
        let b = cluster.now_micros();
        assert!(b > a);
    }

    #[tokio::test]
    async fn tablet_after_walks_partitions_in_order() {
        let cluster = MemCluster::new(1);
        cluster
            .create_table("t", schema(), &[vec![Value::Int64(50)]])
            .unwrap();
        let first = cluster.tablet_for_key("t", &[]).await.unwrap();
        let second = cluster
            .tablet_after("t", &first.end_key)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first.tablet_id, second.tablet_id);
        assert!(cluster
            .tablet_after("t", &second.end_key)
            .await
            .unwrap()
            .is_none());
    }
}
