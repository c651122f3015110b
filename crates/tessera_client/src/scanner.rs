//! Cross-tablet scans.
//!
//! A scanner is configured while closed, opened against the first tablet
//! covering its key range, then paginated batch by batch. When the
//! serving tablet reports exhaustion the scanner advances to the next
//! tablet in key order, so callers observe one logical row stream in
//! primary-key order. Scanners are single-task objects; share the table
//! handle, not the scanner.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::location::{Locator, ReplicaInfo, ReplicaSelection, TabletInfo};
use crate::predicate::ColumnRangePredicate;
use crate::row::Row;
use crate::rpc::{ContinueScan, NewScan, ScanRequest, ScanResponse};
use crate::schema::Schema;
use crate::table::Table;
use crate::transport::Transport;
use crate::value::Value;

/// Batch size used when the caller gives no hint (or gave the open-only
/// zero hint and the scan has moved past its first request).
const DEFAULT_SCAN_BATCH_BYTES: u32 = 1024 * 1024;

/// Consistency mode of a scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadMode {
    /// The server returns whatever is visible when the request arrives.
    /// Fast, but not repeatable; no snapshot timestamp is assigned.
    /// This is the default.
    ReadLatest,
    /// The server reads as of a snapshot timestamp, waiting out any
    /// in-flight write with a lower logical time first. Re-reading the
    /// same timestamp with no lower-timestamped writes in between yields
    /// identical results. Without an explicit timestamp the first serving
    /// tablet assigns one, and the scanner pins it for the whole scan.
    ReadAtSnapshot,
}

struct ScanConfig {
    projection: Option<Vec<usize>>,
    predicates: Vec<ColumnRangePredicate>,
    batch_size_bytes: Option<u32>,
    selection: ReplicaSelection,
    read_mode: ReadMode,
    snapshot_micros: Option<u64>,
    lower_key: Vec<u8>,
    upper_key: Vec<u8>,
    timeout: Duration,
}

impl ScanConfig {
    fn new(timeout: Duration) -> Self {
        Self {
            projection: None,
            predicates: Vec::new(),
            batch_size_bytes: None,
            selection: ReplicaSelection::ClosestReplica,
            read_mode: ReadMode::ReadLatest,
            snapshot_micros: None,
            lower_key: Vec::new(),
            upper_key: Vec::new(),
            timeout,
        }
    }
}

struct OpenScan {
    tablet: TabletInfo,
    replica: ReplicaInfo,
    scanner_id: Option<u64>,
    token: Bytes,
    buffered: Option<Vec<Row>>,
    tablet_has_more: bool,
    /// Every tablet intersecting the range has reported exhaustion.
    finished: bool,
    pinned_snapshot: Option<u64>,
    projection: Vec<usize>,
    projected_schema: Arc<Schema>,
}

/// One logical scan over a table. Reusable: after [`Scanner::close`] the
/// object is back in its configuration state.
pub struct Scanner {
    table: Table,
    config: ScanConfig,
    open: Option<OpenScan>,
}

impl Scanner {
    pub(crate) fn new(table: Table) -> Self {
        let timeout = table.client_inner().default_timeout;
        Self {
            table,
            config: ScanConfig::new(timeout),
            open: None,
        }
    }

    /// Project the scan onto the named columns, in the given order.
    /// Defaults to the full table schema.
    pub fn set_projection(&mut self, columns: &[&str]) -> Result<()> {
        self.check_configuring()?;
        let indices = self.table.schema().resolve_columns(columns)?;
        self.config.projection = Some(indices);
        Ok(())
    }

    /// Add one conjunct. All predicates must pass for a row to be
    /// returned; there is no disjunction.
    pub fn add_conjunct_predicate(&mut self, predicate: ColumnRangePredicate) -> Result<()> {
        self.check_configuring()?;
        let schema = self.table.schema();
        let Some(idx) = schema.column_index(predicate.column()) else {
            return Err(ClientError::InvalidArgument(format!(
                "predicate on unknown column {}",
                predicate.column()
            )));
        };
        let col = schema.column(idx).unwrap();
        for bound in [predicate.lower(), predicate.upper()].into_iter().flatten() {
            if bound.data_type() != col.data_type() {
                return Err(ClientError::InvalidArgument(format!(
                    "predicate bound on {} is {}, column is {}",
                    predicate.column(),
                    bound.data_type(),
                    col.data_type()
                )));
            }
        }
        self.config.predicates.push(predicate);
        Ok(())
    }

    /// Byte-size hint for each response. Setting 0 before opening asks
    /// the first round-trip to return no rows (the server still assigns
    /// the scanner and, in snapshot mode, the timestamp).
    pub fn set_batch_size_bytes(&mut self, bytes: u32) -> Result<()> {
        self.check_configuring()?;
        self.config.batch_size_bytes = Some(bytes);
        Ok(())
    }

    /// Replica-selection policy for the scan's read path.
    pub fn set_selection(&mut self, selection: ReplicaSelection) -> Result<()> {
        self.check_configuring()?;
        self.config.selection = selection;
        Ok(())
    }

    pub fn set_read_mode(&mut self, mode: ReadMode) -> Result<()> {
        self.check_configuring()?;
        self.config.read_mode = mode;
        Ok(())
    }

    /// Snapshot timestamp, hybrid-clock microseconds. Only consulted in
    /// [`ReadMode::ReadAtSnapshot`]; ignored otherwise.
    pub fn set_snapshot_micros(&mut self, micros: u64) -> Result<()> {
        self.check_configuring()?;
        self.config.snapshot_micros = Some(micros);
        Ok(())
    }

    /// Bound the scan to a primary-key range: `lower` inclusive, `upper`
    /// exclusive. Each bound is a prefix of the key columns' values; an
    /// empty slice leaves that side unbounded.
    pub fn set_primary_key_range(&mut self, lower: &[Value], upper: &[Value]) -> Result<()> {
        self.check_configuring()?;
        self.config.lower_key = self.encode_key_prefix(lower)?;
        self.config.upper_key = self.encode_key_prefix(upper)?;
        Ok(())
    }

    /// Begin scanning: resolve the first tablet in range and issue the
    /// initial request.
    pub async fn open(&mut self) -> Result<()> {
        self.check_configuring()?;

        let schema = self.table.schema();
        let projection = match &self.config.projection {
            Some(indices) => indices.clone(),
            None => (0..schema.columns().len()).collect(),
        };
        let projected_schema = Arc::new(Schema::for_projection(
            projection
                .iter()
                .map(|idx| schema.column(*idx).unwrap().clone())
                .collect(),
        ));

        // Degenerate range: nothing can match, skip the server entirely.
        if !self.config.upper_key.is_empty() && self.config.lower_key >= self.config.upper_key {
            self.open = Some(OpenScan {
                tablet: TabletInfo {
                    tablet_id: 0,
                    start_key: Bytes::new(),
                    end_key: Bytes::new(),
                    replicas: Vec::new(),
                },
                replica: ReplicaInfo {
                    addr: String::new(),
                    is_leader: false,
                },
                scanner_id: None,
                token: Bytes::new(),
                buffered: None,
                tablet_has_more: false,
                finished: true,
                pinned_snapshot: None,
                projection,
                projected_schema,
            });
            return Ok(());
        }

        let locator = Arc::clone(&self.table.client_inner().locator);
        let tablet = locator
            .tablet_for_key(self.table.name(), &self.config.lower_key)
            .await?;
        let replica = tablet.pick_replica(self.config.selection)?.clone();

        let request = ScanRequest::Open(NewScan {
            table: self.table.name().to_string(),
            tablet_id: tablet.tablet_id,
            projection: projection.clone(),
            predicates: self.config.predicates.clone(),
            lower_key: Bytes::from(self.config.lower_key.clone()),
            upper_key: Bytes::from(self.config.upper_key.clone()),
            read_mode: self.config.read_mode,
            snapshot_micros: match self.config.read_mode {
                ReadMode::ReadAtSnapshot => self.config.snapshot_micros,
                ReadMode::ReadLatest => None,
            },
            batch_size_bytes: self.config.batch_size_bytes.unwrap_or(DEFAULT_SCAN_BATCH_BYTES),
        });

        let transport = Arc::clone(&self.table.client_inner().transport);
        let response = issue_scan(&transport, &replica, request, self.config.timeout).await?;

        debug!(
            table = self.table.name(),
            tablet = tablet.tablet_id,
            rows = response.rows.len(),
            "scan opened"
        );

        let pinned_snapshot = match self.config.read_mode {
            ReadMode::ReadAtSnapshot => response.snapshot_micros,
            ReadMode::ReadLatest => None,
        };
        self.open = Some(OpenScan {
            buffered: Some(rows_from_response(&projected_schema, &response)),
            token: response.token,
            tablet_has_more: response.has_more,
            scanner_id: Some(response.scanner_id),
            finished: false,
            pinned_snapshot,
            tablet,
            replica,
            projection,
            projected_schema,
        });
        Ok(())
    }

    /// True while any tablet in the remaining range has not reported
    /// exhaustion. A tablet with no matching rows still counts until it
    /// has been asked.
    pub fn has_more_rows(&self) -> bool {
        match &self.open {
            None => false,
            Some(open) => {
                open.buffered.as_ref().is_some_and(|b| !b.is_empty()) || !open.finished
            }
        }
    }

    /// Fetch the next batch of rows into `rows` (cleared first). Batches
    /// may be empty while `has_more_rows` is still true; the scan is done
    /// only once `has_more_rows` reports false.
    pub async fn next_batch(&mut self, rows: &mut Vec<Row>) -> Result<()> {
        rows.clear();

        let table_name = self.table.name().to_string();
        let locator = Arc::clone(&self.table.client_inner().locator);
        let transport = Arc::clone(&self.table.client_inner().transport);
        let timeout = self.config.timeout;
        let selection = self.config.selection;
        let batch_bytes = match self.config.batch_size_bytes {
            None | Some(0) => DEFAULT_SCAN_BATCH_BYTES,
            Some(bytes) => bytes,
        };

        let Some(open) = self.open.as_mut() else {
            return Err(ClientError::IllegalState("scanner is not open".into()));
        };

        loop {
            if let Some(buffered) = open.buffered.take() {
                *rows = buffered;
                return Ok(());
            }
            if open.finished {
                return Ok(());
            }

            if open.tablet_has_more {
                let request = ScanRequest::Continue(ContinueScan {
                    scanner_id: open.scanner_id.unwrap_or_default(),
                    token: open.token.clone(),
                    batch_size_bytes: batch_bytes,
                });
                let response = issue_scan(&transport, &open.replica, request, timeout).await?;
                open.token = response.token.clone();
                open.tablet_has_more = response.has_more;
                open.buffered = Some(rows_from_response(&open.projected_schema, &response));
                continue;
            }

            // Current tablet exhausted; advance in key order.
            if open.tablet.end_key.is_empty() {
                open.finished = true;
                continue;
            }
            let next = locator
                .tablet_after(&table_name, &open.tablet.end_key)
                .await?;
            let Some(tablet) = next else {
                open.finished = true;
                continue;
            };
            if !self.config.upper_key.is_empty()
                && tablet.start_key.as_ref() >= self.config.upper_key.as_slice()
            {
                open.finished = true;
                continue;
            }

            let replica = tablet.pick_replica(selection)?.clone();
            let request = ScanRequest::Open(NewScan {
                table: table_name.clone(),
                tablet_id: tablet.tablet_id,
                projection: open.projection.clone(),
                predicates: self.config.predicates.clone(),
                lower_key: Bytes::from(self.config.lower_key.clone()),
                upper_key: Bytes::from(self.config.upper_key.clone()),
                read_mode: self.config.read_mode,
                // The whole scan stays on the first tablet's snapshot.
                snapshot_micros: open.pinned_snapshot.or(match self.config.read_mode {
                    ReadMode::ReadAtSnapshot => self.config.snapshot_micros,
                    ReadMode::ReadLatest => None,
                }),
                batch_size_bytes: batch_bytes,
            });
            let response = issue_scan(&transport, &replica, request, timeout).await?;
            debug!(
                table = %table_name,
                tablet = tablet.tablet_id,
                "scan advanced to next tablet"
            );
            if open.pinned_snapshot.is_none() {
                if let ReadMode::ReadAtSnapshot = self.config.read_mode {
                    open.pinned_snapshot = response.snapshot_micros;
                }
            }
            open.tablet = tablet;
            open.replica = replica;
            open.scanner_id = Some(response.scanner_id);
            open.token = response.token.clone();
            open.tablet_has_more = response.has_more;
            open.buffered = Some(rows_from_response(&open.projected_schema, &response));
        }
    }

    /// Close the scan. Never waits and never fails: server-side scanner
    /// state is released best-effort in the background. The scanner is
    /// reset to its initial configuration; re-add projection, predicates
    /// and the rest before reopening.
    pub fn close(&mut self) {
        if let Some(open) = self.open.take() {
            if let (Some(scanner_id), false) = (open.scanner_id, open.replica.addr.is_empty()) {
                let transport = Arc::clone(&self.table.client_inner().transport);
                let replica = open.replica;
                // Outside a runtime there is nobody to run the release;
                // the server's scanner will age out on its own.
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = transport.close_scanner(&replica, scanner_id).await;
                    });
                }
            }
        }
        let timeout = self.table.client_inner().default_timeout;
        self.config = ScanConfig::new(timeout);
    }

    fn check_configuring(&self) -> Result<()> {
        if self.open.is_some() {
            return Err(ClientError::IllegalState(
                "scanner is open; close it before reconfiguring".into(),
            ));
        }
        Ok(())
    }

    fn encode_key_prefix(&self, values: &[Value]) -> Result<Vec<u8>> {
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let schema = self.table.schema();
        if values.len() > schema.num_key_columns() {
            return Err(ClientError::InvalidArgument(format!(
                "key bound has {} values, key has {} column(s)",
                values.len(),
                schema.num_key_columns()
            )));
        }
        for (idx, value) in values.iter().enumerate() {
            let col = schema.column(idx).unwrap();
            if value.data_type() != col.data_type() {
                return Err(ClientError::InvalidArgument(format!(
                    "key bound column {} is {}, got {}",
                    col.name(),
                    col.data_type(),
                    value.data_type()
                )));
            }
        }
        Ok(crate::keys::encode_composite(
            &values.iter().collect::<Vec<_>>(),
        ))
    }
}

impl std::fmt::Display for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "scan on {} ({} predicate(s), {:?}",
            self.table.name(),
            self.config.predicates.len(),
            self.config.read_mode,
        )?;
        if let Some(ts) = self.config.snapshot_micros {
            write!(f, " @ {ts}")?;
        }
        write!(f, ", {})", if self.open.is_some() { "open" } else { "configuring" })
    }
}

async fn issue_scan(
    transport: &Arc<dyn Transport>,
    replica: &ReplicaInfo,
    request: ScanRequest,
    timeout: Duration,
) -> Result<ScanResponse> {
    match tokio::time::timeout(timeout, transport.scan(replica, request)).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::TimedOut(format!(
            "scan request to {} did not complete within {timeout:?}",
            replica.addr
        ))),
    }
}

fn rows_from_response(projected_schema: &Arc<Schema>, response: &ScanResponse) -> Vec<Row> {
    response
        .rows
        .iter()
        .map(|cells| Row::from_cells(Arc::clone(projected_schema), cells.clone()))
        .collect()
}
