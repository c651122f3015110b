//! Client access layer for a tablet-partitioned distributed store.
//!
//! Two things live here: the session-based write path, which buffers
//! operations and dispatches them as one grouped request per destination
//! tablet, and the scanner, which pages through tablets in key order as
//! one logical row stream. Cluster metadata and the wire itself sit
//! behind the [`Locator`] and [`Transport`] traits; [`mem::MemCluster`]
//! implements both in-process for tests and workloads.
//!
//! ```no_run
//! # async fn demo() -> tessera_client::Result<()> {
//! use std::sync::Arc;
//! use tessera_client::{Client, FlushMode, Value};
//!
//! let cluster = Arc::new(tessera_client::mem::MemCluster::new(3));
//! let client = Client::builder()
//!     .locator(cluster.clone())
//!     .transport(cluster)
//!     .build()?;
//!
//! let table = client.open_table("metrics").await?;
//! let session = client.new_session();
//! session.set_flush_mode(FlushMode::ManualFlush)?;
//!
//! let mut insert = table.new_insert();
//! insert.row_mut().set("host", Value::String("a".into()))?;
//! session.apply(insert).await?;
//! session.flush().await?;
//! # Ok(())
//! # }
//! ```

mod batcher;
mod client;
mod error;
mod error_collector;
mod keys;
mod location;
mod op;
mod predicate;
mod row;
mod rpc;
mod scanner;
mod schema;
mod session;
mod table;
mod transport;
mod value;

pub mod mem;

pub use client::{Client, ClientBuilder};
pub use error::{ClientError, Result, RowErrorCode};
pub use error_collector::{ErrorCollector, RowError};
pub use location::{Locator, ReplicaInfo, ReplicaSelection, TabletInfo};
pub use op::{OpKind, WriteOp};
pub use predicate::ColumnRangePredicate;
pub use row::Row;
pub use rpc::{
    ContinueScan, NewScan, RowOp, RowStatus, ScanRequest, ScanResponse, WriteRequest,
    WriteResponse,
};
pub use scanner::{ReadMode, Scanner};
pub use schema::{ColumnSchema, Schema};
pub use session::{FlushMode, Session, DEFAULT_MUTATION_BUFFER_BYTES};
pub use table::Table;
pub use transport::Transport;
pub use value::{DataType, Value};
