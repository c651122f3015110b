//! Shared helpers for integration tests.

use std::sync::Arc;

use tessera_client::mem::MemCluster;
use tessera_client::{
    Client, ColumnSchema, DataType, ReadMode, Row, Schema, Session, Table, Value, WriteOp,
};

pub const TABLE: &str = "events";

/// `id` int64 key, `val` nullable string payload.
pub fn test_schema() -> Schema {
    Schema::new(
        vec![
            ColumnSchema::new("id", DataType::Int64, false),
            ColumnSchema::new("val", DataType::String, true),
        ],
        1,
    )
    .unwrap()
}

pub struct Fixture {
    pub cluster: Arc<MemCluster>,
    pub client: Client,
    pub table: Table,
}

/// Cluster with one table range-partitioned at the given key splits.
pub async fn fixture(splits: &[i64]) -> Fixture {
    let cluster = Arc::new(MemCluster::new(3));
    let split_rows: Vec<Vec<Value>> = splits.iter().map(|s| vec![Value::Int64(*s)]).collect();
    cluster.create_table(TABLE, test_schema(), &split_rows).unwrap();

    let client = Client::builder()
        .locator(cluster.clone())
        .transport(cluster.clone())
        .build()
        .unwrap();
    let table = client.open_table(TABLE).await.unwrap();
    Fixture {
        cluster,
        client,
        table,
    }
}

pub fn insert(table: &Table, id: i64, val: &str) -> WriteOp {
    let mut op = table.new_insert();
    op.row_mut().set("id", Value::Int64(id)).unwrap();
    op.row_mut().set("val", Value::String(val.into())).unwrap();
    op
}

pub fn update(table: &Table, id: i64, val: &str) -> WriteOp {
    let mut op = table.new_update();
    op.row_mut().set("id", Value::Int64(id)).unwrap();
    op.row_mut().set("val", Value::String(val.into())).unwrap();
    op
}

pub fn delete(table: &Table, id: i64) -> WriteOp {
    let mut op = table.new_delete();
    op.row_mut().set("id", Value::Int64(id)).unwrap();
    op
}

/// Insert `ids` through a dedicated sync-mode session.
pub async fn insert_rows(client: &Client, table: &Table, ids: &[i64]) {
    let session = client.new_session();
    for id in ids {
        session.apply(insert(table, *id, &format!("v{id}"))).await.unwrap();
    }
    session.close().unwrap();
}

pub fn row_id(row: &Row) -> i64 {
    match row.get("id") {
        Some(Value::Int64(id)) => *id,
        other => panic!("unexpected id cell: {other:?}"),
    }
}

/// Scan every row in key order and return the ids.
pub async fn scan_ids(table: &Table, mode: ReadMode, snapshot: Option<u64>) -> Vec<i64> {
    let mut scanner = table.new_scanner();
    scanner.set_read_mode(mode).unwrap();
    if let Some(ts) = snapshot {
        scanner.set_snapshot_micros(ts).unwrap();
    }
    scanner.open().await.unwrap();

    let mut ids = Vec::new();
    let mut rows = Vec::new();
    while scanner.has_more_rows() {
        scanner.next_batch(&mut rows).await.unwrap();
        ids.extend(rows.iter().map(row_id));
    }
    scanner.close();
    ids
}

/// Latest-visible ids, the common case.
pub async fn all_ids(table: &Table) -> Vec<i64> {
    scan_ids(table, ReadMode::ReadLatest, None).await
}

/// Drain a session's collector, panicking if it did not hold exactly
/// `expected` errors.
pub fn drain_errors(session: &Session, expected: usize) -> Vec<tessera_client::RowError> {
    let (errors, _overflowed) = session.pending_errors();
    assert_eq!(errors.len(), expected, "unexpected pending error count");
    errors
}
