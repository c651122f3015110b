//! Table handles.

use std::sync::Arc;

use crate::client::ClientInner;
use crate::op::{OpKind, WriteOp};
use crate::row::Row;
use crate::scanner::Scanner;
use crate::schema::Schema;

struct TableInner {
    name: Arc<str>,
    schema: Arc<Schema>,
    client: Arc<ClientInner>,
}

/// Handle to one table on the cluster, carrying its schema. Thread-safe
/// and cheap to clone; any number of sessions and scanners may share one
/// handle.
#[derive(Clone)]
pub struct Table {
    inner: Arc<TableInner>,
}

impl Table {
    pub(crate) fn new(name: Arc<str>, schema: Arc<Schema>, client: Arc<ClientInner>) -> Self {
        Self {
            inner: Arc::new(TableInner {
                name,
                schema,
                client,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// New insert against this table. Fails on the server if the key
    /// already exists.
    pub fn new_insert(&self) -> WriteOp {
        self.new_op(OpKind::Insert)
    }

    /// New update of an existing row. Fails on the server if the key does
    /// not exist.
    pub fn new_update(&self) -> WriteOp {
        self.new_op(OpKind::Update)
    }

    /// New delete of an existing row. Only the key columns need to be
    /// set.
    pub fn new_delete(&self) -> WriteOp {
        self.new_op(OpKind::Delete)
    }

    /// New scanner over this table.
    pub fn new_scanner(&self) -> Scanner {
        Scanner::new(self.clone())
    }

    fn new_op(&self, kind: OpKind) -> WriteOp {
        WriteOp::new(
            kind,
            Arc::clone(&self.inner.name),
            Row::new(Arc::clone(&self.inner.schema)),
        )
    }

    pub(crate) fn client_inner(&self) -> &Arc<ClientInner> {
        &self.inner.client
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.inner.name)
            .finish()
    }
}
