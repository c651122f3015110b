//! Write operations: insert, update, delete.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::row::Row;

/// Kind tag of a write operation. The set is closed; dispatch is by
/// `match`, not trait objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }
}

/// One pending write against a table row.
///
/// Created through [`Table::new_insert`](crate::Table::new_insert) and
/// friends, filled in via [`WriteOp::row_mut`], then handed to a session.
/// The session (and the batcher behind it) owns the operation until it is
/// delivered or handed back inside a [`RowError`](crate::RowError).
#[derive(Clone, Debug)]
pub struct WriteOp {
    kind: OpKind,
    table_name: Arc<str>,
    row: Row,
}

impl WriteOp {
    pub(crate) fn new(kind: OpKind, table_name: Arc<str>, row: Row) -> Self {
        Self {
            kind,
            table_name,
            row,
        }
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn row(&self) -> &Row {
        &self.row
    }

    pub fn row_mut(&mut self) -> &mut Row {
        &mut self.row
    }

    /// Routing key: the encoded primary key of the target row.
    pub(crate) fn encoded_key(&self) -> Result<Vec<u8>> {
        self.row.encode_primary_key()
    }

    /// Footprint charged against the session's mutation buffer.
    pub(crate) fn size_hint(&self) -> usize {
        // Kind tag plus table-name routing overhead plus the row payload.
        1 + self.table_name.len() + self.row.size_hint()
    }
}

impl std::fmt::Display for WriteOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} on {}", self.kind.as_str(), self.table_name)
    }
}
