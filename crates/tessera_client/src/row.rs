//! Positional rows bound to a schema.

use std::sync::Arc;

use crate::error::{ClientError, Result};
use crate::keys;
use crate::schema::Schema;
use crate::value::Value;

/// One row of typed cells. Writes fill it through the setters; scans hand
/// back rows carrying the projection's schema.
#[derive(Clone, Debug)]
pub struct Row {
    schema: Arc<Schema>,
    cells: Vec<Option<Value>>,
}

impl Row {
    pub(crate) fn new(schema: Arc<Schema>) -> Self {
        let cells = vec![None; schema.columns().len()];
        Self { schema, cells }
    }

    pub(crate) fn from_cells(schema: Arc<Schema>, cells: Vec<Option<Value>>) -> Self {
        debug_assert_eq!(cells.len(), schema.columns().len());
        Self { schema, cells }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Set a cell, checking the column exists and the type matches.
    pub fn set(&mut self, column: &str, value: Value) -> Result<()> {
        let idx = self.column_index(column)?;
        let col = self.schema.column(idx).unwrap();
        if col.data_type() != value.data_type() {
            return Err(ClientError::InvalidArgument(format!(
                "column {} is {}, got {}",
                column,
                col.data_type(),
                value.data_type()
            )));
        }
        self.cells[idx] = Some(value);
        Ok(())
    }

    /// Clear a cell back to null. Fails for non-nullable columns.
    pub fn set_null(&mut self, column: &str) -> Result<()> {
        let idx = self.column_index(column)?;
        let col = self.schema.column(idx).unwrap();
        if !col.is_nullable() {
            return Err(ClientError::InvalidArgument(format!(
                "column {column} is not nullable"
            )));
        }
        self.cells[idx] = None;
        Ok(())
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        let idx = self.schema.column_index(column)?;
        self.cells[idx].as_ref()
    }

    pub fn cell(&self, idx: usize) -> Option<&Value> {
        self.cells.get(idx)?.as_ref()
    }

    pub(crate) fn cells(&self) -> &[Option<Value>] {
        &self.cells
    }

    /// Encode the primary key of this row. All key columns must be set.
    pub(crate) fn encode_primary_key(&self) -> Result<Vec<u8>> {
        let n = self.schema.num_key_columns();
        if n == 0 {
            return Err(ClientError::IllegalState(
                "row schema has no key columns".into(),
            ));
        }
        let mut parts = Vec::with_capacity(n);
        for idx in 0..n {
            match &self.cells[idx] {
                Some(v) => parts.push(v),
                None => {
                    return Err(ClientError::InvalidArgument(format!(
                        "key column {} is not set",
                        self.schema.column(idx).unwrap().name()
                    )))
                }
            }
        }
        Ok(keys::encode_composite(&parts))
    }

    /// Approximate footprint used for mutation buffer accounting.
    pub(crate) fn size_hint(&self) -> usize {
        let cells: usize = self
            .cells
            .iter()
            .flatten()
            .map(|v| v.size_hint())
            .sum();
        // Per-cell presence overhead on the wire.
        cells + self.cells.len()
    }

    fn column_index(&self, column: &str) -> Result<usize> {
        self.schema
            .column_index(column)
            .ok_or_else(|| ClientError::InvalidArgument(format!("unknown column {column}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSchema;
    use crate::value::DataType;

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(
                vec![
                    ColumnSchema::new("k", DataType::Int64, false),
                    ColumnSchema::new("v", DataType::String, true),
                ],
                1,
            )
            .unwrap(),
        )
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let mut row = Row::new(schema());
        let err = row.set("k", Value::String("no".into())).unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    #[test]
    fn missing_key_column_fails_encoding() {
        let mut row = Row::new(schema());
        row.set("v", Value::String("x".into())).unwrap();
        assert!(row.encode_primary_key().is_err());
        row.set("k", Value::Int64(7)).unwrap();
        assert!(row.encode_primary_key().is_ok());
    }
}
