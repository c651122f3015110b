//! Table schemas: ordered columns with a leading primary-key prefix.

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};
use crate::value::DataType;

/// One column in a table schema.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    name: String,
    data_type: DataType,
    nullable: bool,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }
}

/// Ordered column set. The first `num_key_columns` columns form the
/// table's primary key, which also defines tablet routing and scan order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<ColumnSchema>,
    num_key_columns: usize,
}

impl Schema {
    /// Build a schema. Key columns must lead, be non-nullable, and have a
    /// totally ordered type. Column names must be unique.
    pub fn new(columns: Vec<ColumnSchema>, num_key_columns: usize) -> Result<Self> {
        if columns.is_empty() {
            return Err(ClientError::InvalidArgument(
                "schema requires at least one column".into(),
            ));
        }
        if num_key_columns == 0 || num_key_columns > columns.len() {
            return Err(ClientError::InvalidArgument(format!(
                "num_key_columns {} out of range for {} column(s)",
                num_key_columns,
                columns.len()
            )));
        }
        for (idx, col) in columns.iter().enumerate() {
            if idx < num_key_columns {
                if col.nullable {
                    return Err(ClientError::InvalidArgument(format!(
                        "key column {} may not be nullable",
                        col.name
                    )));
                }
                if !col.data_type.is_keyable() {
                    return Err(ClientError::InvalidArgument(format!(
                        "key column {} has non-keyable type {}",
                        col.name, col.data_type
                    )));
                }
            }
            if columns[..idx].iter().any(|c| c.name == col.name) {
                return Err(ClientError::InvalidArgument(format!(
                    "duplicate column name {}",
                    col.name
                )));
            }
        }
        Ok(Self {
            columns,
            num_key_columns,
        })
    }

    /// Schema of a projected row set. Key metadata is not preserved.
    pub(crate) fn for_projection(columns: Vec<ColumnSchema>) -> Self {
        Self {
            columns,
            num_key_columns: 0,
        }
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn num_key_columns(&self) -> usize {
        self.num_key_columns
    }

    pub fn column(&self, idx: usize) -> Option<&ColumnSchema> {
        self.columns.get(idx)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Resolve column names to indices, e.g. for a scan projection.
    pub fn resolve_columns(&self, names: &[&str]) -> Result<Vec<usize>> {
        names
            .iter()
            .map(|name| {
                self.column_index(name).ok_or_else(|| {
                    ClientError::InvalidArgument(format!("unknown column {name}"))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_nullable_key_column() {
        let err = Schema::new(
            vec![ColumnSchema::new("k", DataType::Int64, true)],
            1,
        )
        .unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_duplicate_column_names() {
        let err = Schema::new(
            vec![
                ColumnSchema::new("k", DataType::Int64, false),
                ColumnSchema::new("k", DataType::String, true),
            ],
            1,
        )
        .unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }
}
