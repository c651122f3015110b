//! Column range predicates pushed down to the serving tablet.

use serde::{Deserialize, Serialize};

use crate::schema::Schema;
use crate::value::Value;

/// Inclusive range predicate over one column. Predicates on a scan are
/// conjunctive: every predicate must pass for a row to be returned.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnRangePredicate {
    column: String,
    lower: Option<Value>,
    upper: Option<Value>,
}

impl ColumnRangePredicate {
    /// Bound `column` to `[lower, upper]`. A `None` bound is open.
    pub fn new(column: impl Into<String>, lower: Option<Value>, upper: Option<Value>) -> Self {
        Self {
            column: column.into(),
            lower,
            upper,
        }
    }

    pub fn equality(column: impl Into<String>, value: Value) -> Self {
        Self {
            column: column.into(),
            lower: Some(value.clone()),
            upper: Some(value),
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn lower(&self) -> Option<&Value> {
        self.lower.as_ref()
    }

    pub fn upper(&self) -> Option<&Value> {
        self.upper.as_ref()
    }

    /// Evaluate against a full (unprojected) row. Null cells never match a
    /// bounded predicate.
    pub(crate) fn matches(&self, schema: &Schema, cells: &[Option<Value>]) -> bool {
        let Some(idx) = schema.column_index(&self.column) else {
            return false;
        };
        let Some(cell) = cells.get(idx).and_then(|c| c.as_ref()) else {
            return self.lower.is_none() && self.upper.is_none();
        };
        if let Some(lower) = &self.lower {
            match cell.try_cmp(lower) {
                Some(ord) if ord != std::cmp::Ordering::Less => {}
                _ => return false,
            }
        }
        if let Some(upper) = &self.upper {
            match cell.try_cmp(upper) {
                Some(ord) if ord != std::cmp::Ordering::Greater => {}
                _ => return false,
            }
        }
        true
    }
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
                ColumnSchema::new("score", DataType::Int32, true),
            ],
            1,
        )
        .unwrap()
    }

    #[test]
    fn bounds_are_inclusive() {
        let schema = schema();
        let pred = ColumnRangePredicate::new("score", Some(Value::Int32(10)), Some(Value::Int32(20)));
        let row = |v: i32| vec![Some(Value::Int64(1)), Some(Value::Int32(v))];
        assert!(pred.matches(&schema, &row(10)));
        assert!(pred.matches(&schema, &row(20)));
        assert!(!pred.matches(&schema, &row(9)));
        assert!(!pred.matches(&schema, &row(21)));
    }

    #[test]
    fn null_cell_fails_bounded_predicate() {
        let schema = schema();
        let pred = ColumnRangePredicate::new("score", Some(Value::Int32(0)), None);
        assert!(!pred.matches(&schema, &[Some(Value::Int64(1)), None]));
    }
}
