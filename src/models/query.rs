//! Query result models.

use crate::db::types::JsonRow;
use serde::{Deserialize, Serialize};

/// Result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    /// Backend type identifier
    pub type_id: u32,
    /// Resolved through the type catalog; None for unknown identifiers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
}

impl Field {
    pub fn new(name: impl Into<String>, type_id: u32, type_name: Option<String>) -> Self {
        Self {
            name: name.into(),
            type_id,
            type_name,
        }
    }
}

/// Outcome of a buffered query.
///
/// Fields are taken from the first row, so a query returning no rows has no
/// fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Columns of the first row; empty when no row came back, even if the
    /// statement has a result shape
    pub fields: Vec<Field>,
    pub rows: Vec<JsonRow>,
    pub row_count: usize,
    /// Rows changed by INSERT/UPDATE/DELETE statements of the batch
    pub rows_affected: u64,
    pub execution_time_ms: u64,
}

impl QueryResult {
    pub fn new(fields: Vec<Field>, rows: Vec<JsonRow>, rows_affected: u64) -> Self {
        Self {
            fields,
            row_count: rows.len(),
            rows,
            rows_affected,
            execution_time_ms: 0,
        }
    }

    pub fn with_execution_time(mut self, execution_time_ms: u64) -> Self {
        self.execution_time_ms = execution_time_ms;
        self
    }

    /// Check if the result is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.rows_affected == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_result_counts_rows() {
        let mut row = JsonRow::new();
        row.insert("n".to_string(), json!(1));
        let result = QueryResult::new(
            vec![Field::new("n", 23, Some("int4".to_string()))],
            vec![row.clone(), row],
            0,
        );
        assert_eq!(result.row_count, 2);
        assert!(!result.is_empty());
    }

    #[test]
    fn test_empty_result() {
        let result = QueryResult::new(Vec::new(), Vec::new(), 0).with_execution_time(3);
        assert!(result.is_empty());
        assert_eq!(result.execution_time_ms, 3);
        assert!(!QueryResult::new(Vec::new(), Vec::new(), 2).is_empty());
    }

    #[test]
    fn test_unknown_type_name_not_serialized() {
        let value = serde_json::to_value(Field::new("g", 16_385, None)).unwrap();
        assert_eq!(value, json!({"name": "g", "type_id": 16385}));
    }
}
