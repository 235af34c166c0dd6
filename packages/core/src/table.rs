// ABOUTME: Row-oriented tabular data exchanged between steps
// ABOUTME: Includes a column-major encoding and schema description used for disk spill

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Tabular step result (the `df` output of extractors and transforms)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build from JSON objects; columns follow first-seen key order
    pub fn from_records(records: &[Value]) -> Result<Self> {
        let mut columns: Vec<String> = Vec::new();
        for (idx, record) in records.iter().enumerate() {
            let obj = record.as_object().ok_or_else(|| {
                CoreError::InvalidTable(format!("record {} is not a JSON object", idx))
            })?;
            for key in obj.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }

        let rows = records
            .iter()
            .filter_map(|r| r.as_object())
            .map(|obj| {
                columns
                    .iter()
                    .map(|c| obj.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        Ok(Self { columns, rows })
    }

    pub fn to_records(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| {
                let obj: Map<String, Value> = self
                    .columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect();
                Value::Object(obj)
            })
            .collect()
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(CoreError::InvalidTable(format!(
                "row has {} values, table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Inferred type per column from the first non-null value
    pub fn column_types(&self) -> Vec<(String, &'static str)> {
        self.columns
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let kind = self
                    .rows
                    .iter()
                    .filter_map(|row| row.get(idx))
                    .find(|v| !v.is_null())
                    .map(value_type)
                    .unwrap_or("null");
                (name.clone(), kind)
            })
            .collect()
    }

    /// Column-major encoding: `{"row_count", "columns": [{"name", "values"}]}`
    pub fn to_columnar(&self) -> Value {
        let columns: Vec<Value> = self
            .columns
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let values: Vec<Value> = self
                    .rows
                    .iter()
                    .map(|row| row.get(idx).cloned().unwrap_or(Value::Null))
                    .collect();
                json!({"name": name, "values": values})
            })
            .collect();
        json!({"row_count": self.rows.len(), "columns": columns})
    }

    pub fn from_columnar(value: &Value) -> Result<Self> {
        let row_count = value["row_count"]
            .as_u64()
            .ok_or_else(|| CoreError::InvalidTable("missing row_count".to_string()))?
            as usize;
        let encoded = value["columns"]
            .as_array()
            .ok_or_else(|| CoreError::InvalidTable("missing columns".to_string()))?;

        let mut columns = Vec::with_capacity(encoded.len());
        let mut column_values = Vec::with_capacity(encoded.len());
        for column in encoded {
            let name = column["name"]
                .as_str()
                .ok_or_else(|| CoreError::InvalidTable("column without name".to_string()))?;
            let values = column["values"].as_array().ok_or_else(|| {
                CoreError::InvalidTable(format!("column '{}' has no values", name))
            })?;
            if values.len() != row_count {
                return Err(CoreError::InvalidTable(format!(
                    "column '{}' has {} values, expected {}",
                    name,
                    values.len(),
                    row_count
                )));
            }
            columns.push(name.to_string());
            column_values.push(values);
        }

        let rows = (0..row_count)
            .map(|r| column_values.iter().map(|values| values[r].clone()).collect())
            .collect();

        Ok(Self { columns, rows })
    }

    /// Sidecar schema written next to a spilled table
    pub fn schema(&self) -> Value {
        let fields: Vec<Value> = self
            .column_types()
            .into_iter()
            .map(|(name, kind)| json!({"name": name, "type": kind}))
            .collect();
        json!({"row_count": self.rows.len(), "fields": fields})
    }
}

fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) | Value::Object(_) => "json",
    }
}
