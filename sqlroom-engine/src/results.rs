//! Materialized query results and their wire encodings.
//!
//! - Arrow IPC stream (columnar, binary frames)
//! - JSON records (row-oriented, text frames)
//!
//! SQLite values are dynamically typed, so each column's Arrow type is
//! inferred from the values it actually holds:
//!
//! | Values present           | Arrow type |
//! |--------------------------|------------|
//! | any text                 | Utf8       |
//! | any blob (no text)       | Binary     |
//! | any real (no text/blob)  | Float64    |
//! | integers only            | Int64      |
//! | nulls only / no rows     | Null       |

use arrow::array::{ArrayRef, BinaryArray, Float64Array, Int64Array, NullArray, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use base64::Engine as _;
use rusqlite::types::Value;
use rusqlite::Statement;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::EngineError;

/// Rows read from one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    /// Run a prepared statement to completion and collect every row.
    pub fn collect(stmt: &mut Statement<'_>) -> Result<Self, EngineError> {
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = columns.len();
        let mut rows = Vec::new();
        let mut cursor = stmt.query([])?;
        while let Some(row) = cursor.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(row.get::<_, Value>(i)?);
            }
            rows.push(values);
        }
        Ok(Self { columns, rows })
    }

    /// A statement that produced no result columns (DDL, DML).
    pub fn has_columns(&self) -> bool {
        !self.columns.is_empty()
    }

    fn column_type(&self, index: usize) -> DataType {
        let (mut text, mut blob, mut real, mut int) = (false, false, false, false);
        for row in &self.rows {
            match &row[index] {
                Value::Text(_) => text = true,
                Value::Blob(_) => blob = true,
                Value::Real(_) => real = true,
                Value::Integer(_) => int = true,
                Value::Null => {}
            }
        }
        if text {
            DataType::Utf8
        } else if blob {
            DataType::Binary
        } else if real {
            DataType::Float64
        } else if int {
            DataType::Int64
        } else {
            DataType::Null
        }
    }

    fn column_array(&self, index: usize, data_type: &DataType) -> ArrayRef {
        let values = self.rows.iter().map(|row| &row[index]);
        match data_type {
            DataType::Utf8 => Arc::new(StringArray::from(
                values.map(value_as_text).collect::<Vec<Option<String>>>(),
            )),
            DataType::Binary => {
                let owned: Vec<Option<Vec<u8>>> = values.map(value_as_bytes).collect();
                Arc::new(BinaryArray::from(
                    owned.iter().map(|v| v.as_deref()).collect::<Vec<Option<&[u8]>>>(),
                ))
            }
            DataType::Float64 => Arc::new(Float64Array::from(
                values
                    .map(|v| match v {
                        Value::Real(f) => Some(*f),
                        Value::Integer(i) => Some(*i as f64),
                        _ => None,
                    })
                    .collect::<Vec<Option<f64>>>(),
            )),
            DataType::Int64 => Arc::new(Int64Array::from(
                values
                    .map(|v| match v {
                        Value::Integer(i) => Some(*i),
                        _ => None,
                    })
                    .collect::<Vec<Option<i64>>>(),
            )),
            _ => Arc::new(NullArray::new(self.rows.len())),
        }
    }

    /// Build a single Arrow record batch. `None` for column-less results.
    pub fn to_record_batch(&self) -> Result<Option<RecordBatch>, EngineError> {
        if !self.has_columns() {
            return Ok(None);
        }
        let mut fields = Vec::with_capacity(self.columns.len());
        let mut arrays = Vec::with_capacity(self.columns.len());
        for (index, name) in self.columns.iter().enumerate() {
            let data_type = self.column_type(index);
            arrays.push(self.column_array(index, &data_type));
            fields.push(Field::new(name, data_type, true));
        }
        let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?;
        Ok(Some(batch))
    }

    /// Encode as an Arrow IPC stream. `None` for column-less results.
    pub fn to_arrow_ipc(&self) -> Result<Option<Vec<u8>>, EngineError> {
        let batch = match self.to_record_batch()? {
            Some(batch) => batch,
            None => return Ok(None),
        };
        let mut buf = Vec::new();
        {
            let mut writer = StreamWriter::try_new(&mut buf, &batch.schema())?;
            writer.write(&batch)?;
            writer.finish()?;
        }
        Ok(Some(buf))
    }

    /// Encode as a JSON array of row objects.
    /// Encode rows as JSON objects. Fails on duplicate column names, which
    /// records cannot represent.
    pub fn to_json_records(&self) -> Result<String, EngineError> {
        let mut seen = HashSet::with_capacity(self.columns.len());
        if let Some(dup) = self.columns.iter().find(|name| !seen.insert(name.as_str())) {
            return Err(EngineError::DuplicateColumn(dup.clone()));
        }
        let records: Vec<serde_json::Map<String, serde_json::Value>> = self
            .rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().map(value_to_json))
                    .collect()
            })
            .collect();
        Ok(serde_json::to_string(&records)?)
    }
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(f) => Some(f.to_string()),
        Value::Text(s) => Some(s.clone()),
        Value::Blob(b) => Some(String::from_utf8_lossy(b).into_owned()),
    }
}

fn value_as_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Blob(b) => Some(b.clone()),
        Value::Text(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Real(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Blob(b) => {
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
    }
}
