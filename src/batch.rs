//! In-memory row batches.
//!
//! A `RowBatch` is the unit of data flowing through the compiler: one
//! batch per chunk after projection and filtering, then one concatenated
//! batch per request. Columns are typed (string, number, timestamp) and
//! individually nullable. Batches convert to and from Arrow record
//! batches at the codec boundary.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;

use crate::error::{Error, Result};
use crate::timefmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Str(String),
    Num(f64),
    Timestamp(i64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(v) => Some(*v),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<i64> {
        match self {
            Value::Timestamp(v) => Some(*v),
            Value::Str(s) => timefmt::parse_row_time(s),
            _ => None,
        }
    }

    /// Canonical text rendering, used for group keys and value-set filters.
    /// Whole numbers render without a fractional part so that "1" matches
    /// a numeric column holding 1.0.
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Str(s) => s.clone(),
            Value::Num(v) => {
                if v.fract() == 0.0 && v.abs() < 1e15 {
                    format!("{}", *v as i64)
                } else {
                    format!("{v}")
                }
            }
            Value::Timestamp(v) => timefmt::format_datetime(*v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Str,
    Num,
    Timestamp,
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub kind: ValueKind,
    pub values: Vec<Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ValueKind, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            kind,
            values,
        }
    }

    fn nulls(name: &str, kind: ValueKind, len: usize) -> Self {
        Self {
            name: name.to_string(),
            kind,
            values: vec![Value::Null; len],
        }
    }
}

/// Ordered rows with named typed columns. All columns have equal length.
#[derive(Debug, Clone, Default)]
pub struct RowBatch {
    columns: Vec<Column>,
}

impl RowBatch {
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        if let Some(first) = columns.first() {
            let rows = first.values.len();
            for column in &columns {
                if column.values.len() != rows {
                    return Err(Error::DataFormat(format!(
                        "column {} has {} values, expected {rows}",
                        column.name,
                        column.values.len()
                    )));
                }
            }
        }
        Ok(Self { columns })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map(|c| c.values.len()).unwrap_or(0)
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn value(&self, column: usize, row: usize) -> &Value {
        &self.columns[column].values[row]
    }

    /// Build a group key from the given column indices for one row.
    pub fn row_key(&self, columns: &[usize], row: usize) -> String {
        let mut key = String::new();
        for (i, &col) in columns.iter().enumerate() {
            if i > 0 {
                key.push('\u{1f}');
            }
            key.push_str(&self.columns[col].values[row].render());
        }
        key
    }

    /// Select rows by index, preserving the given order.
    pub fn take_rows(&self, indices: &[usize]) -> RowBatch {
        let columns = self
            .columns
            .iter()
            .map(|column| Column {
                name: column.name.clone(),
                kind: column.kind,
                values: indices.iter().map(|&i| column.values[i].clone()).collect(),
            })
            .collect();
        RowBatch { columns }
    }

    /// Narrow to the named columns, in the order given. Names the batch
    /// does not contain are skipped.
    pub fn retain_columns(&self, names: &[String]) -> RowBatch {
        let columns = names
            .iter()
            .filter_map(|name| self.column(name).cloned())
            .collect();
        RowBatch { columns }
    }

    /// Concatenate batches with column-union semantics: the output carries
    /// every column any input carries (first-seen order), null-padded where
    /// an input lacks it. Tolerates schema drift across chunks.
    pub fn concat(batches: Vec<RowBatch>) -> RowBatch {
        let mut order: Vec<(String, ValueKind)> = Vec::new();
        for batch in &batches {
            for column in &batch.columns {
                if !order.iter().any(|(name, _)| name == &column.name) {
                    order.push((column.name.clone(), column.kind));
                }
            }
        }

        let mut columns: Vec<Column> = order
            .iter()
            .map(|(name, kind)| Column::new(name.clone(), *kind, Vec::new()))
            .collect();

        for batch in &batches {
            let rows = batch.num_rows();
            for column in &mut columns {
                match batch.column(&column.name) {
                    Some(source) => column.values.extend(source.values.iter().cloned()),
                    None => column.values.extend(std::iter::repeat(Value::Null).take(rows)),
                }
            }
        }

        RowBatch { columns }
    }

    /// Stable sort by the given timestamp column. Null/unparsable values
    /// sort first so they stay observable at the head of the batch.
    pub fn sort_by_time(&self, time_column: &str) -> RowBatch {
        let Some(col) = self.column_index(time_column) else {
            return self.clone();
        };
        let mut indices: Vec<usize> = (0..self.num_rows()).collect();
        indices.sort_by_key(|&i| self.columns[col].values[i].as_timestamp().unwrap_or(i64::MIN));
        self.take_rows(&indices)
    }

    /// Caller-level value filter: a row survives when, for every filter
    /// column, its rendered value is a member of that column's allowed set.
    /// AND across columns, OR within a set.
    pub fn filter_in(&self, filter_cols: &[String], filter_values: &[Vec<String>]) -> RowBatch {
        let resolved: Vec<(usize, &Vec<String>)> = filter_cols
            .iter()
            .zip(filter_values.iter())
            .filter_map(|(name, values)| self.column_index(name).map(|idx| (idx, values)))
            .collect();
        if resolved.is_empty() {
            return self.clone();
        }

        let indices: Vec<usize> = (0..self.num_rows())
            .filter(|&row| {
                resolved.iter().all(|(col, allowed)| {
                    let rendered = self.columns[*col].values[row].render();
                    allowed.iter().any(|v| v == &rendered)
                })
            })
            .collect();
        self.take_rows(&indices)
    }

    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let mut fields = Vec::with_capacity(self.columns.len());
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let (data_type, array): (DataType, ArrayRef) = match column.kind {
                ValueKind::Str => {
                    let values: Vec<Option<String>> = column
                        .values
                        .iter()
                        .map(|v| match v {
                            Value::Null => None,
                            other => Some(other.render()),
                        })
                        .collect();
                    (DataType::Utf8, Arc::new(StringArray::from(values)))
                }
                ValueKind::Num => {
                    let values: Vec<Option<f64>> =
                        column.values.iter().map(|v| v.as_num()).collect();
                    (DataType::Float64, Arc::new(Float64Array::from(values)))
                }
                ValueKind::Timestamp => {
                    let values: Vec<Option<i64>> =
                        column.values.iter().map(|v| v.as_timestamp()).collect();
                    (
                        DataType::Timestamp(TimeUnit::Microsecond, None),
                        Arc::new(TimestampMicrosecondArray::from(values)),
                    )
                }
            };
            fields.push(Field::new(&column.name, data_type, true));
            arrays.push(array);
        }
        let schema = Arc::new(Schema::new(fields));
        RecordBatch::try_new(schema, arrays).map_err(|err| Error::Codec(err.to_string()))
    }

    pub fn from_record_batches(batches: &[RecordBatch]) -> Result<RowBatch> {
        let Some(first) = batches.first() else {
            return Ok(RowBatch::empty());
        };
        let schema = first.schema();
        let mut columns: Vec<Column> = Vec::with_capacity(schema.fields().len());
        for field in schema.fields() {
            let kind = match field.data_type() {
                DataType::Utf8 => ValueKind::Str,
                DataType::Float64 => ValueKind::Num,
                DataType::Timestamp(TimeUnit::Microsecond, _) => ValueKind::Timestamp,
                other => {
                    return Err(Error::Codec(format!(
                        "unsupported column type {other} for {}",
                        field.name()
                    )))
                }
            };
            columns.push(Column::new(field.name().clone(), kind, Vec::new()));
        }

        for batch in batches {
            for (idx, column) in columns.iter_mut().enumerate() {
                let array = batch.column(idx);
                append_arrow_column(column, array)?;
            }
        }
        RowBatch::new(columns)
    }
}

fn append_arrow_column(column: &mut Column, array: &ArrayRef) -> Result<()> {
    match column.kind {
        ValueKind::Str => {
            let array = array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| Error::Codec(format!("column {} is not utf8", column.name)))?;
            for i in 0..array.len() {
                column.values.push(if array.is_null(i) {
                    Value::Null
                } else {
                    Value::Str(array.value(i).to_string())
                });
            }
        }
        ValueKind::Num => {
            let array = array
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| Error::Codec(format!("column {} is not f64", column.name)))?;
            for i in 0..array.len() {
                column.values.push(if array.is_null(i) {
                    Value::Null
                } else {
                    Value::Num(array.value(i))
                });
            }
        }
        ValueKind::Timestamp => {
            let array = array
                .as_any()
                .downcast_ref::<TimestampMicrosecondArray>()
                .ok_or_else(|| Error::Codec(format!("column {} is not timestamp", column.name)))?;
            for i in 0..array.len() {
                column.values.push(if array.is_null(i) {
                    Value::Null
                } else {
                    Value::Timestamp(array.value(i))
                });
            }
        }
    }
    Ok(())
}

/// Build a batch from string cells, per-column kinds decided by sniffing:
/// a column where every non-empty cell parses as a number is numeric, one
/// where every non-empty cell parses as a timestamp is a timestamp, and
/// anything else stays a string. Empty cells become nulls.
pub fn batch_from_string_rows(headers: &[String], rows: &[Vec<String>]) -> Result<RowBatch> {
    let mut kinds = vec![ValueKind::Num; headers.len()];
    let mut seen = vec![false; headers.len()];
    for row in rows {
        for (idx, cell) in row.iter().enumerate().take(headers.len()) {
            let cell = cell.trim();
            if cell.is_empty() {
                continue;
            }
            let observed = if cell.parse::<f64>().is_ok() {
                ValueKind::Num
            } else if timefmt::parse_row_time(cell).is_some() {
                ValueKind::Timestamp
            } else {
                ValueKind::Str
            };
            if !seen[idx] {
                kinds[idx] = observed;
                seen[idx] = true;
            } else if kinds[idx] != observed {
                kinds[idx] = ValueKind::Str;
            }
        }
    }
    for (idx, seen) in seen.iter().enumerate() {
        if !seen {
            kinds[idx] = ValueKind::Str;
        }
    }

    let mut columns: Vec<Column> = headers
        .iter()
        .zip(kinds.iter())
        .map(|(name, kind)| Column::new(name.clone(), *kind, Vec::with_capacity(rows.len())))
        .collect();
    for row in rows {
        for (idx, column) in columns.iter_mut().enumerate() {
            let cell = row.get(idx).map(|c| c.trim()).unwrap_or("");
            let value = if cell.is_empty() {
                Value::Null
            } else {
                match column.kind {
                    ValueKind::Num => cell.parse::<f64>().map(Value::Num).unwrap_or(Value::Null),
                    ValueKind::Timestamp => timefmt::parse_row_time(cell)
                        .map(Value::Timestamp)
                        .unwrap_or(Value::Null),
                    ValueKind::Str => Value::Str(cell.to_string()),
                }
            };
            column.values.push(value);
        }
    }
    RowBatch::new(columns)
}

/// Dedup helper shared by reconciliation: map from group key to the row
/// index currently winning for that key, in first-seen group order.
pub struct GroupIndex {
    order: Vec<String>,
    winners: HashMap<String, usize>,
}

impl GroupIndex {
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            winners: HashMap::new(),
        }
    }

    /// Record `row` as the winner for `key` when `replace` says the new
    /// row beats the incumbent.
    pub fn offer(&mut self, key: String, row: usize, replace: impl Fn(usize) -> bool) {
        match self.winners.get_mut(&key) {
            Some(current) => {
                if replace(*current) {
                    *current = row;
                }
            }
            None => {
                self.order.push(key.clone());
                self.winners.insert(key, row);
            }
        }
    }

    /// Winning row indices in first-seen group order.
    pub fn into_rows(self) -> Vec<usize> {
        self.order
            .iter()
            .map(|key| self.winners[key])
            .collect()
    }
}

impl Default for GroupIndex {
    fn default() -> Self {
        Self::new()
    }
}
