//! Core data model for paginated open-data ingestion.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::convert::Infallible;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "odi-core";

/// Row-ordinal column added when [`WriteOptions::index_enabled`] is set.
pub const INDEX_COLUMN: &str = "index";

/// One row of semi-structured key/value data as returned by the API.
pub type Record = Map<String, Value>;

/// External dataset addressed as `{base_url}/{resource_id}.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub base_url: String,
    pub resource_id: String,
}

impl Resource {
    pub fn new(base_url: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            resource_id: resource_id.into(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!(
            "{}/{}.json",
            self.base_url.trim_end_matches('/'),
            self.resource_id
        )
    }
}

/// Ordered batch of records returned by one fetch call, tagged with the offset it was requested at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub offset: u64,
    pub records: Vec<Record>,
}

impl Page {
    pub fn new(offset: u64, records: Vec<Record>) -> Self {
        Self { offset, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Pull-based, finite-or-caller-bounded sequence of pages.
///
/// `Ok(None)` ends the sequence. Implementations must yield pages in increasing offset order.
#[async_trait]
pub trait PageSource: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn next_page(&mut self) -> Result<Option<Page>, Self::Error>;
}

/// Replays already-materialized pages in order.
#[derive(Debug, Default)]
pub struct VecPageSource {
    pages: VecDeque<Page>,
}

impl VecPageSource {
    pub fn new(pages: impl IntoIterator<Item = Page>) -> Self {
        Self {
            pages: pages.into_iter().collect(),
        }
    }

    /// Builds pages from raw record lists, assigning offsets `0, page_size, 2*page_size, ...`.
    pub fn from_records(page_size: u64, pages: impl IntoIterator<Item = Vec<Record>>) -> Self {
        Self::new(
            pages
                .into_iter()
                .enumerate()
                .map(|(idx, records)| Page::new(idx as u64 * page_size, records)),
        )
    }
}

#[async_trait]
impl PageSource for VecPageSource {
    type Error = Infallible;

    async fn next_page(&mut self) -> Result<Option<Page>, Self::Error> {
        Ok(self.pages.pop_front())
    }
}

/// Sink-side column type hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    Numeric,
    Boolean,
    Timestamp,
    Json,
    Geometry,
}

impl ColumnType {
    /// Whether `value` can be written into a column of this type. Nulls are always accepted.
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (Self::Json, _) => true,
            (Self::Text, Value::Object(_) | Value::Array(_)) => false,
            (Self::Text, _) => true,
            (Self::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Self::Integer, Value::String(s)) => s.trim().parse::<i64>().is_ok(),
            (Self::Numeric, Value::Number(_)) => true,
            (Self::Numeric, Value::String(s)) => s.trim().parse::<f64>().is_ok(),
            (Self::Boolean, Value::Bool(_)) => true,
            (Self::Boolean, Value::String(s)) => is_boolean_literal(s),
            (Self::Timestamp, Value::String(s)) => is_timestamp_literal(s),
            (Self::Geometry, Value::Object(_) | Value::String(_)) => true,
            _ => false,
        }
    }
}

// Postgres boolean input is case-insensitive and whitespace-tolerant.
fn is_boolean_literal(input: &str) -> bool {
    matches!(
        input.trim().to_ascii_lowercase().as_str(),
        "t" | "true" | "y" | "yes" | "on" | "1" | "f" | "false" | "n" | "no" | "off" | "0"
    )
}

fn is_timestamp_literal(input: &str) -> bool {
    let s = input.trim();
    DateTime::parse_from_rfc3339(s).is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").is_ok()
        || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("column {column} row {row}: expected {expected:?}, found {found}")]
    TypeMismatch {
        column: String,
        row: usize,
        expected: ColumnType,
        found: String,
    },
    #[error("column {column} has {found} values, batch has {expected} rows")]
    LengthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Error, PartialEq)]
#[error("row {row}: invalid geometry ({reason}): {payload}")]
pub struct GeometryError {
    pub row: usize,
    pub reason: &'static str,
    pub payload: String,
}

/// Canonical stand-in for missing geometry: `{"type": "Point", "coordinates": []}`.
pub fn empty_point() -> Value {
    json!({ "type": "Point", "coordinates": [] })
}

pub fn is_empty_geometry(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => {
            let s = s.trim();
            s.is_empty() || s == "null"
        }
        Some(Value::Object(map)) => map.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        _ => false,
    }
}

/// Empty payloads become [`empty_point`]; GeoJSON-like objects pass through unchanged.
pub fn normalize_geometry(row: usize, value: Option<&Value>) -> Result<Value, GeometryError> {
    if is_empty_geometry(value) {
        return Ok(empty_point());
    }
    let value = value.unwrap_or(&Value::Null);
    let Value::Object(map) = value else {
        return Err(GeometryError {
            row,
            reason: "not an object",
            payload: truncate_payload(value),
        });
    };
    if !map.get("type").is_some_and(Value::is_string) {
        return Err(GeometryError {
            row,
            reason: "missing string `type`",
            payload: truncate_payload(value),
        });
    }
    Ok(value.clone())
}

fn truncate_payload(value: &Value) -> String {
    const MAX: usize = 200;
    let text = value.to_string();
    if text.len() <= MAX {
        return text;
    }
    let mut end = MAX;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Column-major materialization of one page: column name -> values in row order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Batch {
    columns: BTreeMap<String, Vec<Value>>,
    rows: usize,
}

impl Batch {
    /// Union of all record keys becomes the column set; absent keys are filled with null.
    pub fn from_records(records: &[Record]) -> Self {
        let mut columns: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for record in records {
            for key in record.keys() {
                columns.entry(key.clone()).or_default();
            }
        }
        for (name, values) in &mut columns {
            values.extend(
                records
                    .iter()
                    .map(|r| r.get(name).cloned().unwrap_or(Value::Null)),
            );
        }
        Self {
            columns,
            rows: records.len(),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Option<&[Value]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut Vec<Value>> {
        self.columns.get_mut(name)
    }

    /// Inserts or replaces a column, returning the previous values if any.
    pub fn insert_column(
        &mut self,
        name: impl Into<String>,
        values: Vec<Value>,
    ) -> Result<Option<Vec<Value>>, SchemaError> {
        let name = name.into();
        if values.len() != self.rows {
            return Err(SchemaError::LengthMismatch {
                column: name,
                expected: self.rows,
                found: values.len(),
            });
        }
        Ok(self.columns.insert(name, values))
    }

    pub fn remove_column(&mut self, name: &str) -> Option<Vec<Value>> {
        self.columns.remove(name)
    }

    /// Renames `from` to `to`, overwriting any existing `to`. Returns false if `from` is absent.
    pub fn rename_column(&mut self, from: &str, to: impl Into<String>) -> bool {
        match self.columns.remove(from) {
            Some(values) => {
                self.columns.insert(to.into(), values);
                true
            }
            None => false,
        }
    }

    pub fn value(&self, column: &str, row: usize) -> Option<&Value> {
        self.columns.get(column).and_then(|values| values.get(row))
    }

    pub fn row(&self, row: usize) -> Option<Record> {
        if row >= self.rows {
            return None;
        }
        Some(
            self.columns
                .iter()
                .map(|(name, values)| (name.clone(), values[row].clone()))
                .collect(),
        )
    }

    /// Stable identity of a row's key columns; `None` if any key column is missing.
    pub fn key_of(&self, row: usize, key_columns: &[String]) -> Option<String> {
        let parts = key_columns
            .iter()
            .map(|col| self.value(col, row).cloned())
            .collect::<Option<Vec<_>>>()?;
        Some(Value::Array(parts).to_string())
    }

    /// Keeps rows whose mask entry is true. The mask must cover every row.
    pub fn retain_rows(&mut self, keep: &[bool]) {
        debug_assert_eq!(keep.len(), self.rows);
        for values in self.columns.values_mut() {
            let mut idx = 0;
            values.retain(|_| {
                let keep_row = keep.get(idx).copied().unwrap_or(true);
                idx += 1;
                keep_row
            });
        }
        self.rows = (0..self.rows)
            .filter(|idx| keep.get(*idx).copied().unwrap_or(true))
            .count();
    }

    /// Collapses repeated keys to their last occurrence, preserving row order. Returns rows removed.
    pub fn dedup_keep_last(&mut self, key_columns: &[String]) -> usize {
        if key_columns.is_empty() || self.rows < 2 {
            return 0;
        }
        let mut seen = HashSet::new();
        let mut keep = vec![true; self.rows];
        for row in (0..self.rows).rev() {
            if let Some(key) = self.key_of(row, key_columns) {
                if !seen.insert(key) {
                    keep[row] = false;
                }
            }
        }
        let removed = keep.iter().filter(|k| !**k).count();
        if removed > 0 {
            self.retain_rows(&keep);
        }
        removed
    }

    /// Replaces empty geometry payloads in `field` with [`empty_point`] and rejects malformed ones.
    /// A missing column is materialized as all empty points. Returns how many values were coerced.
    pub fn normalize_geometry_column(&mut self, field: &str) -> Result<usize, GeometryError> {
        let rows = self.rows;
        let values = self
            .columns
            .entry(field.to_string())
            .or_insert_with(|| vec![Value::Null; rows]);
        let mut coerced = 0;
        for (row, value) in values.iter_mut().enumerate() {
            if is_empty_geometry(Some(&*value)) {
                *value = empty_point();
                coerced += 1;
            } else {
                normalize_geometry(row, Some(&*value))?;
            }
        }
        Ok(coerced)
    }

    /// Checks every column against its hint; unhinted columns are checked against `fallback`.
    pub fn validate(
        &self,
        column_types: &BTreeMap<String, ColumnType>,
        fallback: ColumnType,
    ) -> Result<(), SchemaError> {
        for (column, values) in &self.columns {
            let expected = column_types.get(column).copied().unwrap_or(fallback);
            if let Some((row, found)) = values
                .iter()
                .enumerate()
                .find(|(_, v)| !expected.accepts(v))
            {
                return Err(SchemaError::TypeMismatch {
                    column: column.clone(),
                    row,
                    expected,
                    found: truncate_payload(found),
                });
            }
        }
        Ok(())
    }
}

/// Destination table. The primary key columns drive conflict detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadTarget {
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub constraint: Option<String>,
}

impl LoadTarget {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            primary_key: Vec::new(),
            constraint: None,
        }
    }

    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Declared primary-key constraint, `{table}_pkey` unless overridden.
    pub fn constraint_name(&self) -> String {
        self.constraint
            .clone()
            .unwrap_or_else(|| format!("{}_pkey", self.table))
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// What happens to an incoming row whose primary key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    Skip,
    Update,
}

/// Options recognized by a sink write.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WriteOptions {
    #[serde(default)]
    pub column_types: BTreeMap<String, ColumnType>,
    #[serde(default)]
    pub index_enabled: bool,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

impl WriteOptions {
    pub fn column_type(&self, column: &str) -> ColumnType {
        match self.column_types.get(column) {
            Some(hint) => *hint,
            None if self.index_enabled && column == INDEX_COLUMN => ColumnType::Integer,
            None => ColumnType::Text,
        }
    }

    /// Hints with the implied `index` column filled in.
    pub fn effective_column_types(&self) -> BTreeMap<String, ColumnType> {
        let mut types = self.column_types.clone();
        if self.index_enabled {
            types
                .entry(INDEX_COLUMN.to_string())
                .or_insert(ColumnType::Integer);
        }
        types
    }
}
