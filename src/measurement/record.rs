//! Flat analysis rows built from measurements.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Where a measurement was loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    /// The data directory.
    pub path: PathBuf,
    /// The node file name inside the directory.
    pub node: String,
}

/// One row of named values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(pub BTreeMap<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert any serializable value. Values that cannot be represented become `null`.
    pub fn insert<T: Serialize>(&mut self, key: impl Into<String>, value: T) {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn extend(&mut self, values: BTreeMap<String, Value>) {
        self.0.extend(values);
    }

    /// Insert every item with `prefix_` prepended to its key.
    pub fn extend_prefixed(&mut self, prefix: &str, values: BTreeMap<String, Value>) {
        for (key, value) in values {
            self.0.insert(format!("{}_{}", prefix, key), value);
        }
    }

    pub fn add_origin(&mut self, origin: Option<&Origin>) {
        if let Some(origin) = origin {
            self.insert("origin_path", origin.path.display().to_string());
            self.insert("origin_node", origin.node.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Rows that may not share every column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordTable {
    pub rows: Vec<Record>,
}

impl RecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: Record) {
        self.rows.push(record);
    }

    pub fn extend(&mut self, other: RecordTable) {
        self.rows.extend(other.rows);
    }

    /// The union of all keys, sorted.
    pub fn columns(&self) -> Vec<String> {
        let columns: BTreeSet<&String> = self.rows.iter().flat_map(|r| r.0.keys()).collect();
        columns.into_iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl From<Vec<Record>> for RecordTable {
    fn from(rows: Vec<Record>) -> Self {
        Self { rows }
    }
}

impl FromIterator<Record> for RecordTable {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}
