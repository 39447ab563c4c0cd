//! CSV export of record tables.

use crate::error::ReadoutResult;
use crate::measurement::RecordTable;
use std::path::Path;

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use serde_json::Value;
    use tracing::info;

    /// Scalars are written as-is, null as an empty field, and arrays or objects as
    /// compact JSON.
    fn field(value: Option<&Value>) -> String {
        match value {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(Value::Bool(b)) => b.to_string(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => other.to_string(),
        }
    }

    /// Write `table` with one column per key appearing in any row.
    pub fn write_records_csv(path: &Path, table: &RecordTable) -> ReadoutResult<()> {
        let columns = table.columns();
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(&columns)?;
        for row in &table.rows {
            writer.write_record(columns.iter().map(|c| field(row.get(c))))?;
        }
        writer.flush()?;
        info!(path = %path.display(), rows = table.len(), columns = columns.len(), "records exported");
        Ok(())
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;
    use crate::error::ReadoutError;

    pub fn write_records_csv(_path: &Path, _table: &RecordTable) -> ReadoutResult<()> {
        Err(ReadoutError::FeatureNotEnabled("storage_csv".to_string()))
    }
}

#[cfg(feature = "storage_csv")]
use csv_enabled as backend;

#[cfg(not(feature = "storage_csv"))]
use csv_disabled as backend;

pub fn write_records_csv(path: impl AsRef<Path>, table: &RecordTable) -> ReadoutResult<()> {
    backend::write_records_csv(path.as_ref(), table)
}

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use crate::measurement::Record;
    use num_complex::Complex64;

    #[test]
    fn test_ragged_rows_share_a_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");
        let mut first = Record::new();
        first.insert("f_0", 100e6);
        first.insert("description", "a, b");
        let mut second = Record::new();
        second.insert("f_0", 101e6);
        second.insert("s21", Complex64::new(1.0, 2.0));
        second.insert("missing", Option::<f64>::None);
        write_records_csv(&path, &RecordTable::from(vec![first, second])).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(headers, vec!["description", "f_0", "missing", "s21"]);
        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(&rows[0][0], "a, b");
        assert_eq!(&rows[0][3], "");
        assert_eq!(&rows[1][1], "101000000.0");
        assert_eq!(&rows[1][2], "");
        assert!(rows[1][3].starts_with('['));
    }
}
