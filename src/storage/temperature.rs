//! Thermometry logs written by the cryostat monitoring.
//!
//! A log directory holds CSV files whose first column is `epoch` (Unix seconds) and
//! whose other columns are thermometer readings. All files are merged and sorted by
//! epoch, and readings are interpolated linearly to the epoch of a measurement.

use crate::error::{ReadoutError, ReadoutResult};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemperatureLog {
    epochs: Vec<f64>,
    /// Column name to readings, aligned with `epochs`. Missing readings are NaN.
    columns: BTreeMap<String, Vec<f64>>,
}

impl TemperatureLog {
    /// Build a log from rows of `(epoch, readings)`. Rows are sorted by epoch.
    pub fn from_rows(rows: Vec<(f64, BTreeMap<String, f64>)>) -> Self {
        let mut rows = rows;
        rows.retain(|(epoch, _)| epoch.is_finite());
        rows.sort_by(|a, b| a.0.total_cmp(&b.0));
        let names: std::collections::BTreeSet<String> =
            rows.iter().flat_map(|(_, readings)| readings.keys().cloned()).collect();
        let columns = names
            .into_iter()
            .map(|name| {
                let values = rows
                    .iter()
                    .map(|(_, readings)| readings.get(&name).copied().unwrap_or(f64::NAN))
                    .collect();
                (name, values)
            })
            .collect();
        Self {
            epochs: rows.iter().map(|(epoch, _)| *epoch).collect(),
            columns,
        }
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn thermometers(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Interpolated reading of every thermometer at `epoch`. A thermometer is left out
    /// when `epoch` is not bracketed by two of its valid readings.
    pub fn temperatures_at(&self, epoch: f64) -> BTreeMap<String, f64> {
        self.columns
            .iter()
            .filter_map(|(name, values)| interpolate(&self.epochs, values, epoch).map(|t| (name.clone(), t)))
            .collect()
    }
}

fn interpolate(epochs: &[f64], values: &[f64], epoch: f64) -> Option<f64> {
    let valid: Vec<(f64, f64)> = epochs
        .iter()
        .zip(values)
        .filter(|(_, v)| v.is_finite())
        .map(|(&e, &v)| (e, v))
        .collect();
    let above = valid.partition_point(|&(e, _)| e < epoch);
    match (above.checked_sub(1).and_then(|i| valid.get(i)), valid.get(above)) {
        (_, Some(&(e1, v1))) if e1 == epoch => Some(v1),
        (Some(&(e0, v0)), Some(&(e1, v1))) => Some(v0 + (v1 - v0) * (epoch - e0) / (e1 - e0)),
        _ => None,
    }
}

#[cfg(feature = "storage_csv")]
impl TemperatureLog {
    /// Read every `.csv` file in `directory`.
    pub fn load_dir(directory: impl AsRef<Path>) -> ReadoutResult<Self> {
        let directory = directory.as_ref();
        let mut paths: Vec<_> = std::fs::read_dir(directory)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "csv"))
            .collect();
        paths.sort();
        let mut rows = Vec::new();
        for path in &paths {
            rows.extend(read_rows(path)?);
        }
        tracing::debug!(files = paths.len(), rows = rows.len(), "temperature logs loaded");
        Ok(Self::from_rows(rows))
    }
}

#[cfg(feature = "storage_csv")]
fn read_rows(path: &Path) -> ReadoutResult<Vec<(f64, BTreeMap<String, f64>)>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
    if headers.first().map(String::as_str) != Some("epoch") {
        return Err(ReadoutError::Shape(format!(
            "{} does not start with an epoch column",
            path.display()
        )));
    }
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut fields = record.iter().map(|f| f.trim().parse::<f64>().unwrap_or(f64::NAN));
        let epoch = fields.next().unwrap_or(f64::NAN);
        let readings = headers[1..].iter().cloned().zip(fields).collect();
        rows.push((epoch, readings));
    }
    Ok(rows)
}

#[cfg(not(feature = "storage_csv"))]
impl TemperatureLog {
    pub fn load_dir(_directory: impl AsRef<Path>) -> ReadoutResult<Self> {
        Err(ReadoutError::FeatureNotEnabled("storage_csv".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(name: &str, value: f64) -> BTreeMap<String, f64> {
        BTreeMap::from([(name.to_string(), value)])
    }

    #[test]
    fn test_interpolation_and_gaps() {
        let log = TemperatureLog::from_rows(vec![
            (20.0, reading("package", 0.3)),
            (10.0, reading("package", 0.1)),
            (15.0, BTreeMap::from([("package".to_string(), f64::NAN), ("still".to_string(), 0.8)])),
        ]);
        assert_eq!(log.len(), 3);
        let t = log.temperatures_at(12.5);
        assert!((t["package"] - 0.15).abs() < 1e-12);
        // "still" has a single reading, so only its exact epoch is covered.
        assert!(!t.contains_key("still"));
        assert_eq!(log.temperatures_at(15.0)["still"], 0.8);
        assert_eq!(log.temperatures_at(10.0)["package"], 0.1);
        assert!(log.temperatures_at(25.0).is_empty());
        assert!(log.temperatures_at(5.0).is_empty());
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn test_load_dir_merges_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.csv"), "epoch,package,still\n30,0.5,0.9\n").unwrap();
        std::fs::write(dir.path().join("a.csv"), "epoch,package,still\n10,0.1,0.7\n20,0.3,\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let log = TemperatureLog::load_dir(dir.path()).unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log.thermometers().collect::<Vec<_>>(), vec!["package", "still"]);
        let t = log.temperatures_at(25.0);
        assert!((t["package"] - 0.4).abs() < 1e-12);
        assert!((t["still"] - 0.85).abs() < 1e-12);

        std::fs::write(dir.path().join("c.csv"), "time,package\n1,2\n").unwrap();
        assert!(TemperatureLog::load_dir(dir.path()).is_err());
    }
}
