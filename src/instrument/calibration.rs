//! Thermometer calibration curves and their storage in SIM thermometry modules.

use super::sim900::{parse_reply, SimLink};
use crate::error::{ReadoutError, ReadoutResult};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Largest fractional difference accepted when reading a written curve back.
pub const MAXIMUM_FRACTIONAL_ERROR: f64 = 1e-4;

/// Sensor readings (ohms or volts) and the temperatures they correspond to.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationCurve {
    pub sensor: Vec<f64>,
    pub temperature: Vec<f64>,
    /// Stored uppercase, the way the modules report it.
    pub identification: String,
    pub format: String,
}

impl CalibrationCurve {
    /// Sensor values must be strictly monotonic, in either direction.
    pub fn new(
        sensor: Vec<f64>,
        temperature: Vec<f64>,
        identification: &str,
        format: &str,
    ) -> ReadoutResult<Self> {
        if sensor.len() != temperature.len() {
            return Err(ReadoutError::Shape(format!(
                "{} sensor points and {} temperature points",
                sensor.len(),
                temperature.len()
            )));
        }
        let increasing = sensor.windows(2).all(|w| w[1] > w[0]);
        let decreasing = sensor.windows(2).all(|w| w[1] < w[0]);
        if !(increasing || decreasing) {
            return Err(ReadoutError::InvalidArgument(
                "sensor values must be strictly monotonic".to_string(),
            ));
        }
        Ok(Self {
            sensor,
            temperature,
            identification: identification.to_uppercase(),
            format: format.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.sensor.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensor.is_empty()
    }

    /// True when `other` has the same identification and format and every point agrees
    /// within [`MAXIMUM_FRACTIONAL_ERROR`].
    pub fn matches(&self, other: &CalibrationCurve) -> bool {
        let close = |a: &[f64], b: &[f64]| {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x / y - 1.0).abs() < MAXIMUM_FRACTIONAL_ERROR)
        };
        close(&other.sensor, &self.sensor)
            && close(&other.temperature, &self.temperature)
            && other.identification == self.identification
            && other.format == self.format
    }
}

/// Read a two-column text file. The identification is the file stem.
pub fn load_curve(path: impl AsRef<Path>, format: &str) -> ReadoutResult<CalibrationCurve> {
    let path = path.as_ref();
    let identification = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| ReadoutError::InvalidArgument(format!("{} has no file name", path.display())))?;
    let text = std::fs::read_to_string(path)?;
    let mut sensor = Vec::new();
    let mut temperature = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let values: Vec<f64> = line
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<_, _>>()
            .map_err(|e| ReadoutError::InvalidArgument(format!("{} line {}: {}", path.display(), number + 1, e)))?;
        if values.len() != 2 {
            return Err(ReadoutError::Shape(format!(
                "{} line {} has {} columns, expected 2",
                path.display(),
                number + 1,
                values.len()
            )));
        }
        sensor.push(values[0]);
        temperature.push(values[1]);
    }
    CalibrationCurve::new(sensor, temperature, identification, format)
}

/// Write `<IDENTIFICATION>.txt` in `directory` with tab-separated columns and CRLF line ends.
pub fn save_curve(directory: impl AsRef<Path>, curve: &CalibrationCurve) -> ReadoutResult<PathBuf> {
    let path = directory.as_ref().join(format!("{}.txt", curve.identification));
    let mut text = String::new();
    for (s, t) in curve.sensor.iter().zip(&curve.temperature) {
        // Writing to a String cannot fail.
        let _ = write!(text, "{:.5}\t{:.5}\r\n", s, t);
    }
    std::fs::write(&path, text)?;
    Ok(path)
}

/// Format, identification and number of points of a stored curve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurveInfo {
    pub format: String,
    pub identification: String,
    pub points: usize,
}

/// Curve storage shared by the SIM921 bridge and the SIM922 diode monitor.
///
/// For the SIM921 the curve number is calibration curve 1–3. For the SIM922 it is the
/// diode channel 1–4, each of which holds one user curve.
#[async_trait]
pub trait SimThermometer: SimLink {
    /// Separator between the two values of a `CAPT?` reply.
    const CAPT_SEPARATOR: char;
    const MAXIMUM_POINTS: usize;
    /// Pause after each `CAPT` write; faster writes drop points.
    const WRITE_DELAY: Duration;

    async fn curve_info(&mut self, number: u8) -> Result<CurveInfo> {
        let reply = self.query(&format!("CINI? {}", number)).await?;
        let fields: Vec<&str> = reply.split(',').map(str::trim).collect();
        if fields.len() < 3 {
            bail!("Unexpected CINI? reply '{}'", reply);
        }
        Ok(CurveInfo {
            format: fields[0].to_string(),
            identification: fields[1].to_string(),
            points: parse_reply(fields[2], "CINI?")?,
        })
    }

    async fn initialize_curve(&mut self, number: u8, format: &str, identification: &str) -> Result<()> {
        self.send(&format!("CINI {}, {}, {}", number, format, identification)).await
    }

    async fn read_curve(&mut self, number: u8) -> Result<CalibrationCurve> {
        let info = self.curve_info(number).await?;
        let mut sensor = Vec::with_capacity(info.points);
        let mut temperature = Vec::with_capacity(info.points);
        // Point indices are one-based.
        for n in 1..=info.points {
            let reply = self.query(&format!("CAPT? {}, {}", number, n)).await?;
            let values: Vec<&str> = reply
                .split(Self::CAPT_SEPARATOR)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .collect();
            if values.len() != 2 {
                bail!("Unexpected CAPT? reply '{}' for point {}", reply, n);
            }
            sensor.push(parse_reply(values[0], "CAPT?")?);
            temperature.push(parse_reply(values[1], "CAPT?")?);
        }
        CalibrationCurve::new(sensor, temperature, &info.identification, &info.format)
            .with_context(|| format!("Stored curve {} is not a valid calibration", number))
    }

    async fn validate_curve(&mut self, number: u8, curve: &CalibrationCurve) -> Result<bool> {
        let stored = self.read_curve(number).await?;
        let valid = curve.matches(&stored);
        debug!(number, valid, points = stored.len(), "curve validated");
        Ok(valid)
    }

    async fn write_curve(&mut self, number: u8, curve: &CalibrationCurve) -> Result<()> {
        if curve.len() > Self::MAXIMUM_POINTS {
            bail!(
                "Curve {} has {} points; at most {} can be stored",
                curve.identification,
                curve.len(),
                Self::MAXIMUM_POINTS
            );
        }
        self.initialize_curve(number, &curve.format, &curve.identification).await?;
        let lines: Vec<String> = curve
            .sensor
            .iter()
            .zip(&curve.temperature)
            .map(|(s, t)| format!("CAPT {}, {}, {}", number, s, t))
            .collect();
        self.send_paced(&lines, Self::WRITE_DELAY).await?;
        if !self.validate_curve(number, curve).await? {
            bail!("Curve {} was not written correctly", curve.identification);
        }
        info!(number, identification = %curve.identification, points = curve.len(), "curve written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_curve_validation() {
        let curve = CalibrationCurve::new(vec![1.0, 2.0], vec![10.0, 5.0], "ruox-1", "0").unwrap();
        assert_eq!(curve.identification, "RUOX-1");
        assert!(CalibrationCurve::new(vec![3.0, 2.0, 1.0], vec![1.0, 2.0, 3.0], "d", "0").is_ok());
        assert!(CalibrationCurve::new(vec![1.0, 1.0], vec![1.0, 2.0], "x", "0").is_err());
        assert!(CalibrationCurve::new(vec![1.0, 2.0, 1.5], vec![1.0, 2.0, 3.0], "x", "0").is_err());
        assert!(CalibrationCurve::new(vec![1.0], vec![1.0, 2.0], "x", "0").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let curve = CalibrationCurve::new(vec![1000.0, 2000.5], vec![4.2, 0.123456], "rox", "0").unwrap();
        let path = save_curve(dir.path(), &curve).unwrap();
        assert_eq!(path.file_name().unwrap(), "ROX.txt");
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "1000.00000\t4.20000\r\n2000.50000\t0.12346\r\n");
        let loaded = load_curve(&path, "0").unwrap();
        assert_eq!(loaded.identification, "ROX");
        assert_eq!(loaded.sensor, vec![1000.0, 2000.5]);
        assert!((loaded.temperature[1] - 0.12346).abs() < 1e-12);
    }

    #[test]
    fn test_matches_tolerance() {
        let a = CalibrationCurve::new(vec![1.0, 2.0], vec![3.0, 4.0], "A", "0").unwrap();
        let b = CalibrationCurve::new(vec![1.00001, 2.0], vec![3.0, 4.0], "A", "0").unwrap();
        let c = CalibrationCurve::new(vec![1.001, 2.0], vec![3.0, 4.0], "A", "0").unwrap();
        assert!(a.matches(&b));
        assert!(!a.matches(&c));
    }
}
