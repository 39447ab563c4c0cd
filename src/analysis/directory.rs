//! Noise analysis of every sweep-and-stream measurement in a data directory.

use super::noise_measurement::{NoiseMeasurementOptions, NoiseSummary, SweepNoiseMeasurement};
use crate::config::Settings;
use crate::error::ReadoutResult;
use crate::measurement::{DeglitchOptions, Node, NoiseSpectrumOptions, Record, RecordTable, SweepStreamArray};
use crate::storage::{StoredDirectory, TemperatureLog};
use serde_json::Value;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct DirectoryAnalysis {
    pub summaries: Vec<NoiseSummary>,
    /// One row per channel with the resonator fit and the deglitched x/q spectra.
    pub records: RecordTable,
}

impl DirectoryAnalysis {
    /// The summaries as flat rows, ready for CSV export.
    pub fn summary_table(&self) -> RecordTable {
        self.summaries
            .iter()
            .map(|summary| match serde_json::to_value(summary) {
                Ok(Value::Object(map)) => Record(map.into_iter().collect()),
                _ => Record::new(),
            })
            .collect()
    }
}

pub fn noise_options(settings: &Settings) -> NoiseMeasurementOptions {
    NoiseMeasurementOptions {
        low_pass_cutoff: settings.analysis.low_pass_cutoff_hz,
        dac_chain_gain: settings.cryostat.dac_chain_gain_db,
        ..NoiseMeasurementOptions::default()
    }
}

/// Analyze every [`SweepStreamArray`] channel in the directory at `path`. A channel
/// whose analysis fails is logged and skipped.
pub fn analyze_directory(
    path: impl AsRef<Path>,
    settings: &Settings,
    temperatures: Option<&TemperatureLog>,
) -> ReadoutResult<DirectoryAnalysis> {
    let stored = StoredDirectory::open(path)?;
    let mut analysis = DirectoryAnalysis::default();
    for node in stored.read_all()? {
        if let Node::SweepStreamArray(array) = node {
            analyze_array(&array, settings, temperatures, &mut analysis)?;
        }
    }
    info!(
        path = %stored.path.display(),
        channels = analysis.summaries.len(),
        "directory analyzed"
    );
    Ok(analysis)
}

fn analyze_array(
    array: &SweepStreamArray,
    settings: &Settings,
    temperatures: Option<&TemperatureLog>,
    analysis: &mut DirectoryAnalysis,
) -> ReadoutResult<()> {
    let deglitch = DeglitchOptions {
        threshold: settings.analysis.deglitch_threshold,
        window_seconds: settings.analysis.deglitch_window_seconds,
        mask_extend_samples: settings.analysis.mask_extend_samples,
    };
    let spectrum = NoiseSpectrumOptions {
        bins_per_decade: settings.analysis.bins_per_decade,
        ..NoiseSpectrumOptions::default()
    };
    for k in 0..array.num_channels()? {
        let sweep = array.sweep_array.sweep(k)?;
        let stream = array.stream_array.stream(k)?;
        let measurement = match SweepNoiseMeasurement::new(&sweep, &stream, noise_options(settings)) {
            Ok(m) => m,
            Err(e) => {
                warn!(channel = k, error = %e, "noise measurement failed");
                continue;
            }
        };
        let measurement = match temperatures {
            Some(log) => {
                let summary = measurement.summary();
                measurement.with_temperatures(
                    log.temperatures_at(summary.sweep_epoch),
                    log.temperatures_at(summary.stream_epoch),
                )
            }
            None => measurement,
        };
        analysis.summaries.push(measurement.summary());

        match sweep_stream_record(array, k, &deglitch, &spectrum) {
            Ok(record) => analysis.records.push(record),
            Err(e) => warn!(channel = k, error = %e, "sweep stream record failed"),
        }
    }
    Ok(())
}

fn sweep_stream_record(
    array: &SweepStreamArray,
    channel: usize,
    deglitch: &DeglitchOptions,
    spectrum: &NoiseSpectrumOptions,
) -> ReadoutResult<Record> {
    let mut sweep_stream = array.sweep_stream(channel)?;
    sweep_stream.deglitch(deglitch)?;
    sweep_stream.set_s(spectrum)?;
    sweep_stream.to_record()
}
