//! Sweep and stream a set of resonators at a series of heater voltages.

use super::{extend_to_multiple, resolve_collisions, run_sweep, tone_banks, update_resonance_frequencies};
use crate::instrument::agilent_33220::DcSource;
use crate::measurement::{Node, State, SweepStreamArray};
use crate::metadata::MetadataBuilder;
use crate::readout::Readout;
use crate::storage::DataDirectory;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Attenuation left on the DAC when the procedure ends.
pub const FINAL_DAC_ATTENUATION: f64 = 20.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaterSweepAndStream {
    /// Resonance frequencies to sweep around, in MHz.
    pub initial_f0s_mhz: Vec<f64>,
    /// The resonance list is padded to a multiple of this many tones.
    pub tones_at_once: usize,
    /// LO frequency in MHz, for heterodyne readouts.
    pub lo_mhz: Option<f64>,
    pub fft_gain: u32,
    pub num_tone_samples: u64,
    /// Sweep offsets from each resonance, in MHz.
    pub offsets_mhz: Vec<f64>,
    pub heater_voltages: Vec<f64>,
    pub dac_attenuations: Vec<f64>,
    /// Wait after changing to a nonzero heater voltage.
    pub settle: Duration,
    pub stream_seconds: f64,
    pub max_f0_shift_hz: f64,
    pub min_tone_spacing_mhz: f64,
    pub data_dir: PathBuf,
    pub cryostat: String,
}

impl HeaterSweepAndStream {
    /// Run every voltage and attenuation, writing one directory per pair. The heater
    /// is returned to 0 V and the DAC to [`FINAL_DAC_ATTENUATION`] whether or not the
    /// run succeeds.
    pub async fn run<R, S>(&self, readout: &mut R, source: &mut S, state: &State) -> Result<Vec<PathBuf>>
    where
        R: Readout + ?Sized,
        S: DcSource + ?Sized,
    {
        let result = self.run_voltages(readout, source, state).await;
        if let Err(e) = source.set_dc_voltage(0.0).await {
            warn!(error = %e, "failed to return heater to 0 V");
        }
        if let Err(e) = readout.set_dac_attenuation(FINAL_DAC_ATTENUATION).await {
            warn!(error = %e, "failed to restore DAC attenuation");
        }
        result
    }

    async fn run_voltages<R, S>(&self, readout: &mut R, source: &mut S, state: &State) -> Result<Vec<PathBuf>>
    where
        R: Readout + ?Sized,
        S: DcSource + ?Sized,
    {
        if self.initial_f0s_mhz.is_empty() {
            bail!("No resonance frequencies given");
        }
        let mut f0s = self.initial_f0s_mhz.clone();
        f0s.sort_by(f64::total_cmp);
        let f0s = extend_to_multiple(&f0s, self.tones_at_once);

        source.set_dc_voltage(0.0).await?;
        source.enable_output(false).await?;
        readout.set_fft_gain(self.fft_gain).await?;

        let mut written = Vec::new();
        for &voltage in &self.heater_voltages {
            source.set_dc_voltage(voltage).await?;
            if voltage == 0.0 {
                info!("heater voltage is 0 V, skipping wait");
            } else {
                info!(voltage, settle_seconds = self.settle.as_secs_f64(), "waiting for heater to settle");
                tokio::time::sleep(self.settle).await;
            }
            source.enable_output(true).await?;

            if let Some(lo) = self.lo_mhz {
                readout.set_lo(lo).await?;
            }
            for &attenuation in &self.dac_attenuations {
                let path = self
                    .sweep_and_stream(readout, &f0s, voltage, attenuation, state)
                    .await
                    .with_context(|| format!("Failed at {} dB, {} V", attenuation, voltage))?;
                written.push(path);
            }
        }
        Ok(written)
    }

    async fn sweep_and_stream<R: Readout + ?Sized>(
        &self,
        readout: &mut R,
        f0s: &[f64],
        voltage: f64,
        attenuation: f64,
        state: &State,
    ) -> Result<PathBuf> {
        readout.set_dac_attenuation(attenuation).await?;
        let state = state.clone().with("heater_voltage", voltage);
        let metadata = MetadataBuilder::new()
            .procedure("heater_sweep_and_stream")
            .cryostat(&self.cryostat)
            .parameter("heater_voltage", serde_json::json!(voltage))
            .parameter("dac_attenuation", serde_json::json!(attenuation))
            .parameter("num_tone_samples", serde_json::json!(self.num_tone_samples))
            .build();
        let suffix = format!("{:.0}_dB_{:.3}_V", attenuation, voltage);
        let mut directory = DataDirectory::create(&self.data_dir, &suffix, metadata)?;
        let result = self.measure(readout, f0s, state, &mut directory).await;
        let path = directory.close()?;
        result?;
        info!(path = %path.display(), attenuation, voltage, "sweep and stream written");
        Ok(path)
    }

    async fn measure<R: Readout + ?Sized>(
        &self,
        readout: &mut R,
        f0s: &[f64],
        state: State,
        directory: &mut DataDirectory,
    ) -> Result<()> {
        let banks = tone_banks(f0s, &self.offsets_mhz);
        let sweep_array = run_sweep(readout, &banks, self.num_tone_samples, 0.0, &state, "dark sweep").await?;

        let mut fitted = Vec::with_capacity(f0s.len());
        for k in 0..f0s.len() {
            let mut sweep = sweep_array.sweep(k)?;
            match sweep.resonator() {
                Ok(resonator) => {
                    info!(
                        channel = k,
                        f_0 = resonator.f_0(),
                        q = resonator.q(),
                        redchi = resonator.redchi(),
                        shift = f0s[k] * 1e6 - resonator.f_0(),
                        "resonator fit"
                    );
                    fitted.push(resonator.f_0());
                }
                Err(e) => {
                    warn!(channel = k, error = %e, "resonator fit failed");
                    fitted.push(f64::NAN);
                }
            }
        }
        let previous: Vec<f64> = f0s.iter().map(|f| f * 1e6).collect();
        let current: Vec<f64> = update_resonance_frequencies(&previous, &fitted, self.max_f0_shift_hz)
            .into_iter()
            .map(|f| f * 1e-6)
            .collect();
        let current = resolve_collisions(&current, self.min_tone_spacing_mhz);

        readout.set_tone_frequencies(&[current], self.num_tone_samples).await?;
        let channels: Vec<usize> = (0..f0s.len()).collect();
        readout.select_fft_bins(&channels).await?;
        let stream = readout
            .get_measurement(self.stream_seconds)
            .await?
            .with_state(state.clone())
            .with_description("source off stream");

        let sweep_stream = SweepStreamArray::new(sweep_array, stream, state, "heater sweep and stream")?;
        directory.write(&Node::from(sweep_stream))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::sweep_offsets;
    use crate::config::ReadoutConfig;
    use crate::readout::SimulatedReadout;
    use crate::storage::StoredDirectory;
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingSource {
        log: Vec<String>,
    }

    #[async_trait]
    impl DcSource for RecordingSource {
        async fn set_dc_voltage(&mut self, volts: f64) -> Result<()> {
            self.log.push(format!("V {}", volts));
            Ok(())
        }

        async fn enable_output(&mut self, enabled: bool) -> Result<()> {
            self.log.push(format!("output {}", enabled));
            Ok(())
        }
    }

    fn procedure(data_dir: PathBuf) -> HeaterSweepAndStream {
        HeaterSweepAndStream {
            initial_f0s_mhz: vec![110.0, 100.0, 120.0],
            tones_at_once: 4,
            lo_mhz: None,
            fft_gain: 6,
            num_tone_samples: 1 << 16,
            offsets_mhz: sweep_offsets(-0.1, 0.1, 512.0 / (1 << 17) as f64).unwrap(),
            heater_voltages: vec![0.0, 0.5],
            dac_attenuations: vec![10.0],
            settle: Duration::from_secs(60),
            stream_seconds: 0.0,
            max_f0_shift_hz: 200e3,
            min_tone_spacing_mhz: 0.031,
            data_dir,
            cryostat: "test".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heater_sweep_and_stream() {
        let base = tempfile::tempdir().unwrap();
        let mut readout = SimulatedReadout::new(&ReadoutConfig::default());
        let mut source = RecordingSource::default();
        let procedure = procedure(base.path().to_path_buf());
        let paths = procedure.run(&mut readout, &mut source, &State::new()).await.unwrap();

        assert_eq!(paths.len(), 2);
        assert!(paths[0].to_str().unwrap().ends_with("10_dB_0.000_V"));
        assert!(paths[1].to_str().unwrap().ends_with("10_dB_0.500_V"));
        assert_eq!(
            source.log,
            vec!["V 0", "output false", "V 0", "output true", "V 0.5", "output true", "V 0"]
        );
        assert_eq!(readout.roach_state().dac_attenuation, FINAL_DAC_ATTENUATION);

        let stored = StoredDirectory::open(&paths[1]).unwrap();
        assert_eq!(stored.metadata().unwrap().parameters["heater_voltage"], 0.5);
        let nodes = stored.read_all().unwrap();
        let Node::SweepStreamArray(array) = &nodes[0] else {
            panic!("expected a sweep stream array, got {}", nodes[0].kind());
        };
        // Three resonances padded with one dummy tone.
        assert_eq!(array.num_channels().unwrap(), 4);
        assert_eq!(array.stream_array.description, "source off stream");
        assert_eq!(array.state.get("heater_voltage"), Some(&serde_json::json!(0.5)));
        let streamed = array.stream_array.stream(0).unwrap().frequency();
        assert!((streamed - 100e6).abs() < 10e3, "tracked {}", streamed);
    }

    #[tokio::test]
    async fn test_failure_still_restores_hardware() {
        let base = tempfile::tempdir().unwrap();
        let mut readout = SimulatedReadout::new(&ReadoutConfig::default());
        let mut source = RecordingSource::default();
        let mut procedure = procedure(base.path().to_path_buf());
        procedure.heater_voltages = vec![0.0];
        procedure.dac_attenuations = vec![100.0];
        assert!(procedure.run(&mut readout, &mut source, &State::new()).await.is_err());
        assert_eq!(source.log.last().map(String::as_str), Some("V 0"));
        assert_eq!(readout.roach_state().dac_attenuation, FINAL_DAC_ATTENUATION);
    }

    #[tokio::test]
    async fn test_failed_measurement_still_writes_manifest() {
        let base = tempfile::tempdir().unwrap();
        let mut readout = SimulatedReadout::new(&ReadoutConfig::default());
        let mut source = RecordingSource::default();
        let mut procedure = procedure(base.path().to_path_buf());
        procedure.heater_voltages = vec![0.0];
        procedure.stream_seconds = -1.0;
        assert!(procedure.run(&mut readout, &mut source, &State::new()).await.is_err());

        let dirs: Vec<PathBuf> = std::fs::read_dir(base.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(dirs.len(), 1);
        let stored = StoredDirectory::open(&dirs[0]).unwrap();
        let metadata = stored.metadata().unwrap();
        assert!(metadata.finished.is_some());
        assert_eq!(metadata.parameters["dac_attenuation"], 10.0);
        assert!(stored.read_all().unwrap().is_empty());
    }
}
