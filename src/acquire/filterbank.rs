//! Step a single tone across one filter bank channel to map the channel response.

use crate::measurement::{Node, State};
use crate::metadata::MetadataBuilder;
use crate::readout::{calculate, Readout};
use crate::storage::DataDirectory;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterbankBinScan {
    /// LO frequency in MHz, for heterodyne readouts.
    pub lo_mhz: Option<f64>,
    /// The channel nearest this baseband frequency is scanned.
    pub baseband_mhz: f64,
    pub dac_attenuation: f64,
    /// Tones per filter bank channel, as a power of two.
    pub tones_per_bin_exponent: u32,
    /// Channels scanned on each side of the center channel.
    pub half_width_in_bins: i64,
    pub stream_length_blocks: usize,
    pub wait: Duration,
    pub data_dir: PathBuf,
    pub cryostat: String,
}

/// Tone bins and buffer length of a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPlan {
    pub filterbank_bin: i64,
    pub num_tone_samples: u64,
    pub tone_bins: Vec<i64>,
}

impl FilterbankBinScan {
    /// Tones at every `1 / 2^exponent` of a channel from `half_width` channels below
    /// the center channel to `half_width` channels above it.
    pub fn plan<R: Readout + ?Sized>(&self, readout: &R) -> Result<ScanPlan> {
        let state = readout.roach_state();
        let channel_width_mhz = calculate::stream_sample_rate(&state) * 1e-6;
        let filterbank_bin = (self.baseband_mhz / channel_width_mhz).round() as i64;
        let tones_per_bin = 1i64 << self.tones_per_bin_exponent;
        let num_tone_samples = state.num_filterbank_channels << self.tones_per_bin_exponent;
        let center = tones_per_bin * filterbank_bin;
        let half_width = self.half_width_in_bins * tones_per_bin;
        let tone_bins: Vec<i64> = (center - half_width..=center + half_width).collect();
        if tone_bins.first().is_some_and(|&b| b < 0) || tone_bins.last().is_some_and(|&b| b >= num_tone_samples as i64) {
            bail!(
                "Scanning {} channels around channel {} leaves the tone buffer",
                self.half_width_in_bins,
                filterbank_bin
            );
        }
        Ok(ScanPlan {
            filterbank_bin,
            num_tone_samples,
            tone_bins,
        })
    }

    /// Run the scan into a new directory. The directory is closed even when the scan
    /// fails partway.
    pub async fn run<R: Readout + ?Sized>(&self, readout: &mut R, state: &State) -> Result<PathBuf> {
        if let Some(lo) = self.lo_mhz {
            readout.set_lo(lo).await?;
        }
        let plan = self.plan(readout)?;
        let metadata = MetadataBuilder::new()
            .procedure("filterbank_bin")
            .cryostat(&self.cryostat)
            .parameter("baseband_mhz", serde_json::json!(self.baseband_mhz))
            .parameter("filterbank_bin", serde_json::json!(plan.filterbank_bin))
            .parameter("num_tone_samples", serde_json::json!(plan.num_tone_samples))
            .parameter("dac_attenuation", serde_json::json!(self.dac_attenuation))
            .build();
        let mut directory = DataDirectory::create(&self.data_dir, "filterbank_bin", metadata)?;
        let result = self.scan(readout, &plan, state, &mut directory).await;
        let path = directory.close()?;
        result?;
        info!(path = %path.display(), tones = plan.tone_bins.len(), "filter bank scan written");
        Ok(path)
    }

    async fn scan<R: Readout + ?Sized>(
        &self,
        readout: &mut R,
        plan: &ScanPlan,
        state: &State,
        directory: &mut DataDirectory,
    ) -> Result<()> {
        readout.set_dac_attenuation(self.dac_attenuation).await?;
        let center = plan.tone_bins[plan.tone_bins.len() / 2];
        self.tune(readout, center, plan.num_tone_samples).await?;
        let gain = readout.optimize_fft_gain().await?;
        info!(gain, "FFT gain set for the scan");
        for &bin in &plan.tone_bins {
            self.tune(readout, bin, plan.num_tone_samples).await?;
            let stream = readout
                .get_measurement_blocks(self.stream_length_blocks, false)
                .await?
                .with_state(state.clone());
            let fb_bin = stream.filterbank_bin.first().copied();
            if fb_bin != Some(plan.filterbank_bin) {
                warn!(tone_bin = bin, ?fb_bin, "tone left the scanned channel");
            }
            directory.write(&Node::from(stream))?;
            let snap = readout.get_adc_measurement().await?;
            directory.write(&Node::from(snap))?;
        }
        Ok(())
    }

    async fn tune<R: Readout + ?Sized>(&self, readout: &mut R, bin: i64, num_tone_samples: u64) -> Result<()> {
        readout.set_tone_bins(&[vec![bin]], num_tone_samples).await?;
        readout.select_fft_bins(&[0]).await?;
        tokio::time::sleep(self.wait).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadoutConfig;
    use crate::readout::SimulatedReadout;
    use crate::storage::StoredDirectory;

    fn scan(data_dir: PathBuf) -> FilterbankBinScan {
        FilterbankBinScan {
            lo_mhz: None,
            baseband_mhz: 100.0,
            dac_attenuation: 10.0,
            tones_per_bin_exponent: 2,
            half_width_in_bins: 1,
            stream_length_blocks: 1,
            wait: Duration::from_secs(5),
            data_dir,
            cryostat: "test".to_string(),
        }
    }

    #[test]
    fn test_plan() {
        let readout = SimulatedReadout::new(&ReadoutConfig::default());
        let plan = scan(PathBuf::from("unused")).plan(&readout).unwrap();
        // Baseband channels are 512 MHz / 32768 wide.
        assert_eq!(plan.filterbank_bin, 6400);
        assert_eq!(plan.num_tone_samples, 16384 * 4);
        assert_eq!(plan.tone_bins.len(), 9);
        assert_eq!(plan.tone_bins[4], 25600);
        assert_eq!(plan.tone_bins[0], 25596);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_writes_stream_and_snapshot_per_tone() {
        let base = tempfile::tempdir().unwrap();
        let mut readout = SimulatedReadout::new(&ReadoutConfig::default());
        let path = scan(base.path().to_path_buf())
            .run(&mut readout, &State::new())
            .await
            .unwrap();
        assert!(path.to_str().unwrap().ends_with("_filterbank_bin"));
        let stored = StoredDirectory::open(&path).unwrap();
        assert_eq!(stored.node_names().len(), 18);
        assert_eq!(stored.node_names()[0], "0000_stream_array.json");
        assert_eq!(stored.node_names()[1], "0001_adc_snap.json");
        let nodes = stored.read_all().unwrap();
        let Node::StreamArray(first) = &nodes[0] else {
            panic!("expected a stream array");
        };
        assert!(!first.data_demodulated);
        assert_eq!(first.tone_bin, vec![25596]);
        assert!(stored.metadata().unwrap().finished.is_some());
    }

    #[tokio::test]
    async fn test_scan_outside_buffer_is_rejected() {
        let base = tempfile::tempdir().unwrap();
        let mut readout = SimulatedReadout::new(&ReadoutConfig::default());
        let mut procedure = scan(base.path().to_path_buf());
        procedure.baseband_mhz = 0.0;
        assert!(procedure.run(&mut readout, &State::new()).await.is_err());
    }
}
