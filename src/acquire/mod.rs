//! Acquisition procedures and the frequency bookkeeping they share.
//!
//! Frequencies handed to the readout are in MHz, matching
//! [`Readout::set_tone_frequencies`]. A tone bank is one set of simultaneous tones;
//! a sweep steps through banks that are the resonance list shifted by each offset.

pub mod filterbank;
pub mod heater;

pub use filterbank::FilterbankBinScan;
pub use heater::HeaterSweepAndStream;

use crate::config::Settings;
use crate::error::{ReadoutError, ReadoutResult};
use crate::measurement::{State, SweepArray};
use crate::readout::Readout;
use anyhow::{bail, Result};
use tracing::{info, warn};

/// Offsets from `start` up to but excluding `stop` in steps of `spacing`.
pub fn sweep_offsets(start: f64, stop: f64, spacing: f64) -> ReadoutResult<Vec<f64>> {
    if !spacing.is_finite() || spacing <= 0.0 {
        return Err(ReadoutError::InvalidArgument(format!(
            "sweep spacing must be positive, got {}",
            spacing
        )));
    }
    // The tolerance keeps `stop` itself out when the ratio rounds up.
    let count = ((stop - start) / spacing - 1e-9).ceil().max(0.0) as usize;
    Ok((0..count).map(|i| start + spacing * i as f64).collect())
}

/// One bank per offset, each holding every resonance shifted by that offset.
pub fn tone_banks(f0s: &[f64], offsets: &[f64]) -> Vec<Vec<f64>> {
    offsets
        .iter()
        .map(|offset| f0s.iter().map(|f0| f0 + offset).collect())
        .collect()
}

/// Pad `f0s` with dummy tones at 1 MHz steps above the highest resonance until the
/// count is a multiple of `n`.
pub fn extend_to_multiple(f0s: &[f64], n: usize) -> Vec<f64> {
    let mut extended = f0s.to_vec();
    if n == 0 || f0s.is_empty() || f0s.len() % n == 0 {
        return extended;
    }
    let max = f0s.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let missing = n - f0s.len() % n;
    info!(from = f0s.len(), to = f0s.len() + missing, "extending resonance list");
    extended.extend((1..=missing).map(|k| max + k as f64));
    extended
}

/// Sweep every bank once and collect the streams into a [`SweepArray`].
///
/// All banks must have the same number of tones; tone `k` of each bank becomes
/// channel `k` of the sweep.
pub async fn run_sweep<R: Readout + ?Sized>(
    readout: &mut R,
    banks: &[Vec<f64>],
    num_tone_samples: u64,
    length_seconds: f64,
    state: &State,
    description: &str,
) -> Result<SweepArray> {
    let Some(first) = banks.first() else {
        bail!("A sweep needs at least one tone bank");
    };
    if banks.iter().any(|bank| bank.len() != first.len()) {
        bail!("Every tone bank in a sweep must have the same number of tones");
    }
    readout.set_tone_frequencies(banks, num_tone_samples).await?;
    let channels: Vec<usize> = (0..first.len()).collect();
    let mut stream_arrays = Vec::with_capacity(banks.len());
    for bank in 0..banks.len() {
        readout.select_bank(bank).await?;
        readout.select_fft_bins(&channels).await?;
        let stream = readout.get_measurement(length_seconds).await?;
        stream_arrays.push(stream.with_state(state.clone()));
    }
    info!(banks = banks.len(), tones = first.len(), "sweep complete");
    Ok(SweepArray::new(stream_arrays, state.clone(), description))
}

/// Accept each fitted frequency unless it moved more than `max_shift` from the
/// previous one or the fit failed (NaN), in which case the previous value is kept.
pub fn update_resonance_frequencies(previous: &[f64], fitted: &[f64], max_shift: f64) -> Vec<f64> {
    previous
        .iter()
        .zip(fitted)
        .map(|(&old, &new)| {
            if new.is_finite() && (new - old).abs() <= max_shift {
                new
            } else {
                warn!(previous = old, fitted = new, "keeping previous resonance frequency");
                old
            }
        })
        .collect()
}

// A tone placed exactly `min_spacing` above its neighbour must not count as colliding.
fn too_close(lower: f64, upper: f64, min_spacing: f64) -> bool {
    upper - lower < min_spacing * (1.0 - 1e-9)
}

fn collision_pass(frequencies: &mut [f64], min_spacing: f64) -> bool {
    let problems: Vec<usize> = frequencies
        .windows(2)
        .enumerate()
        .filter(|(_, w)| too_close(w[0], w[1], min_spacing))
        .map(|(i, _)| i + 1)
        .collect();
    if problems.is_empty() {
        return false;
    }
    warn!(?problems, "resonator collision");
    let snapshot = frequencies.to_vec();
    for &p in &problems {
        frequencies[p] = match snapshot.get(p + 1) {
            Some(next) => (snapshot[p - 1] + next) / 2.0,
            None => snapshot[p - 1] + min_spacing,
        };
    }
    true
}

/// Sort the frequencies and move every tone that sits closer than `min_spacing` above
/// its lower neighbour. Each colliding tone is replaced by the midpoint of its neighbours;
/// the last tone, which has no upper neighbour, goes to `min_spacing` above the
/// previous one. Two passes are made.
pub fn resolve_collisions(frequencies: &[f64], min_spacing: f64) -> Vec<f64> {
    let mut sorted = frequencies.to_vec();
    sorted.sort_by(f64::total_cmp);
    if collision_pass(&mut sorted, min_spacing) {
        collision_pass(&mut sorted, min_spacing);
        if sorted.windows(2).any(|w| too_close(w[0], w[1], min_spacing)) {
            warn!("resonator collisions remain after two passes");
        }
    }
    sorted
}

/// Log the settings in force and the software version at the start of a procedure.
pub fn log_settings(settings: &Settings) {
    info!(version = env!("CARGO_PKG_VERSION"), "kid_readout");
    match serde_json::to_string(settings) {
        Ok(json) => info!(settings = %json, "settings"),
        Err(e) => warn!(error = %e, "settings could not be serialized"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadoutConfig;
    use crate::readout::SimulatedReadout;
    use tracing_test::traced_test;

    #[test]
    fn test_sweep_offsets() {
        let offsets = sweep_offsets(-2.0, 2.0, 1.0).unwrap();
        assert_eq!(offsets, vec![-2.0, -1.0, 0.0, 1.0]);
        assert!(sweep_offsets(0.0, 1.0, 0.0).is_err());
        assert!(sweep_offsets(1.0, 0.0, 0.5).unwrap().is_empty());
    }

    #[test]
    fn test_tone_banks_are_offset_major() {
        let banks = tone_banks(&[100.0, 200.0], &[-0.5, 0.5]);
        assert_eq!(banks, vec![vec![99.5, 199.5], vec![100.5, 200.5]]);
    }

    #[test]
    fn test_extend_to_multiple() {
        assert_eq!(extend_to_multiple(&[10.0, 12.0, 11.0], 4), vec![10.0, 12.0, 11.0, 13.0]);
        assert_eq!(extend_to_multiple(&[10.0, 12.0], 2), vec![10.0, 12.0]);
        assert_eq!(extend_to_multiple(&[5.0], 3), vec![5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_update_keeps_large_shifts_and_failed_fits() {
        let updated = update_resonance_frequencies(&[100e6, 200e6, 300e6], &[100.1e6, 200.3e6, f64::NAN], 200e3);
        assert_eq!(updated, vec![100.1e6, 200e6, 300e6]);
    }

    #[test]
    #[traced_test]
    fn test_collisions_are_logged() {
        resolve_collisions(&[200.0, 200.001], 0.031);
        assert!(logs_contain("resonator collision"));
        assert!(!logs_contain("collisions remain"));
    }

    #[test]
    fn test_resolve_collisions() {
        let repaired = resolve_collisions(&[100.0, 100.01, 100.2, 100.3], 0.031);
        assert_eq!(repaired[0], 100.0);
        assert!((repaired[1] - 100.1).abs() < 1e-9);

        let last = resolve_collisions(&[101.0, 100.0, 101.01], 0.031);
        assert_eq!(last[0], 100.0);
        assert!((last[2] - 101.031).abs() < 1e-9);

        let clean = vec![1.0, 2.0, 3.0];
        assert_eq!(resolve_collisions(&clean, 0.031), clean);
    }

    #[tokio::test]
    async fn test_run_sweep_shapes() {
        let mut readout = SimulatedReadout::new(&ReadoutConfig::default());
        let offsets = sweep_offsets(-0.02, 0.02, 0.01).unwrap();
        let banks = tone_banks(&[100.0, 110.0], &offsets);
        let state = State::new().with("heater_voltage", 0.0);
        let sweep = run_sweep(&mut readout, &banks, 1 << 16, 0.0, &state, "test sweep")
            .await
            .unwrap();
        assert_eq!(sweep.stream_arrays.len(), 4);
        assert_eq!(sweep.num_channels().unwrap(), 2);
        assert_eq!(sweep.description, "test sweep");
        let frequencies = sweep.sweep(1).unwrap().frequency();
        assert_eq!(frequencies.len(), 4);
        assert!((frequencies[0] - 109.98e6).abs() < 4e3);
        assert!(sweep.stream_arrays[0].state.get("heater_voltage").is_some());

        let ragged = vec![vec![100.0], vec![100.0, 101.0]];
        assert!(run_sweep(&mut readout, &ragged, 1 << 16, 0.0, &state, "").await.is_err());
    }
}
