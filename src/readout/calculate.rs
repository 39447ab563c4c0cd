//! Frequencies and rates derived from a [`RoachState`].
//!
//! In heterodyne mode the tone buffer is complex and spans `[-fs/2, fs/2)`, so bins in
//! the upper half wrap to negative baseband frequencies. In baseband mode the buffer is
//! real, its `N` samples play at twice the ADC rate, and bin `k` sits at `fs k / (2N)`.

use super::state::{RoachState, MODULATION_SQUARE_WAVE};
use crate::error::{ReadoutError, ReadoutResult};

pub fn baseband_frequency(state: &RoachState, tone_bin: i64) -> f64 {
    let n = state.num_tone_samples as i64;
    if state.heterodyne {
        let bin = if tone_bin >= n / 2 { tone_bin - n } else { tone_bin };
        state.adc_sample_rate * bin as f64 / n as f64
    } else {
        state.adc_sample_rate * tone_bin as f64 / (2 * n) as f64
    }
}

/// RF frequency of a tone: baseband plus LO when heterodyne.
pub fn frequency(state: &RoachState, tone_bin: i64) -> f64 {
    let baseband = baseband_frequency(state, tone_bin);
    if state.heterodyne {
        state.lo_frequency + baseband
    } else {
        baseband
    }
}

/// Sample rate of one demodulated channel, in Hz.
pub fn stream_sample_rate(state: &RoachState) -> f64 {
    let channels = state.num_filterbank_channels as f64;
    if state.heterodyne {
        state.adc_sample_rate / channels
    } else {
        state.adc_sample_rate / (2.0 * channels)
    }
}

/// The filter bank channel whose center lies nearest the tone.
pub fn filterbank_bin(state: &RoachState, tone_bin: i64) -> i64 {
    let ratio = state.num_filterbank_channels as f64 / state.num_tone_samples as f64;
    let channel = (tone_bin as f64 * ratio).round() as i64;
    if state.heterodyne {
        channel.rem_euclid(state.num_filterbank_channels as i64)
    } else {
        channel
    }
}

/// Offset of a tone from the center of its filter bank channel, in channel widths.
pub fn tone_offset_frequency(tone_bin: i64, num_tone_samples: u64, filterbank_bin: i64, num_filterbank_channels: u64) -> f64 {
    num_filterbank_channels as f64 * tone_bin as f64 / num_tone_samples as f64 - filterbank_bin as f64
}

/// Samples per modulation period, defined only for the square-wave output.
pub fn modulation_period_samples(state: &RoachState) -> ReadoutResult<usize> {
    if state.modulation_output != MODULATION_SQUARE_WAVE {
        return Err(ReadoutError::InvalidArgument(format!(
            "modulation output {} is not the square wave; there is no modulation period",
            state.modulation_output
        )));
    }
    Ok(1usize << (state.modulation_rate + 1))
}

/// Tone bin nearest to `frequency` (Hz) for a buffer of `num_tone_samples`.
pub fn tone_bin(state: &RoachState, frequency: f64, num_tone_samples: u64) -> i64 {
    let n = num_tone_samples as f64;
    if state.heterodyne {
        let bin = ((frequency - state.lo_frequency) * n / state.adc_sample_rate).round() as i64;
        bin.rem_euclid(num_tone_samples as i64)
    } else {
        (frequency * 2.0 * n / state.adc_sample_rate).round() as i64
    }
}
