//! Snapshot of the digitizer configuration stored with every measurement.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Modulation output code that selects the square wave.
pub const MODULATION_SQUARE_WAVE: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoachState {
    /// True when an IF board mixes the tones up to the LO frequency.
    pub heterodyne: bool,
    /// ADC sample rate in Hz.
    pub adc_sample_rate: f64,
    /// LO frequency in Hz; zero in baseband mode.
    pub lo_frequency: f64,
    pub num_tone_samples: u64,
    pub num_filterbank_channels: u64,
    pub dac_attenuation: f64,
    pub fft_gain: u32,
    pub modulation_rate: u32,
    /// 0 low, 1 high, 2 square wave.
    pub modulation_output: u32,
    pub bank: u32,
    pub num_tones: u32,
}

impl Default for RoachState {
    fn default() -> Self {
        Self {
            heterodyne: false,
            adc_sample_rate: 512e6,
            lo_frequency: 0.0,
            num_tone_samples: 1 << 16,
            num_filterbank_channels: 16384,
            dac_attenuation: 0.0,
            fft_gain: 0,
            modulation_rate: 0,
            modulation_output: 0,
            bank: 0,
            num_tones: 0,
        }
    }
}

impl RoachState {
    /// Field name / value pairs, for flat records.
    pub fn items(&self) -> BTreeMap<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_items_include_every_field() {
        let items = RoachState::default().items();
        assert_eq!(items.len(), 11);
        assert_eq!(items["num_tone_samples"], Value::from(65536u64));
    }

    #[test]
    fn test_json_round_trip() {
        let state = RoachState {
            heterodyne: true,
            lo_frequency: 3e9,
            ..RoachState::default()
        };
        let json = serde_json::to_string(&state).unwrap();
        let back: RoachState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }
}
