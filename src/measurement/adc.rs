//! Raw ADC captures, kept alongside streams for diagnosing the analog chain.

use super::record::{Origin, Record};
use super::state::State;
use super::analysis_epoch;
use crate::error::{ReadoutError, ReadoutResult};
use crate::readout::state::RoachState;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Simultaneous samples of the I (`x`) and Q (`y`) ADC inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdcSnap {
    pub epoch: f64,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub roach_state: RoachState,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub description: String,
    #[serde(skip)]
    pub origin: Option<Origin>,
}

impl AdcSnap {
    pub fn new(epoch: f64, x: Vec<f64>, y: Vec<f64>, roach_state: RoachState) -> ReadoutResult<Self> {
        let snap = Self {
            epoch,
            x,
            y,
            roach_state,
            state: State::new(),
            description: String::new(),
            origin: None,
        };
        snap.validate()?;
        Ok(snap)
    }

    pub fn validate(&self) -> ReadoutResult<()> {
        if self.x.len() != self.y.len() {
            return Err(ReadoutError::Shape(format!(
                "ADC snapshot has {} x samples and {} y samples",
                self.x.len(),
                self.y.len()
            )));
        }
        Ok(())
    }

    pub fn samples(&self) -> Vec<Complex64> {
        self.x.iter().zip(&self.y).map(|(&x, &y)| Complex64::new(x, y)).collect()
    }

    /// Root-mean-square level of each input, used to spot clipping or a dead channel.
    pub fn rms(&self) -> (f64, f64) {
        let rms = |v: &[f64]| {
            if v.is_empty() {
                return f64::NAN;
            }
            (v.iter().map(|s| s * s).sum::<f64>() / v.len() as f64).sqrt()
        };
        (rms(&self.x), rms(&self.y))
    }

    pub fn to_record(&self) -> Record {
        let (x_rms, y_rms) = self.rms();
        let mut record = Record::new();
        record.insert("analysis_epoch", analysis_epoch());
        record.insert("start_epoch", self.epoch);
        record.extend_prefixed("roach", self.roach_state.items());
        record.extend(self.state.flatten(""));
        record.insert("adc_x_rms", x_rms);
        record.insert("adc_y_rms", y_rms);
        record.add_origin(self.origin.as_ref());
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_and_samples() {
        let snap = AdcSnap::new(0.0, vec![1.0, -1.0], vec![2.0, 2.0], RoachState::default()).unwrap();
        assert_eq!(snap.rms(), (1.0, 2.0));
        assert_eq!(snap.samples()[1], Complex64::new(-1.0, 2.0));
        assert!(AdcSnap::new(0.0, vec![1.0], vec![], RoachState::default()).is_err());
    }
}
