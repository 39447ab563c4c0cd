//! The measurement data model.
//!
//! Measurements nest the way they are taken. A [`StreamArray`] holds simultaneous
//! time-ordered data from several tones. A [`SweepArray`] is a list of stream arrays at
//! stepped frequencies. A [`SweepStreamArray`] pairs a sweep with the stream taken
//! afterwards. Each array type can produce a single-channel view (`stream(k)`,
//! `sweep(k)`, `sweep_stream(k)`) that carries the analysis for one resonator.
//!
//! Every node carries a free-form [`State`] and a description, and can be flattened into
//! [`Record`] rows for tabular analysis.

pub mod adc;
pub mod complex_serde;
pub mod record;
pub mod scan;
pub mod state;
pub mod stream;
pub mod sweep;
pub mod sweep_stream;

pub use adc::AdcSnap;
pub use record::{Origin, Record, RecordTable};
pub use scan::{Scan, Stitched};
pub use state::State;
pub use stream::{RoachStream, SingleStream, StreamArray};
pub use sweep::{fit_polynomial_background, PeakSearch, SingleSweep, SweepArray};
pub use sweep_stream::{
    DeglitchOptions, NoiseSpectra, NoiseSpectrumOptions, PcaSpectra, SingleSweepStream, SingleSweepStreamList,
    SweepStreamArray, SweepStreamList,
};

use crate::error::ReadoutResult;
use serde::{Deserialize, Serialize};

/// A top-level measurement as written to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    StreamArray(StreamArray),
    SweepArray(SweepArray),
    SweepStreamArray(SweepStreamArray),
    SweepStreamList(SweepStreamList),
    Scan(Scan),
    AdcSnap(AdcSnap),
}

impl Node {
    pub fn kind(&self) -> &'static str {
        match self {
            Node::StreamArray(_) => "stream_array",
            Node::SweepArray(_) => "sweep_array",
            Node::SweepStreamArray(_) => "sweep_stream_array",
            Node::SweepStreamList(_) => "sweep_stream_list",
            Node::Scan(_) => "scan",
            Node::AdcSnap(_) => "adc_snap",
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Node::StreamArray(n) => &n.description,
            Node::SweepArray(n) => &n.description,
            Node::SweepStreamArray(n) => &n.description,
            Node::SweepStreamList(n) => &n.description,
            Node::Scan(n) => &n.description,
            Node::AdcSnap(n) => &n.description,
        }
    }

    pub fn validate(&self) -> ReadoutResult<()> {
        match self {
            Node::StreamArray(n) => n.validate(),
            Node::SweepArray(n) => n.validate(),
            Node::SweepStreamArray(n) => n.validate(),
            Node::SweepStreamList(n) => n.validate(),
            Node::Scan(n) => n.validate(),
            Node::AdcSnap(n) => n.validate(),
        }
    }

    /// Record where the node was loaded from, on the node and everything it contains.
    pub fn set_origin(&mut self, origin: Origin) {
        match self {
            Node::StreamArray(n) => n.origin = Some(origin),
            Node::SweepArray(n) => set_sweep_origin(n, &origin),
            Node::SweepStreamArray(n) => {
                set_sweep_origin(&mut n.sweep_array, &origin);
                n.stream_array.origin = Some(origin.clone());
                n.origin = Some(origin);
            }
            Node::SweepStreamList(n) => {
                set_sweep_origin(&mut n.sweep, &origin);
                n.stream_list.iter_mut().for_each(|s| s.origin = Some(origin.clone()));
                n.origin = Some(origin);
            }
            Node::Scan(n) => {
                n.sweep_arrays.iter_mut().for_each(|s| set_sweep_origin(s, &origin));
                n.origin = Some(origin);
            }
            Node::AdcSnap(n) => n.origin = Some(origin),
        }
    }

    pub fn origin(&self) -> Option<&Origin> {
        match self {
            Node::StreamArray(n) => n.origin.as_ref(),
            Node::SweepArray(n) => n.origin.as_ref(),
            Node::SweepStreamArray(n) => n.origin.as_ref(),
            Node::SweepStreamList(n) => n.origin.as_ref(),
            Node::Scan(n) => n.origin.as_ref(),
            Node::AdcSnap(n) => n.origin.as_ref(),
        }
    }

    /// Flat rows for the node; nodes without a tabular form give an empty table.
    pub fn to_records(&self) -> ReadoutResult<RecordTable> {
        match self {
            Node::StreamArray(n) => n.to_records(),
            Node::SweepArray(n) => n.to_records(true),
            Node::SweepStreamArray(n) => n.to_records(),
            Node::AdcSnap(n) => Ok(RecordTable::from(vec![n.to_record()])),
            Node::SweepStreamList(_) | Node::Scan(_) => Ok(RecordTable::new()),
        }
    }
}

fn set_sweep_origin(sweep: &mut SweepArray, origin: &Origin) {
    sweep.stream_arrays.iter_mut().for_each(|s| s.origin = Some(origin.clone()));
    sweep.origin = Some(origin.clone());
}

macro_rules! node_from {
    ($($variant:ident),*) => {
        $(impl From<$variant> for Node {
            fn from(value: $variant) -> Self {
                Node::$variant(value)
            }
        })*
    };
}

node_from!(StreamArray, SweepArray, SweepStreamArray, SweepStreamList, Scan, AdcSnap);

/// Seconds since the Unix epoch, stamped on records when they are made.
pub(crate) fn analysis_epoch() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 * 1e-6
}

/// Indices that sort `values` ascending; NaN sorts last.
pub(crate) fn argsort(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    order
}

/// `num` evenly spaced values from `start` to `stop` inclusive.
pub(crate) fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (num - 1) as f64;
            (0..num).map(|i| start + step * i as f64).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readout::state::RoachState;
    use num_complex::Complex64;

    #[test]
    fn test_linspace_and_argsort() {
        assert_eq!(linspace(0.0, 1.0, 5), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(linspace(3.0, 4.0, 1), vec![3.0]);
        assert_eq!(argsort(&[3.0, 1.0, 2.0]), vec![1, 2, 0]);
    }

    #[test]
    fn test_node_json_is_tagged() {
        let sa = StreamArray::new(
            vec![10],
            vec![1.0],
            vec![0.0],
            vec![0],
            vec![2],
            vec![vec![Complex64::new(1.0, 0.0), Complex64::new(f64::NAN, 0.0)]],
            RoachState::default(),
        )
        .unwrap();
        let node = Node::from(sa);
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["kind"], "stream_array");
        let back: Node = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), "stream_array");
        back.validate().unwrap();
    }

    #[test]
    fn test_origin_propagates_to_children() {
        let sweep = SweepArray::new(Vec::new(), State::new(), "empty");
        let mut node = Node::from(sweep);
        node.set_origin(Origin {
            path: "/tmp/x".into(),
            node: "0000_sweep_array.json".to_string(),
        });
        assert_eq!(node.origin().map(|o| o.node.as_str()), Some("0000_sweep_array.json"));
    }
}
