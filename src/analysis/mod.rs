//! Signal processing and resonator analysis.
//!
//! Everything here works on plain slices so it can be used on data loaded from disk as
//! well as data coming straight off the readout.

pub mod binning;
pub mod despike;
pub mod directory;
pub mod filters;
pub mod fitting;
pub mod iqnoise;
pub mod noise_measurement;
pub mod peaks;
pub mod periodic;
pub mod polynomial;
pub mod resonator;
pub mod spectral;

pub use directory::{analyze_directory, DirectoryAnalysis};
pub use noise_measurement::{NoiseMeasurementOptions, NoiseSummary, SweepNoiseMeasurement};
pub use resonator::{fit_best_resonator, Resonator, ResonatorModel};
