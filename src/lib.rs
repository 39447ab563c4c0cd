//! Data acquisition and noise analysis for kinetic inductance detector readout.
//!
//! The crate drives the digitizer and the lab instruments around it, stores what they
//! measure, and turns sweeps and streams into resonator fits and noise spectra:
//!
//! - [`readout`]: the digitizer interface and a simulated digitizer.
//! - [`instrument`] / [`adapters`]: SIM900 thermometry and the heater supply, over
//!   serial or TCP links.
//! - [`acquire`]: sweep-and-stream procedures built on the two above.
//! - [`measurement`]: the sweep/stream data model.
//! - [`analysis`]: resonator fitting, spectral estimation and glitch removal.
//! - [`storage`]: JSON measurement directories, CSV export and thermometry logs.

pub mod acquire;
pub mod adapters;
pub mod analysis;
pub mod config;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod measurement;
pub mod metadata;
pub mod readout;
pub mod storage;

pub use error::{ReadoutError, ReadoutResult};
