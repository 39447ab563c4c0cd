//! Drivers for the laboratory instruments around the readout.
//!
//! Drivers are generic over [`crate::adapters::Transport`]; the SIM modules are further
//! generic over [`sim900::SimLink`] so the same driver works on a dedicated serial port
//! or inside a SIM900 mainframe.

pub mod agilent_33220;
pub mod calibration;
pub mod sim900;
pub mod sim921;
pub mod sim922;
pub mod sim925;

pub use agilent_33220::{Agilent33220, DcSource, SimulatedDcSource};
pub use calibration::{load_curve, save_curve, CalibrationCurve, SimThermometer};
pub use sim900::{Direct, PortLink, Sim900, SimLink, SimModule};
pub use sim921::Sim921;
pub use sim922::Sim922;
pub use sim925::Sim925;
