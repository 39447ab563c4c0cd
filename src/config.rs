//! Configuration system using Figment
//!
//! Configuration is loaded from:
//! 1. `config/default.toml` (base configuration)
//! 2. Environment variables (prefixed with `KID_`, nested keys split on `__`)
//!
//! ```text
//! KID_APPLICATION__LOG_LEVEL=debug
//! KID_STORAGE__DATA_DIR=/data/readout
//! KID_INSTRUMENTS__SIM900__PORT=/dev/ttyUSB1
//! ```
//!
//! # Example
//!
//! ```no_run
//! use kid_readout::config::Settings;
//!
//! let settings = Settings::load().unwrap();
//! println!("Cryostat: {}", settings.cryostat.name);
//! ```

use crate::error::{ReadoutError, ReadoutResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    pub application: ApplicationConfig,
    pub storage: StorageConfig,
    pub cryostat: CryostatConfig,
    pub readout: ReadoutConfig,
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub instruments: InstrumentsConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Root directory for new data directories
    pub data_dir: PathBuf,
    /// Directory holding thermometry CSV logs
    #[serde(default)]
    pub temperature_log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CryostatConfig {
    pub name: String,
    /// Gain of the DAC output chain to the device, in dB
    #[serde(default = "default_dac_chain_gain")]
    pub dac_chain_gain_db: f64,
}

/// Parameters of the readout electronics and of the simulated readout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadoutConfig {
    #[serde(default)]
    pub heterodyne: bool,
    #[serde(default = "default_adc_sample_rate")]
    pub adc_sample_rate_hz: f64,
    #[serde(default = "default_num_filterbank_channels")]
    pub num_filterbank_channels: u64,
    #[serde(default = "default_num_tone_samples")]
    pub num_tone_samples: u64,
    /// Granularity of the local oscillator, in MHz
    #[serde(default = "default_lo_step")]
    pub lo_step_mhz: f64,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Resonators and noise used by the simulated readout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationConfig {
    #[serde(default = "default_resonances")]
    pub resonances_mhz: Vec<f64>,
    #[serde(default = "default_q")]
    pub q: f64,
    #[serde(default = "default_q_e")]
    pub q_e: f64,
    #[serde(default = "default_noise")]
    pub noise_amplitude: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisConfig {
    #[serde(default = "default_deglitch_threshold")]
    pub deglitch_threshold: f64,
    #[serde(default = "default_deglitch_window")]
    pub deglitch_window_seconds: f64,
    #[serde(default = "default_mask_extend")]
    pub mask_extend_samples: usize,
    #[serde(default = "default_bins_per_decade")]
    pub bins_per_decade: usize,
    #[serde(default = "default_low_pass_cutoff")]
    pub low_pass_cutoff_hz: f64,
    /// Fits that move a resonance further than this keep the previous frequency
    #[serde(default = "default_max_shift")]
    pub max_f0_shift_hz: f64,
    #[serde(default = "default_min_spacing")]
    pub min_tone_spacing_mhz: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InstrumentsConfig {
    #[serde(default)]
    pub sim900: Option<Sim900Config>,
    #[serde(default)]
    pub function_generator: Option<FunctionGeneratorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sim900Config {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_serial_timeout")]
    pub timeout_ms: u64,
    /// Mainframe slot holding the resistance bridge
    #[serde(default = "default_bridge_slot")]
    pub bridge_slot: char,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionGeneratorConfig {
    pub host: String,
    #[serde(default = "default_scpi_port")]
    pub port: u16,
    #[serde(default = "default_load_ohms")]
    pub load_ohms: f64,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_dac_chain_gain() -> f64 {
    -52.0
}

fn default_adc_sample_rate() -> f64 {
    512e6
}

fn default_num_filterbank_channels() -> u64 {
    16384
}

fn default_num_tone_samples() -> u64 {
    1 << 16
}

fn default_lo_step() -> f64 {
    2.5e-3
}

fn default_resonances() -> Vec<f64> {
    vec![100.0, 110.0, 120.0, 130.0]
}

fn default_q() -> f64 {
    5e3
}

fn default_q_e() -> f64 {
    1e4
}

fn default_noise() -> f64 {
    1e-3
}

fn default_seed() -> u64 {
    0x5eed
}

fn default_deglitch_threshold() -> f64 {
    8.0
}

fn default_deglitch_window() -> f64 {
    1.0
}

fn default_mask_extend() -> usize {
    50
}

fn default_bins_per_decade() -> usize {
    30
}

fn default_low_pass_cutoff() -> f64 {
    4.0
}

fn default_max_shift() -> f64 {
    200e3
}

fn default_min_spacing() -> f64 {
    0.031
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_serial_timeout() -> u64 {
    2000
}

fn default_bridge_slot() -> char {
    '2'
}

fn default_scpi_port() -> u16 {
    5025
}

fn default_load_ohms() -> f64 {
    1000.0
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            resonances_mhz: default_resonances(),
            q: default_q(),
            q_e: default_q_e(),
            noise_amplitude: default_noise(),
            seed: default_seed(),
        }
    }
}

impl Default for ReadoutConfig {
    fn default() -> Self {
        Self {
            heterodyne: false,
            adc_sample_rate_hz: default_adc_sample_rate(),
            num_filterbank_channels: default_num_filterbank_channels(),
            num_tone_samples: default_num_tone_samples(),
            lo_step_mhz: default_lo_step(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            deglitch_threshold: default_deglitch_threshold(),
            deglitch_window_seconds: default_deglitch_window(),
            mask_extend_samples: default_mask_extend(),
            bins_per_decade: default_bins_per_decade(),
            low_pass_cutoff_hz: default_low_pass_cutoff(),
            max_f0_shift_hz: default_max_shift(),
            min_tone_spacing_mhz: default_min_spacing(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationConfig {
                name: "kid_readout".to_string(),
                log_level: "info".to_string(),
            },
            storage: StorageConfig {
                data_dir: PathBuf::from("data"),
                temperature_log_dir: None,
            },
            cryostat: CryostatConfig {
                name: "STARCryo".to_string(),
                dac_chain_gain_db: default_dac_chain_gain(),
            },
            readout: ReadoutConfig::default(),
            analysis: AnalysisConfig::default(),
            instruments: InstrumentsConfig::default(),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from `config/default.toml` and environment variables.
    pub fn load() -> ReadoutResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// Values missing from the file fall back to [`Settings::default`]; environment
    /// variables take precedence over both.
    pub fn load_from<P: AsRef<Path>>(path: P) -> ReadoutResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("KID_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> ReadoutResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ReadoutError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let readout = &self.readout;
        if readout.adc_sample_rate_hz <= 0.0 {
            return Err(ReadoutError::Configuration(
                "readout.adc_sample_rate_hz must be positive".to_string(),
            ));
        }
        if readout.num_filterbank_channels == 0 || readout.num_tone_samples == 0 {
            return Err(ReadoutError::Configuration(
                "readout channel and tone sample counts must be > 0".to_string(),
            ));
        }
        if readout.lo_step_mhz <= 0.0 {
            return Err(ReadoutError::Configuration(
                "readout.lo_step_mhz must be positive".to_string(),
            ));
        }

        let analysis = &self.analysis;
        if analysis.bins_per_decade == 0 {
            return Err(ReadoutError::Configuration(
                "analysis.bins_per_decade must be > 0".to_string(),
            ));
        }
        if analysis.deglitch_threshold <= 0.0 || analysis.deglitch_window_seconds <= 0.0 {
            return Err(ReadoutError::Configuration(
                "analysis deglitch threshold and window must be positive".to_string(),
            ));
        }

        if let Some(sim900) = &self.instruments.sim900 {
            if sim900.port.is_empty() {
                return Err(ReadoutError::Configuration(
                    "instruments.sim900.port cannot be empty".to_string(),
                ));
            }
            if !"123456789ABCD".contains(sim900.bridge_slot) {
                return Err(ReadoutError::Configuration(format!(
                    "instruments.sim900.bridge_slot '{}' is not a SIM900 port",
                    sim900.bridge_slot
                )));
            }
        }
        if let Some(fg) = &self.instruments.function_generator {
            if fg.host.is_empty() {
                return Err(ReadoutError::Configuration(
                    "instruments.function_generator.host cannot be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut settings = Settings::default();
        settings.application.log_level = "chatty".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_bad_bridge_slot_rejected() {
        let mut settings = Settings::default();
        settings.instruments.sim900 = Some(Sim900Config {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            timeout_ms: 2000,
            bridge_slot: 'Z',
        });
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
name = "readout"
log_level = "debug"

[cryostat]
name = "HPD"

[instruments.function_generator]
host = "192.168.0.202"
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.cryostat.name, "HPD");
        assert_eq!(settings.cryostat.dac_chain_gain_db, -52.0);
        assert_eq!(settings.analysis.bins_per_decade, 30);
        let fg = settings.instruments.function_generator.unwrap();
        assert_eq!(fg.port, 5025);
        assert_eq!(fg.load_ohms, 1000.0);
    }

    #[test]
    fn test_serialized_settings_load_back() {
        let mut settings = Settings::default();
        settings.readout.heterodyne = true;
        settings.readout.simulation.resonances_mhz = vec![812.5, 840.0];
        settings.storage.temperature_log_dir = Some(PathBuf::from("/tmp/thermometry"));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", toml::to_string(&settings).unwrap()).unwrap();
        assert_eq!(Settings::load_from(file.path()).unwrap(), settings);
    }
}
