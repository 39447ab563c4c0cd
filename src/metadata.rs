//! Session metadata written alongside every data directory.
//!
//! A `Metadata` value describes one acquisition session: which procedure ran, on which
//! cryostat, when it started and finished, the parameters it was given and a snapshot of
//! the configuration. [`crate::storage::DataDirectory`] writes it into `manifest.json`
//! when the directory is closed, so a directory can be understood without the script
//! that produced it.
//!
//! `MetadataBuilder` assembles one step by step:
//!
//! ```
//! use kid_readout::metadata::MetadataBuilder;
//!
//! let metadata = MetadataBuilder::new()
//!     .procedure("sweep_stream")
//!     .cryostat("STARCryo")
//!     .parameter("dac_attenuation", serde_json::json!(20.0))
//!     .build();
//! assert!(metadata.validate().is_ok());
//! ```

use crate::error::{ReadoutError, ReadoutResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    /// Name of the procedure that produced the data, e.g. `sweep_stream`.
    pub procedure: String,
    pub description: String,
    pub cryostat: String,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    /// Procedure arguments such as attenuations, voltages and tone counts.
    pub parameters: BTreeMap<String, Value>,
    /// Snapshot of the settings in force during the session.
    pub settings: Value,
    /// Free-text notes.
    pub annotations: String,
    pub software_version: String,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            procedure: "unnamed".to_string(),
            description: String::new(),
            cryostat: String::new(),
            started: Utc::now(),
            finished: None,
            parameters: BTreeMap::new(),
            settings: Value::Null,
            annotations: String::new(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Default)]
pub struct MetadataBuilder {
    inner: Metadata,
}

impl MetadataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn procedure(mut self, name: &str) -> Self {
        self.inner.procedure = name.to_string();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.inner.description = description.to_string();
        self
    }

    pub fn cryostat(mut self, cryostat: &str) -> Self {
        self.inner.cryostat = cryostat.to_string();
        self
    }

    pub fn parameter(mut self, key: &str, value: Value) -> Self {
        self.inner.parameters.insert(key.to_string(), value);
        self
    }

    /// Record the settings; anything serializable is accepted.
    pub fn settings<S: Serialize>(mut self, settings: &S) -> Self {
        self.inner.settings = serde_json::to_value(settings).unwrap_or(Value::Null);
        self
    }

    pub fn annotations(mut self, annotations: &str) -> Self {
        self.inner.annotations = annotations.to_string();
        self
    }

    pub fn build(self) -> Metadata {
        self.inner
    }
}

impl Metadata {
    pub fn validate(&self) -> ReadoutResult<()> {
        if self.procedure.is_empty() {
            return Err(ReadoutError::InvalidArgument("procedure name cannot be empty".to_string()));
        }
        if let Some(finished) = self.finished {
            if finished < self.started {
                return Err(ReadoutError::InvalidArgument(
                    "session finished before it started".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn finish(&mut self) {
        self.finished = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    #[test]
    fn test_builder_records_settings() {
        let metadata = MetadataBuilder::new()
            .procedure("filterbank_bin")
            .settings(&Settings::default())
            .parameter("wait_seconds", Value::from(5))
            .build();
        assert_eq!(metadata.settings["cryostat"]["name"], "STARCryo");
        assert_eq!(metadata.parameters["wait_seconds"], 5);
        assert!(metadata.finished.is_none());
    }

    #[test]
    fn test_validate() {
        let mut metadata = MetadataBuilder::new().procedure("").build();
        assert!(metadata.validate().is_err());
        metadata.procedure = "scan".to_string();
        metadata.finish();
        assert!(metadata.validate().is_ok());
        let json = serde_json::to_string(&metadata).unwrap();
        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, metadata);
    }
}
