//! Custom error types for the library.
//!
//! `ReadoutError` is the single error type returned by the numeric and data-model parts of
//! the crate. Instrument drivers and acquisition procedures return `anyhow::Result` and
//! wrap these errors with context as they propagate.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps `figment` errors raised while loading configuration files.
//! - **`Configuration`**: Semantic configuration problems found during validation.
//! - **`Io`** / **`Json`** / **`Csv`**: storage and serialization failures.
//! - **`Instrument`**: malformed replies or protocol violations from hardware.
//! - **`InvalidArgument`**: a caller passed a value outside the accepted range, such as an
//!   excitation code the SIM921 does not know.
//! - **`Shape`**: array dimensions that do not agree, e.g. a stream array whose sample
//!   matrix has the wrong number of rows.
//! - **`Fit`**: a nonlinear fit that could not be started or did not converge.
//! - **`FeatureNotEnabled`**: functionality that was compiled out via feature flags.

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type ReadoutResult<T> = std::result::Result<T, ReadoutError>;

#[derive(Error, Debug)]
pub enum ReadoutError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("Fit error: {0}")]
    Fit(String),

    #[error("Data processing error: {0}")]
    Processing(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ReadoutError::Instrument("bridge did not answer".to_string());
        assert_eq!(err.to_string(), "Instrument error: bridge did not answer");
    }

    #[test]
    fn test_feature_not_enabled_message() {
        let err = ReadoutError::FeatureNotEnabled("storage_csv".into());
        assert!(err.to_string().contains("--features storage_csv"));
    }
}
