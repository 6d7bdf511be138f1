//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the acquisition core.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different failure classes of a CPL scan, from a garbled instrument reply to a
//! photomultiplier protection trip.
//!
//! ## Error Hierarchy
//!
//! - **`Validation`**: A reply was received but its group tag or echoed value did not
//!   match the query. Retryable by the protocol layer.
//! - **`Communication`**: The protocol layer exhausted its retry bound (transport errors,
//!   timeouts or repeated validation mismatches). Fatal for a running scan.
//! - **`EmptyDataset`**: Alignment or processing produced zero usable samples. Retried by
//!   the scan controller at the point level.
//! - **`Coverage`**: A correction dataset does not span the measured wavelength range.
//!   The correction is skipped, the pipeline continues.
//! - **`SafetyTrip`**: Input-range saturation or PMT overexposure.
//! - **`Precondition`**: Rejected before a scan starts (illegal name, existing output,
//!   malformed numbers). No state is mutated.
//!
//! By using `#[from]`, `DaqError` can be created from underlying error types,
//! simplifying error handling throughout the crate with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation failure @{device}: query '{query}' answered '{response}'")]
    Validation {
        device: String,
        query: String,
        response: String,
    },

    #[error("Communication error @{device}: query '{query}' failed after {attempts} attempts ({reason})")]
    Communication {
        device: String,
        query: String,
        attempts: u32,
        reason: String,
    },

    #[error("Empty dataset: {0}")]
    EmptyDataset(String),

    #[error("Correction does not cover the measured range: {0}")]
    Coverage(String),

    #[error("Safety trip: {0}")]
    SafetyTrip(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Instrument not initialized: {0}")]
    NotInitialized(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl DaqError {
    /// Whether a scan point that failed with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DaqError::Validation { .. }
                | DaqError::Communication { .. }
                | DaqError::EmptyDataset(_)
        )
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Instrument("modulator failed".to_string());
        assert_eq!(err.to_string(), "Instrument error: modulator failed");
    }

    #[test]
    fn communication_is_distinguishable_from_validation() {
        let validation = DaqError::Validation {
            device: "PEM".into(),
            query: ":MOD:AMP 100.00".into(),
            response: "[AMP](99.00)".into(),
        };
        let communication = DaqError::Communication {
            device: "PEM".into(),
            query: ":MOD:AMP 100.00".into(),
            attempts: 3,
            reason: "read timeout".into(),
        };
        assert!(matches!(validation, DaqError::Validation { .. }));
        assert!(communication.to_string().contains("after 3 attempts"));
        assert!(validation.to_string().starts_with("Validation failure"));
    }

    #[test]
    fn retryable_classes() {
        assert!(DaqError::EmptyDataset("no samples".into()).is_retryable());
        assert!(!DaqError::Coverage("400-700".into()).is_retryable());
        assert!(!DaqError::Precondition("name".into()).is_retryable());
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = DaqError::ShutdownFailed(vec![
            DaqError::Instrument("monochromator timeout".into()),
            DaqError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)),
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }
}
