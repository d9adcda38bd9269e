//! Error types for federated boosting sessions

use thiserror::Error;

/// Result type alias using the fedgb Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for training, sharding and inference
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Unsupported objective: {objective}")]
    UnsupportedObjective { objective: String },

    #[error("Unsupported phase: {phase}")]
    UnsupportedPhase { phase: i32 },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // Data validation errors
    #[error("Invalid label: {message}")]
    InvalidLabel { message: String },

    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    // Protocol errors
    #[error("Phase {phase} mismatch: expected {expected}, got {actual}")]
    PhaseMismatch {
        phase: i32,
        expected: String,
        actual: String,
    },

    #[error("Merge type error in phase {phase}: {message}")]
    MergeTypeError { phase: i32, message: String },

    #[error("Split bucket corruption: feature={feature}, bucket={bucket}")]
    SplitBucketCorruption { feature: usize, bucket: usize },

    #[error("Unknown query record: {record_id}")]
    UnknownRecord { record_id: u32 },

    // Cryptography errors
    #[error("Encryption error: {message}")]
    Encryption { message: String },

    // Model interchange errors
    #[error("Model format error at line {line}: {message}")]
    ModelFormat { line: usize, message: String },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Shorthand for a phase mismatch between the expected and received message kinds
    pub fn phase_mismatch(phase: i32, expected: &str, actual: &str) -> Self {
        Error::PhaseMismatch {
            phase,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Shorthand for an internal invariant violation
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error aborts the training session
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::InvalidData { .. } | Error::ModelFormat { .. } | Error::Serialization(_)
        )
    }

    /// Returns true if this error indicates a coordinator/protocol bug
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::PhaseMismatch { .. }
                | Error::MergeTypeError { .. }
                | Error::SplitBucketCorruption { .. }
                | Error::UnknownRecord { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_fatal() {
        let err = Error::UnsupportedObjective {
            objective: "rank:pairwise".to_string(),
        };
        assert!(err.is_fatal());

        let err = Error::SplitBucketCorruption {
            feature: 3,
            bucket: 1,
        };
        assert!(err.is_fatal());

        let err = Error::ModelFormat {
            line: 4,
            message: "bad float".to_string(),
        };
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_error_protocol_violation() {
        let err = Error::phase_mismatch(2, "EncryptedGradHess", "P4Request");
        assert!(err.is_protocol_violation());
        assert_eq!(
            err.to_string(),
            "Phase 2 mismatch: expected EncryptedGradHess, got P4Request"
        );

        let err = Error::InvalidLabel {
            message: "non-positive".to_string(),
        };
        assert!(!err.is_protocol_violation());
    }
}
