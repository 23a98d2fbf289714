use thiserror::Error;

/// Main error type for the guardrail control plane
#[derive(Error, Debug)]
pub enum GuardrailError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    // Persistence errors
    #[error("Evidence ledger error: {0}")]
    Storage(#[from] StorageError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Concurrency errors
    #[error("State lock poisoned: {0}")]
    Poisoned(&'static str),

    // Evaluation errors
    #[error("Rule evaluation failed: {0}")]
    Evaluation(String),

    #[error("Validation failed: {0}")]
    Validation(String),
}

/// Result type alias for GuardrailError
pub type Result<T> = std::result::Result<T, GuardrailError>;

/// Failures of the evidence ledger.
///
/// Any of these rejects the transition that tried to persist.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("ledger io failure on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger serialization failure: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("record {record_id} (seq {seq}) failed hash verification")]
    Tampered { seq: u64, record_id: String },

    #[error("unparsable ledger line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("ledger line {line} belongs to family {found}, expected {expected}")]
    FamilyMismatch {
        line: usize,
        expected: String,
        found: String,
    },

    #[error("ledger write rejected: {0}")]
    FaultInjected(String),

    #[error("ledger lock poisoned")]
    Poisoned,
}

impl StorageError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_lists_every_problem() {
        let err = GuardrailError::InvalidConfig(vec![
            "black_swan.drawdown.threshold must be positive".to_string(),
            "degradation.window_size must be at least 2".to_string(),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("drawdown.threshold"));
        assert!(msg.contains("window_size"));
    }

    #[test]
    fn test_storage_error_converts() {
        let err: GuardrailError = StorageError::Tampered {
            seq: 3,
            record_id: "bs-1".to_string(),
        }
        .into();
        assert!(matches!(err, GuardrailError::Storage(_)));
        assert!(err.to_string().contains("bs-1"));
    }
}
