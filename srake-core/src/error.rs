//! Error types for srake operations

use serde::Serialize;
use std::path::PathBuf;

/// Structured error payload shared between service and CLI rendering.
///
/// Used as the HTTP error body in srake-service and as the JSON error
/// shape printed by `srake --json` commands.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    pub hint: String,
}

impl ErrorEnvelope {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        hint: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            hint: hint.into(),
        }
    }

    pub fn internal(msg: &str) -> Self {
        Self::new("internal_error", msg, "Check service logs for details")
    }
}

impl From<&SrakeError> for ErrorEnvelope {
    fn from(err: &SrakeError) -> Self {
        Self::new(err.code(), err.to_string(), err.hint())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SrakeError {
    /// Retriable network failure (5xx, connection reset, timeout).
    #[error("transient network error: {0}")]
    NetworkTransient(String),

    /// Non-retriable network failure (4xx other than 416, bad URL).
    #[error("network error: {0}")]
    NetworkFatal(String),

    /// Gzip/CRC corruption while decoding the current archive member.
    #[error("corrupt archive data in {member}: {message}")]
    DecodeCorrupt { member: String, message: String },

    /// A single XML record could not be decoded; counted, not fatal.
    #[error("malformed XML near {context}: {message}")]
    XmlMalformed { context: String, message: String },

    #[error("store is busy: {0}")]
    StoreBusy(String),

    #[error("store unavailable at {}: locked beyond grace period", .0.display())]
    StoreUnavailable(PathBuf),

    /// Constraint violation on insert; the offending accession is skipped.
    #[error("constraint violation for accession {accession}: {message}")]
    StoreConstraint { accession: String, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("schema version mismatch: database is v{found}, this binary expects v{expected}. Upgrade srake or re-create the store.")]
    SchemaVersionMismatch { found: i32, expected: i32 },

    #[error("invalid accession: {0}")]
    InvalidAccession(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("field not allowed for aggregation: {0}")]
    FieldNotAllowed(String),

    #[error("search index error: {0}")]
    Index(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SrakeError {
    /// Stable machine-readable code for envelopes and exit-code mapping.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NetworkTransient(_) => "network_transient",
            Self::NetworkFatal(_) => "network_fatal",
            Self::DecodeCorrupt { .. } => "decode_corrupt",
            Self::XmlMalformed { .. } => "xml_malformed",
            Self::StoreBusy(_) => "store_busy",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::StoreConstraint { .. } => "store_constraint",
            Self::Cancelled => "cancelled",
            Self::ConfigInvalid(_) => "config_invalid",
            Self::SchemaVersionMismatch { .. } => "schema_mismatch",
            Self::InvalidAccession(_) => "invalid_accession",
            Self::NotFound(_) => "not_found",
            Self::FieldNotAllowed(_) => "field_not_allowed",
            Self::Index(_) => "index_error",
            Self::Embedding(_) => "embedding_error",
            Self::Database(_) => "database_error",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
        }
    }

    /// Next-step hint rendered with user-visible failures.
    pub fn hint(&self) -> &'static str {
        match self {
            Self::NetworkTransient(_) => "Retry, or run 'srake ingest --resume' to continue",
            Self::DecodeCorrupt { .. } => "Run 'srake ingest --status' to see which files errored",
            Self::Cancelled => "State was checkpointed; run 'srake ingest --resume' to continue",
            Self::StoreConstraint { .. } => "Re-run with --force to reset ingest state",
            Self::SchemaVersionMismatch { .. } => "Point --db at a fresh path or upgrade srake",
            Self::NotFound(_) => "Check the accession with 'srake search'",
            _ => "",
        }
    }

    /// Whether the controller should retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkTransient(_) | Self::StoreBusy(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(SrakeError::Cancelled.code(), "cancelled");
        assert_eq!(
            SrakeError::NetworkTransient("reset".into()).code(),
            "network_transient"
        );
    }

    #[test]
    fn test_envelope_from_error() {
        let err = SrakeError::NotFound("SRR000001".into());
        let env = ErrorEnvelope::from(&err);
        assert_eq!(env.code, "not_found");
        assert!(env.message.contains("SRR000001"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(SrakeError::NetworkTransient("503".into()).is_transient());
        assert!(SrakeError::StoreBusy("locked".into()).is_transient());
        assert!(!SrakeError::NetworkFatal("404".into()).is_transient());
    }
}
