use thiserror::Error;

use crate::converter::ConversionError;
use crate::storage::StorageError;

/// Failures surfaced by resolution and by the manager.
///
/// Resolution-layer errors (`SourceUnavailable`) stop a load before any
/// conversion is attempted. Conversion and write failures are reported per
/// asset; the caller decides whether a missing asset is fatal.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("source unavailable: {path}: {source}")]
    SourceUnavailable {
        path: String,
        #[source]
        source: StorageError,
    },

    /// Resolution found neither a usable archive cache nor the source file.
    #[error("no source file: {path}")]
    NoSource { path: String },

    #[error("no source, cache or uncached artifact for {path}")]
    NoSourceNoCache { path: String },

    #[error("conversion of {path} failed: {source}")]
    ConversionFailed {
        path: String,
        #[source]
        source: ConversionError,
    },

    #[error("cache write to {path} failed: {source}")]
    CacheWriteFailed {
        path: String,
        #[source]
        source: StorageError,
    },

    #[error("converter produced no output for {path}")]
    EmptyOutput { path: String },

    #[error("unknown asset kind '{0}'")]
    UnknownKind(String),

    #[error("failed to start conversion worker for '{kind}': {source}")]
    WorkerSpawn {
        kind: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(String),
}

impl CacheError {
    /// True for the terminal "asset truly missing" outcomes.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CacheError::NoSource { .. } | CacheError::NoSourceNoCache { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_unavailable_mentions_path_and_cause() {
        let err = CacheError::SourceUnavailable {
            path: "art/meshes/model.dae".to_string(),
            source: StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "denied",
            )),
        };
        let message = err.to_string();
        assert!(message.contains("art/meshes/model.dae"));
        assert!(message.contains("denied"));
        assert!(!err.is_not_found());
    }

    #[test]
    fn conversion_failed_keeps_converter_reason() {
        let err = CacheError::ConversionFailed {
            path: "model.dae".to_string(),
            source: ConversionError::Failed("bad xml".to_string()),
        };
        assert!(err.to_string().contains("bad xml"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn missing_outcomes_are_not_found() {
        assert!(CacheError::NoSourceNoCache {
            path: "model.pmd".to_string()
        }
        .is_not_found());
        assert!(CacheError::NoSource {
            path: "model.dae".to_string()
        }
        .is_not_found());
    }
}
