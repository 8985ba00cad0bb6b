use std::error::Error as StdError;

use thiserror::Error;

/// Errors surfaced by the cache layer.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A caller handed in a value the cache cannot work with.
    #[error("invalid argument `{what}`: {reason}")]
    InvalidArgument { what: &'static str, reason: String },
    /// The retrieval function failed; nothing was cached.
    #[error("retrieval failed: {0}")]
    Retrieve(#[source] Box<dyn StdError + Send + Sync>),
    /// The entry stored under `key` holds a different result type.
    #[error("cached value under `{key}` has an unexpected type")]
    TypeMismatch { key: String },
    #[error("failed to encode filter: {0}")]
    Filter(#[from] serde_json::Error),
}

impl CacheError {
    pub fn invalid_argument(what: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            what,
            reason: reason.into(),
        }
    }

    pub fn retrieve(error: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Retrieve(error.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retrieve_keeps_source_chain() {
        let io = std::io::Error::other("connection reset");
        let error = CacheError::retrieve(io);

        assert_eq!(error.to_string(), "retrieval failed: connection reset");
        let source = error.source().expect("source is preserved");
        assert_eq!(source.to_string(), "connection reset");
    }

    #[test]
    fn invalid_argument_names_the_offender() {
        let error = CacheError::invalid_argument("cache_key", "must not be empty");
        assert_eq!(
            error.to_string(),
            "invalid argument `cache_key`: must not be empty"
        );
    }
}
