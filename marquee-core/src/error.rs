//! Error types for Marquee operations

use crate::EntityType;
use thiserror::Error;
use uuid::Uuid;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {entity_type:?} with id {id}")]
    NotFound { entity_type: EntityType, id: Uuid },

    #[error("Duplicate key in {collection} on index {index}: {value}")]
    DuplicateKey {
        collection: String,
        index: String,
        value: String,
    },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Connection reset: {reason}")]
    ConnectionReset { reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Storage backend error: {reason}")]
    Backend { reason: String },

    #[error("Injected failure during {operation}")]
    InjectedFailure { operation: String },
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Referenced parent not found: {entity_type:?} with id {id}")]
    ParentNotFound { entity_type: EntityType, id: Uuid },

    #[error("{entity_type:?} with {field} {value} already exists")]
    AlreadyExists {
        entity_type: EntityType,
        field: String,
        value: String,
    },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all Marquee errors.
#[derive(Debug, Clone, Error)]
pub enum MarqueeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Operation failed after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("Origin fetch failed: {reason}")]
    Origin { reason: String, transient: bool },
}

impl MarqueeError {
    /// Whether retrying the failed operation could change the outcome.
    ///
    /// Only dropped connections and origin failures explicitly flagged as
    /// transient qualify. Business errors (not-found, validation, duplicate
    /// keys) are never transient: replaying a non-idempotent write that failed
    /// with "already exists" would be wrong.
    pub fn is_transient(&self) -> bool {
        match self {
            MarqueeError::Storage(StorageError::ConnectionReset { .. }) => true,
            MarqueeError::Origin { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Build a transient origin error.
    pub fn transient_origin(reason: impl Into<String>) -> Self {
        MarqueeError::Origin {
            reason: reason.into(),
            transient: true,
        }
    }

    /// Build a permanent origin error.
    pub fn permanent_origin(reason: impl Into<String>) -> Self {
        MarqueeError::Origin {
            reason: reason.into(),
            transient: false,
        }
    }

    pub fn not_found(entity_type: EntityType, id: Uuid) -> Self {
        MarqueeError::Storage(StorageError::NotFound { entity_type, id })
    }
}

impl From<serde_json::Error> for MarqueeError {
    fn from(e: serde_json::Error) -> Self {
        MarqueeError::Storage(StorageError::Serialization {
            reason: e.to_string(),
        })
    }
}

/// Result type alias for Marquee operations.
pub type MarqueeResult<T> = Result<T, MarqueeError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display_not_found() {
        let err = StorageError::NotFound {
            entity_type: EntityType::Episode,
            id: Uuid::nil(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Entity not found"));
        assert!(msg.contains("Episode"));
        assert!(msg.contains("00000000-0000-0000-0000-000000000000"));
    }

    #[test]
    fn test_retry_exhausted_embeds_last_error() {
        let err = MarqueeError::RetryExhausted {
            attempts: 5,
            last_error: "connection reset by peer".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("after 5 attempts"));
        assert!(msg.contains("connection reset by peer"));
    }

    #[test]
    fn test_transient_classification() {
        let reset = MarqueeError::from(StorageError::ConnectionReset {
            reason: "eof".to_string(),
        });
        assert!(reset.is_transient());
        assert!(MarqueeError::transient_origin("timeout").is_transient());

        assert!(!MarqueeError::permanent_origin("gone").is_transient());
        assert!(!MarqueeError::not_found(EntityType::Season, Uuid::nil()).is_transient());
        assert!(!MarqueeError::from(ValidationError::AlreadyExists {
            entity_type: EntityType::Episode,
            field: "episode_number".to_string(),
            value: "3".to_string(),
        })
        .is_transient());
        assert!(!MarqueeError::from(StorageError::DuplicateKey {
            collection: "episodes".to_string(),
            index: "season_episode_number".to_string(),
            value: "x".to_string(),
        })
        .is_transient());
        assert!(!MarqueeError::RetryExhausted {
            attempts: 5,
            last_error: "x".to_string()
        }
        .is_transient());
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "MARQUEE_CACHE_PORT".to_string(),
            value: "abc".to_string(),
            reason: "must be a port number".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("MARQUEE_CACHE_PORT"));
        assert!(msg.contains("abc"));
        assert!(msg.contains("must be a port number"));
    }

    #[test]
    fn test_marquee_error_from_variants() {
        let storage = MarqueeError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, MarqueeError::Storage(_)));

        let validation = MarqueeError::from(ValidationError::RequiredFieldMissing {
            field: "title".to_string(),
        });
        assert!(matches!(validation, MarqueeError::Validation(_)));

        let config = MarqueeError::from(ConfigError::MissingRequired {
            field: "MARQUEE_CACHE_HOST".to_string(),
        });
        assert!(matches!(config, MarqueeError::Config(_)));

        let serde_err = serde_json::from_str::<u32>("nope").unwrap_err();
        assert!(matches!(
            MarqueeError::from(serde_err),
            MarqueeError::Storage(StorageError::Serialization { .. })
        ));
    }
}
