//! Error types for entity engine operations

use std::fmt;
use thiserror::Error;

use crate::privacy::Operation;

/// Result type alias for entity engine operations
pub type Result<T> = std::result::Result<T, EntError>;

/// Error type for entity engine operations
#[derive(Error, Debug)]
pub enum EntError {
    /// Row is absent. Only raised by the strict (`*_x`) variants.
    #[error("{entity} not found: {key}")]
    NotFound { entity: String, key: String },

    /// Privacy rules denied the operation.
    ///
    /// The message names the entity, the principal and the deciding rule,
    /// never the contents of the row.
    #[error("Access denied: {principal} cannot {operation} {entity} ({reason})")]
    Authorization {
        entity: String,
        operation: Operation,
        principal: String,
        reason: String,
    },

    /// No reachable node for a resolved island
    #[error("Routing error on island {island}: {message}")]
    Routing { island: u32, message: String },

    /// Query execution failed on a node
    #[error("Store error on {node}: {message}")]
    Store { node: String, message: String },

    /// Malformed payload (unknown column, missing required column, ...)
    #[error("Invalid {entity} payload: {message}")]
    Validation { entity: String, message: String },

    /// Startup-time misconfiguration (topology, schema, rule references)
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl EntError {
    /// Create a not found error
    pub fn not_found(entity: impl Into<String>, key: impl fmt::Display) -> Self {
        Self::NotFound {
            entity: entity.into(),
            key: key.to_string(),
        }
    }

    /// Create an authorization error
    pub fn authorization(
        entity: impl Into<String>,
        operation: Operation,
        principal: impl fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Self::Authorization {
            entity: entity.into(),
            operation,
            principal: principal.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a routing error
    pub fn routing(island: u32, message: impl Into<String>) -> Self {
        Self::Routing {
            island,
            message: message.into(),
        }
    }

    /// Create a store error
    pub fn store(node: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Store {
            node: node.into(),
            message: message.to_string(),
        }
    }

    /// Create a validation error
    pub fn validation(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            entity: entity.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Routing and store failures: the database, not the caller, is at fault
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Routing { .. } | Self::Store { .. })
    }

    /// Reads failing with these may be retried by the caller with backoff.
    /// Writes must not be retried blindly.
    pub fn is_retryable_read(&self) -> bool {
        self.is_infrastructure()
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::Authorization { .. })
    }

    /// Errors a privacy predicate may swallow and treat as `false`.
    ///
    /// Infrastructure and configuration errors always propagate.
    pub(crate) fn is_swallowable_in_predicate(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::Authorization { .. } | Self::Validation { .. }
        )
    }
}
