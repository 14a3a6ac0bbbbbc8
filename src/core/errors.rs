// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the coordinator.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum OlivineError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete frame in stream")]
    IncompleteFrame,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown message type '{0}'")]
    UnknownMessageType(String),

    #[error("NOAUTH Authentication required")]
    AuthRequired,

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Access Denied")]
    AccessDenied,

    #[error("Map '{0}' not allowed")]
    MapNotAllowed(String),

    #[error("Mutations are disabled on this node")]
    MutationsDisabled,

    #[error("Subscriptions are disabled on this node")]
    SubscriptionsDisabled,

    #[error("Map type mismatch for '{map}': stored {stored}, requested {requested}")]
    MapTypeMismatch {
        map: String,
        stored: String,
        requested: String,
    },

    #[error("Rejected by conflict resolver")]
    ResolverRejected,

    #[error("Server overloaded")]
    Overloaded,

    #[error("Write concern timeout")]
    WriteConcernTimeout,

    #[error("Storage Error: {0}")]
    Storage(String),

    #[error("Replication Error: {0}")]
    Replication(String),

    #[error("Locking Error: {0}")]
    Locking(String),

    #[error("Cluster Error: {0}")]
    Cluster(String),

    #[error("Query Error: {0}")]
    Query(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown entry processor '{0}'")]
    UnknownProcessor(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// The inner error is wrapped in an Arc to allow for cheap, shared cloning.
impl Clone for OlivineError {
    fn clone(&self) -> Self {
        match self {
            OlivineError::Io(e) => OlivineError::Io(Arc::clone(e)),
            OlivineError::IncompleteFrame => OlivineError::IncompleteFrame,
            OlivineError::Protocol(s) => OlivineError::Protocol(s.clone()),
            OlivineError::UnknownMessageType(s) => OlivineError::UnknownMessageType(s.clone()),
            OlivineError::AuthRequired => OlivineError::AuthRequired,
            OlivineError::AuthFailed(s) => OlivineError::AuthFailed(s.clone()),
            OlivineError::AccessDenied => OlivineError::AccessDenied,
            OlivineError::MapNotAllowed(s) => OlivineError::MapNotAllowed(s.clone()),
            OlivineError::MutationsDisabled => OlivineError::MutationsDisabled,
            OlivineError::SubscriptionsDisabled => OlivineError::SubscriptionsDisabled,
            OlivineError::MapTypeMismatch {
                map,
                stored,
                requested,
            } => OlivineError::MapTypeMismatch {
                map: map.clone(),
                stored: stored.clone(),
                requested: requested.clone(),
            },
            OlivineError::ResolverRejected => OlivineError::ResolverRejected,
            OlivineError::Overloaded => OlivineError::Overloaded,
            OlivineError::WriteConcernTimeout => OlivineError::WriteConcernTimeout,
            OlivineError::Storage(s) => OlivineError::Storage(s.clone()),
            OlivineError::Replication(s) => OlivineError::Replication(s.clone()),
            OlivineError::Locking(s) => OlivineError::Locking(s.clone()),
            OlivineError::Cluster(s) => OlivineError::Cluster(s.clone()),
            OlivineError::Query(s) => OlivineError::Query(s.clone()),
            OlivineError::InvalidRequest(s) => OlivineError::InvalidRequest(s.clone()),
            OlivineError::UnknownProcessor(s) => OlivineError::UnknownProcessor(s.clone()),
            OlivineError::Internal(s) => OlivineError::Internal(s.clone()),
        }
    }
}

impl PartialEq for OlivineError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (OlivineError::Io(e1), OlivineError::Io(e2)) => e1.to_string() == e2.to_string(),
            (OlivineError::Protocol(s1), OlivineError::Protocol(s2)) => s1 == s2,
            (OlivineError::UnknownMessageType(s1), OlivineError::UnknownMessageType(s2)) => {
                s1 == s2
            }
            (OlivineError::AuthFailed(s1), OlivineError::AuthFailed(s2)) => s1 == s2,
            (OlivineError::MapNotAllowed(s1), OlivineError::MapNotAllowed(s2)) => s1 == s2,
            (OlivineError::Storage(s1), OlivineError::Storage(s2)) => s1 == s2,
            (OlivineError::Replication(s1), OlivineError::Replication(s2)) => s1 == s2,
            (OlivineError::Locking(s1), OlivineError::Locking(s2)) => s1 == s2,
            (OlivineError::Cluster(s1), OlivineError::Cluster(s2)) => s1 == s2,
            (OlivineError::Query(s1), OlivineError::Query(s2)) => s1 == s2,
            (OlivineError::InvalidRequest(s1), OlivineError::InvalidRequest(s2)) => s1 == s2,
            (OlivineError::UnknownProcessor(s1), OlivineError::UnknownProcessor(s2)) => s1 == s2,
            (OlivineError::Internal(s1), OlivineError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for OlivineError {
    fn from(e: std::io::Error) -> Self {
        OlivineError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for OlivineError {
    fn from(e: serde_json::Error) -> Self {
        OlivineError::Protocol(format!("JSON error: {e}"))
    }
}

impl From<rmp_serde::decode::Error> for OlivineError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        OlivineError::Protocol(format!("Binary decode error: {e}"))
    }
}

impl From<rmp_serde::encode::Error> for OlivineError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        OlivineError::Internal(format!("Binary encode error: {e}"))
    }
}

impl From<std::string::FromUtf8Error> for OlivineError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        OlivineError::Protocol(format!("Invalid UTF-8: {e}"))
    }
}

impl From<uuid::Error> for OlivineError {
    fn from(e: uuid::Error) -> Self {
        OlivineError::Internal(format!("Failed to generate UUID: {e}"))
    }
}
