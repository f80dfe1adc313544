//! Error types for the fleet state crate.

use thiserror::Error;

use crate::types::{InstanceId, InstanceState};

pub type StoreResult<T> = Result<T, StoreError>;

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors raised by the redb-backed store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

/// Errors raised by `InstanceRegistry` mutations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("fleet is at capacity ({max} instances)")]
    CapacityExceeded { max: u32 },

    #[error("instance not found: {0}")]
    NotFound(InstanceId),

    #[error("instance {id}: cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: InstanceId,
        from: InstanceState,
        to: InstanceState,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors raised by `TemplateCatalog`.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("invalid template: {0}")]
    Invalid(String),

    #[error("template version {0} is already published")]
    AlreadyPublished(u32),

    #[error("template version {0} not found")]
    NotFound(u32),

    #[error("no launch templates published")]
    Empty,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
