//! Error types for Pledge operations

use std::path::PathBuf;
use thiserror::Error;

/// Variable reference parsing errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefError {
    #[error("Empty variable name in '{input}'")]
    EmptyName { input: String },

    #[error("Index brackets do not balance in '{input}'")]
    UnbalancedBrackets { input: String },

    #[error("Namespace given without a scope in '{input}'")]
    NamespaceWithoutScope { input: String },
}

/// Key/value store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to open database '{path}': {reason}")]
    OpenFailed { path: PathBuf, reason: String },

    #[error("Database '{path}' is corrupt")]
    Corrupt { path: PathBuf },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Repair of '{path}' failed: {reason}")]
    RepairFailed { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Class context errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClassError {
    #[error("'{name}' is not a legal class identifier")]
    InvalidName { name: String },

    #[error("Malformed class expression '{expr}': {reason}")]
    BadExpression { expr: String, reason: String },
}

/// CMDB document errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CmdbError {
    #[error("CMDB file exceeds size limit ({size} > {max} bytes)")]
    TooLarge { size: u64, max: u64 },

    #[error("CMDB contents must be a JSON object")]
    NotAnObject,

    #[error("CMDB '{section}' data cannot contain variable references")]
    UnresolvedReference { section: String },

    #[error("Invalid CMDB JSON: {0}")]
    Json(String),
}

/// Actuator-internal failures. Promise outcomes are `PromiseResult` values,
/// not errors; these cover the validation and OS-error taxonomy.
#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("Validation failed: {reason}")]
    Validation { reason: String },

    #[error("Precondition unmet: {reason}")]
    Precondition { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Advisory lock errors.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock '{name}' is held by pid {holder}")]
    Held { name: String, holder: u32 },

    #[error("Lock store error: {0}")]
    Store(String),
}

/// Master error type for all Pledge errors.
#[derive(Debug, Error)]
pub enum PledgeError {
    #[error("Reference error: {0}")]
    Ref(#[from] RefError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Class error: {0}")]
    Class(#[from] ClassError),

    #[error("CMDB error: {0}")]
    Cmdb(#[from] CmdbError),

    #[error("Actuator error: {0}")]
    Actuator(#[from] ActuatorError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
}

/// Result type alias for Pledge operations.
pub type PledgeResult<T> = Result<T, PledgeError>;
