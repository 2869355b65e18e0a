use thiserror::Error;

use sbc_transaction_core::TransactionError;

/// A type alias for handling `Result`s with `SbcError`
pub type Result<T> = std::result::Result<T, SbcError>;

/// Errors raised by the SBC layer.
///
/// Routing and admission failures are not errors: behaviors answer them with
/// a SIP response. These variants cover configuration, persistence and
/// failures bubbling up from the lower layers.
#[derive(Error, Debug)]
pub enum SbcError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Sip(#[from] sbc_sip_core::Error),

    /// The key-value store refused the operation
    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration file: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// No dialog matched a mid-dialog operation
    #[error("Dialog not found: {0}")]
    DialogNotFound(String),

    #[error("SBC is not running")]
    NotRunning,

    #[error("SBC is already running")]
    AlreadyRunning,
}

impl SbcError {
    pub fn store(message: impl Into<String>) -> Self {
        SbcError::Store(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        SbcError::Config(message.into())
    }
}
