use thiserror::Error;

use crate::transaction::TransactionKey;

/// A type alias for handling `Result`s with `TransactionError`
pub type Result<T> = std::result::Result<T, TransactionError>;

/// Errors raised by the transaction layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransactionError {
    /// No final response (or no ACK) arrived within the timer envelope
    #[error("Transaction {key} timed out")]
    Timeout { key: TransactionKey },

    /// The transport refused the message
    #[error("Transport error on {key}: {message}")]
    Transport { key: TransactionKey, message: String },

    /// A state change was attempted after TERMINATED
    #[error("Transaction {0} already terminated")]
    AlreadyTerminated(TransactionKey),

    /// The transaction was terminated before the exchange completed
    #[error("Transaction {key} terminated before completion")]
    Terminated { key: TransactionKey },

    /// The operation is not valid in the current state
    #[error("Invalid state for {key}: {message}")]
    InvalidState { key: TransactionKey, message: String },

    /// The message cannot start or continue a transaction
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Every event sender is gone and no terminal event was seen
    #[error("Response stream closed before a final response")]
    StreamClosed,

    #[error(transparent)]
    Sip(#[from] sbc_sip_core::Error),
}

impl TransactionError {
    /// True for the distinguished timeout kind
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransactionError::Timeout { .. })
    }

    pub fn is_transport_error(&self) -> bool {
        match self {
            TransactionError::Transport { .. } => true,
            TransactionError::Sip(e) => e.is_transport_error(),
            _ => false,
        }
    }
}
