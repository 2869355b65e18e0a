use std::net::SocketAddr;

use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the message model and the transport seam
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The text could not be read as a SIP message
    #[error("Parse error: {0}")]
    Parse(String),

    /// A header required by the operation is absent
    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    /// A header is present but its value cannot be interpreted
    #[error("Invalid {name} header: {value}")]
    InvalidHeader { name: &'static str, value: String },

    /// The operation only applies to requests
    #[error("Message is not a request")]
    NotARequest,

    /// The operation only applies to responses
    #[error("Message is not a response")]
    NotAResponse,

    /// A URI could not be parsed
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// The transport has been closed
    #[error("Transport closed")]
    TransportClosed,

    /// No transport is bound to the given local address
    #[error("No transport bound to {0}")]
    NoTransport(SocketAddr),

    /// Sending on the transport failed
    #[error("Transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Returns true for failures that come from the transport rather than the message
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Error::TransportClosed | Error::NoTransport(_) | Error::Transport(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
