//! # SIP message model and transport seam
//!
//! This crate holds the pieces of SIP the SBC core consumes rather than
//! implements:
//!
//! - [`message`]: a mutable request/response with ordered headers, a body and
//!   a per-message property bag, plus response construction helpers.
//! - [`header`]: interpretation of the header values the core reads
//!   (`Via`, `CSeq`, URIs, dialog tags).
//! - [`transport`]: the [`Transport`] trait and the [`TransportTable`] of
//!   bound listeners.
//!
//! With the `testing` feature the [`testing`] module provides an in-memory
//! transport that records what it sends.

pub mod error;
pub mod header;
pub mod message;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{Error, Result};
pub use header::{CSeq, SipUri, Via};
pub use message::{Header, PropertyMap, SipMessage, props};
pub use transport::{Transport, TransportEvent, TransportTable, TransportType};
