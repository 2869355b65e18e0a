//! # RFC 3261 transaction layer for the SBC core
//!
//! This crate drives the four SIP transaction state machines (INVITE client,
//! INVITE server, non-INVITE client, non-INVITE server), keeps every live
//! transaction in a [`TransactionPool`], and routes inbound messages to them
//! through the [`TransactionDispatcher`].
//!
//! ```text
//!   transport ──▶ TransactionDispatcher ──▶ TransactionPool ──▶ Transaction (runner task)
//!                        │                                          │
//!                        └──▶ TransactionUser ◀── new requests ─────┘
//! ```
//!
//! The pool is an explicitly owned object handed to whoever needs it; there
//! is no process-wide registry. Client transactions report through a
//! [`ResponseStream`] that delivers exactly one terminal event per
//! transaction.

pub mod dispatcher;
pub mod error;
pub mod pool;
pub mod timer;
pub mod transaction;

pub use dispatcher::{ClientTransaction, MessageSender, TransactionDispatcher, TransactionUser};
pub use error::{Result, TransactionError};
pub use pool::TransactionPool;
pub use timer::{TimerSettings, TimerType};
pub use transaction::{
    AckWaiter, ClientEvent, ResponseStream, Transaction, TransactionKey, TransactionKind,
    TransactionState,
};
