//! B2B transaction layer
//!
//! Pairs each server transaction with the client transaction that carries
//! the request onto the other leg, and calls the method's [`Handler`] at the
//! fixed points of that pairing.

pub mod handler;
pub mod manager;
pub mod message_type;
pub mod transaction;
pub mod worker;

pub use handler::{Handler, RouteOutcome};
pub use manager::{B2bTransactionManager, ManagerConfig, ManagerStats};
pub use message_type::MessageType;
pub use transaction::{B2bTransaction, TARGET_ADDRESS};
pub use worker::WorkerPool;
