//! # SIP transactions
//!
//! A [`Transaction`] is the handle to one request/response exchange on one
//! leg. The exchange itself is driven by a dedicated task
//! ([`runner`]) that owns the state machine ([`logic`]) and serializes every
//! event for the transaction: outbound sends, inbound messages and timer
//! fires all arrive as commands on one channel.
//!
//! ```text
//!  dispatcher ──Receive──┐
//!  TU ──Send/Terminate───┼──▶ command channel ──▶ runner ──▶ TransactionLogic
//!  timer tasks ──Timer───┘                          │
//!                                                   ├──▶ transport (send)
//!                                                   ├──▶ ClientEvent stream / ACK waiter
//!                                                   └──▶ pool (remove on TERMINATED)
//! ```
//!
//! Client transactions report every response through a [`ResponseStream`].
//! Each transaction reports exactly one terminal event on it: the final
//! response, or a [`TransactionError`]. INVITE client transactions fork: a
//! response carrying a To tag different from the first one seen is handed to
//! a child transaction keyed `<parent>:<tag>` whose events flow into the
//! same stream labelled with the branch tag.

pub(crate) mod logic;
pub(crate) mod runner;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use sbc_sip_core::{SipMessage, TransportType};

use crate::error::{Result, TransactionError};

pub(crate) use runner::Command;

/// Transaction identifier: `method + cseq + (branch | call-id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionKey(String);

impl TransactionKey {
    pub fn new(id: impl Into<String>) -> Self {
        TransactionKey(id.into())
    }

    /// Key of the transaction a message belongs to
    pub fn from_message(message: &SipMessage, method_override: Option<&str>) -> Result<Self> {
        Ok(TransactionKey(message.transaction_id(method_override)?))
    }

    /// Key of the child branch identified by a remote tag
    pub fn child(&self, tag: &str) -> Self {
        TransactionKey(format!("{}:{}", self.0, tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The four RFC 3261 state machine kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    InviteClient,
    InviteServer,
    NonInviteClient,
    NonInviteServer,
}

impl TransactionKind {
    pub fn is_client(&self) -> bool {
        matches!(self, TransactionKind::InviteClient | TransactionKind::NonInviteClient)
    }

    pub fn is_invite(&self) -> bool {
        matches!(self, TransactionKind::InviteClient | TransactionKind::InviteServer)
    }

    /// Server kind for an inbound request method
    pub fn server_for(method: &str) -> Self {
        if method.eq_ignore_ascii_case("INVITE") {
            TransactionKind::InviteServer
        } else {
            TransactionKind::NonInviteServer
        }
    }

    /// Client kind for an outbound request method
    pub fn client_for(method: &str) -> Self {
        if method.eq_ignore_ascii_case("INVITE") {
            TransactionKind::InviteClient
        } else {
            TransactionKind::NonInviteClient
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionKind::InviteClient => "ICT",
            TransactionKind::InviteServer => "IST",
            TransactionKind::NonInviteClient => "NICT",
            TransactionKind::NonInviteServer => "NIST",
        };
        f.write_str(name)
    }
}

/// Transaction states across all four kinds.
///
/// `Trying` doubles as the ICT "calling" state. `Child` is the initial state
/// of a forked branch and behaves like `Trying`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum TransactionState {
    Idle = 0,
    Trying = 1,
    Proceeding = 2,
    Completed = 3,
    Confirmed = 4,
    AckPending = 5,
    Child = 6,
    Terminated = 7,
}

impl TransactionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TransactionState::Idle,
            1 => TransactionState::Trying,
            2 => TransactionState::Proceeding,
            3 => TransactionState::Completed,
            4 => TransactionState::Confirmed,
            5 => TransactionState::AckPending,
            6 => TransactionState::Child,
            _ => TransactionState::Terminated,
        }
    }

    /// A final response has been seen or sent
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            TransactionState::Completed
                | TransactionState::Confirmed
                | TransactionState::AckPending
                | TransactionState::Terminated
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Lock-free mirror of the runner's state for readers outside the runner
#[derive(Debug)]
pub struct AtomicTransactionState(AtomicU8);

impl AtomicTransactionState {
    pub fn new(state: TransactionState) -> Self {
        AtomicTransactionState(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> TransactionState {
        TransactionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: TransactionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// What a client transaction reports to its user
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A provisional or final response; `branch` is the remote tag of a forked child
    Response {
        response: SipMessage,
        branch: Option<String>,
    },
    /// The exchange ended without a final response
    Failed {
        error: TransactionError,
        branch: Option<String>,
    },
}

impl ClientEvent {
    /// True for events that end a transaction's exchange
    pub fn is_terminal(&self) -> bool {
        match self {
            ClientEvent::Response { response, .. } => response.is_final_response(),
            ClientEvent::Failed { .. } => true,
        }
    }

    pub fn branch(&self) -> Option<&str> {
        match self {
            ClientEvent::Response { branch, .. } | ClientEvent::Failed { branch, .. } => {
                branch.as_deref()
            }
        }
    }
}

/// Responses for a client transaction and all of its forked children.
///
/// The stream ends once the transaction and every child have terminated.
#[derive(Debug)]
pub struct ResponseStream {
    rx: mpsc::UnboundedReceiver<ClientEvent>,
}

impl ResponseStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<ClientEvent>) -> Self {
        ResponseStream { rx }
    }

    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.rx.recv().await
    }

    /// Skips provisional responses and resolves with the first terminal event
    pub async fn wait(mut self) -> Result<SipMessage> {
        while let Some(event) = self.rx.recv().await {
            match event {
                ClientEvent::Response { response, .. } if response.is_final_response() => return Ok(response),
                ClientEvent::Response { .. } => {}
                ClientEvent::Failed { error, .. } => return Err(error),
            }
        }
        Err(TransactionError::StreamClosed)
    }
}

/// Completion of an INVITE server transaction's wait for the ACK to an error response
#[derive(Debug)]
pub struct AckWaiter {
    key: TransactionKey,
    rx: oneshot::Receiver<Result<SipMessage>>,
}

impl AckWaiter {
    /// Resolves with the ACK, or with a timeout error once Timer H fires
    pub async fn wait(self) -> Result<SipMessage> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(TransactionError::Terminated { key: self.key }),
        }
    }
}

/// Handle to a live transaction
#[derive(Debug)]
pub struct Transaction {
    key: TransactionKey,
    kind: TransactionKind,
    parent: Option<TransactionKey>,
    log_id: String,
    request: SipMessage,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    transport_type: TransportType,
    state: Arc<AtomicTransactionState>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    children: Mutex<HashMap<String, TransactionKey>>,
    remote_tag: Mutex<Option<String>>,
    events: Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
}

impl Transaction {
    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn state(&self) -> TransactionState {
        self.state.load()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == TransactionState::Terminated
    }

    /// False for forked children
    pub fn is_parent(&self) -> bool {
        self.parent.is_none()
    }

    pub fn parent_key(&self) -> Option<&TransactionKey> {
        self.parent.as_ref()
    }

    pub fn log_id(&self) -> &str {
        &self.log_id
    }

    /// The request that started the transaction
    pub fn request(&self) -> &SipMessage {
        &self.request
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Request target for clients, packet source for servers
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    /// Remote tag of the first tagged response seen by this transaction
    pub fn remote_tag(&self) -> Option<String> {
        self.remote_tag.lock().clone()
    }

    /// Child registered for a remote tag
    pub fn find_branch(&self, tag: &str) -> Option<TransactionKey> {
        self.children.lock().get(tag).cloned()
    }

    /// Keys of every child branch
    pub fn branches(&self) -> Vec<TransactionKey> {
        self.children.lock().values().cloned().collect()
    }

    /// Sends a response on a server transaction
    pub async fn send_response(&self, response: SipMessage, target: SocketAddr) -> Result<()> {
        self.send(response, Some(target), None).await
    }

    /// Sends a response on an INVITE server transaction and registers for its ACK
    pub async fn send_response_expect_ack(
        &self,
        response: SipMessage,
        target: SocketAddr,
    ) -> Result<AckWaiter> {
        let (tx, rx) = oneshot::channel();
        self.send(response, Some(target), Some(tx)).await?;
        Ok(AckWaiter { key: self.key.clone(), rx })
    }

    /// Sends the ACK for a 2xx received by an INVITE client transaction.
    ///
    /// A transaction kept alive in ACK_PENDING stores the ACK and re-sends it
    /// for every retransmitted 2xx until Timer D fires.
    pub async fn send_ack_for_2xx(&self, ack: SipMessage, dialog_target: SocketAddr) -> Result<()> {
        if self.kind != TransactionKind::InviteClient {
            return Err(TransactionError::InvalidState {
                key: self.key.clone(),
                message: "ACK for 2xx on a non-INVITE client transaction".to_string(),
            });
        }
        let (reply, rx) = oneshot::channel();
        self.command(Command::SendAckFor2xx { ack, target: dialog_target, reply })?;
        rx.await
            .map_err(|_| TransactionError::AlreadyTerminated(self.key.clone()))?
    }

    /// Moves the transaction to TERMINATED and removes it from the pool.
    ///
    /// A second call fails with [`TransactionError::AlreadyTerminated`].
    pub async fn terminate(&self) -> Result<()> {
        if self.is_terminated() {
            return Err(TransactionError::AlreadyTerminated(self.key.clone()));
        }
        let (reply, rx) = oneshot::channel();
        self.command(Command::Terminate { reply })?;
        rx.await
            .map_err(|_| TransactionError::AlreadyTerminated(self.key.clone()))?
    }

    pub(crate) async fn send(
        &self,
        message: SipMessage,
        destination: Option<SocketAddr>,
        ack_waiter: Option<oneshot::Sender<Result<SipMessage>>>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send { message, destination, ack_waiter, reply })?;
        rx.await
            .map_err(|_| TransactionError::AlreadyTerminated(self.key.clone()))?
    }

    /// Feeds an inbound message into the state machine
    pub(crate) fn receive(&self, message: SipMessage, source: SocketAddr) -> Result<()> {
        self.command(Command::Receive { message, source })
    }

    pub(crate) fn settle_branch(&self) {
        let _ = self.command(Command::BranchFinal);
    }

    pub(crate) fn set_remote_tag_if_unset(&self, tag: &str) -> Option<String> {
        let mut remote = self.remote_tag.lock();
        match remote.as_ref() {
            Some(existing) => Some(existing.clone()),
            None => {
                *remote = Some(tag.to_string());
                None
            }
        }
    }

    pub(crate) fn add_branch(&self, tag: &str, key: TransactionKey) {
        self.children.lock().insert(tag.to_string(), key);
    }

    pub(crate) fn event_sender(&self) -> Option<mpsc::UnboundedSender<ClientEvent>> {
        self.events.lock().clone()
    }

    pub(crate) fn release_event_sender(&self) {
        self.events.lock().take();
    }

    fn command(&self, command: Command) -> Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| TransactionError::AlreadyTerminated(self.key.clone()))
    }
}
