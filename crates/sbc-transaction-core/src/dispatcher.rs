//! Entry point from the transport layer into the transaction layer.
//!
//! [`TransactionDispatcher`] matches inbound messages to live transactions by
//! id, creates server transactions for new requests, forks INVITE client
//! transactions on differing To tags, and starts client transactions for the
//! transaction user. Messages that belong to no transaction (ACKs for 2xx and
//! stray responses) go straight to the [`TransactionUser`].

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use sbc_sip_core::{SipMessage, TransportEvent, TransportTable, props};

use crate::error::{Result, TransactionError};
use crate::pool::TransactionPool;
use crate::timer::TimerSettings;
use crate::transaction::runner::{TransactionConfig, spawn_transaction};
use crate::transaction::{
    ResponseStream, Transaction, TransactionKey, TransactionKind,
};

/// The layer above the transactions: receives new requests and orphan messages
#[async_trait]
pub trait TransactionUser: Send + Sync {
    /// A new request created a server transaction
    async fn on_request(&self, request: SipMessage, transaction: Arc<Transaction>);

    /// An ACK that matched no INVITE server transaction (the ACK for a 2xx)
    async fn on_ack_for_2xx(&self, ack: SipMessage) {
        trace!(call_id = ?ack.call_id(), "Dropping ACK for 2xx");
    }

    /// A response that matched no client transaction
    async fn on_stray_response(&self, response: SipMessage) {
        trace!(start_line = %response.start_line(), "Dropping stray response");
    }
}

/// Stateless sending, for messages outside any transaction
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_direct(&self, message: &SipMessage, local: SocketAddr, target: SocketAddr) -> Result<()>;
}

/// A started client transaction and the stream of its responses
#[derive(Debug)]
pub struct ClientTransaction {
    pub transaction: Arc<Transaction>,
    pub responses: ResponseStream,
}

pub struct TransactionDispatcher {
    pool: Arc<TransactionPool>,
    transports: Arc<TransportTable>,
    settings: TimerSettings,
    user: RwLock<Option<Weak<dyn TransactionUser>>>,
}

impl TransactionDispatcher {
    pub fn new(transports: Arc<TransportTable>, settings: TimerSettings) -> Arc<Self> {
        Arc::new(TransactionDispatcher {
            pool: Arc::new(TransactionPool::new()),
            transports,
            settings,
            user: RwLock::new(None),
        })
    }

    /// Installs the transaction user; held weakly to avoid a reference cycle
    pub fn set_transaction_user(&self, user: Weak<dyn TransactionUser>) {
        *self.user.write() = Some(user);
    }

    pub fn pool(&self) -> &Arc<TransactionPool> {
        &self.pool
    }

    pub fn transports(&self) -> &Arc<TransportTable> {
        &self.transports
    }

    pub fn settings(&self) -> &TimerSettings {
        &self.settings
    }

    fn user(&self) -> Option<Arc<dyn TransactionUser>> {
        self.user.read().as_ref().and_then(Weak::upgrade)
    }

    /// Feeds one transport event into the transaction layer
    pub async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::MessageReceived { message, source, destination } => {
                if let Err(e) = self.on_message(message, source, destination).await {
                    debug!(%source, error = %e, "Dropping inbound message");
                }
            }
            TransportEvent::Error { error } => warn!(error = %error, "Transport error"),
            TransportEvent::Closed => info!("Transport closed"),
        }
    }

    /// Routes an inbound message to its transaction
    pub async fn on_message(&self, mut message: SipMessage, source: SocketAddr, local: SocketAddr) -> Result<()> {
        let transport = self.transports.require(&local)?;
        message.set_property(props::SOURCE_ADDRESS, source.to_string());
        message.set_property(props::LOCAL_ADDRESS, local.to_string());
        message.set_property(props::SOURCE_TRANSPORT, transport.transport_type().to_string());

        if message.is_response() {
            return self.on_response(message, source).await;
        }
        if !message.is_request() {
            return Err(TransactionError::InvalidMessage(message.start_line().to_string()));
        }

        let key = TransactionKey::from_message(&message, None)?;
        if message.is_request_method("ACK") {
            match self.pool.find(&key) {
                Some(transaction) if transaction.kind() == TransactionKind::InviteServer => {
                    transaction.receive(message, source)?;
                }
                _ => {
                    if let Some(user) = self.user() {
                        user.on_ack_for_2xx(message).await;
                    }
                }
            }
            return Ok(());
        }

        if self.pool.is_blocked(&key) {
            debug!(id = %key, "Ignoring retransmission of a completed INVITE");
            return Ok(());
        }

        let method = message.method().unwrap_or_default().to_string();
        let user = self.user.read().clone();
        let (transaction, created) = self.pool.find_or_insert_with(&key, || {
            spawn_transaction(
                TransactionConfig {
                    key: key.clone(),
                    kind: TransactionKind::server_for(&method),
                    parent: None,
                    request: message.clone(),
                    local_addr: local,
                    remote_addr: source,
                    transport_type: transport.transport_type(),
                    settings: self.settings.clone(),
                    will_send_ack_for_2xx: false,
                    events: None,
                    user,
                },
                self.transports.clone(),
                self.pool.clone(),
            )
        });
        if created {
            debug!(id = %key, kind = %transaction.kind(), %source, "Created server transaction");
        }
        transaction.receive(message, source)
    }

    async fn on_response(&self, response: SipMessage, source: SocketAddr) -> Result<()> {
        let key = TransactionKey::from_message(&response, None)?;
        let Some(transaction) = self.pool.find(&key) else {
            if let Some(user) = self.user() {
                user.on_stray_response(response).await;
            }
            return Ok(());
        };

        if transaction.kind() == TransactionKind::InviteClient {
            if let Some(tag) = response.to_tag() {
                if let Some(first) = transaction.set_remote_tag_if_unset(&tag) {
                    if first != tag {
                        let child = self.find_or_create_child(&transaction, &tag);
                        return child.receive(response, source);
                    }
                }
            }
        }
        transaction.receive(response, source)
    }

    /// Child branch of an INVITE client transaction for a remote tag.
    ///
    /// Returns the existing child when the tag has been seen before.
    pub fn find_or_create_child(&self, parent: &Arc<Transaction>, tag: &str) -> Arc<Transaction> {
        let child_key = parent.key().child(tag);
        let (child, created) = self.pool.find_or_insert_with(&child_key, || {
            spawn_transaction(
                TransactionConfig {
                    key: child_key.clone(),
                    kind: TransactionKind::InviteClient,
                    parent: Some(parent.key().clone()),
                    request: parent.request().clone(),
                    local_addr: parent.local_addr(),
                    remote_addr: parent.remote_addr(),
                    transport_type: parent.transport_type(),
                    settings: self.settings.clone(),
                    will_send_ack_for_2xx: false,
                    events: parent.event_sender(),
                    user: None,
                },
                self.transports.clone(),
                self.pool.clone(),
            )
        });
        if created {
            parent.add_branch(tag, child_key.clone());
            debug!(parent = %parent.key(), child = %child_key, "Forked client transaction");
            if parent.state().is_completed() {
                child.settle_branch();
            }
        }
        child
    }

    /// Starts a client transaction for `request`
    pub async fn send_request(&self, request: SipMessage, local: SocketAddr, remote: SocketAddr) -> Result<ClientTransaction> {
        self.send_request_with(request, local, remote, false).await
    }

    /// Starts a client transaction; `will_send_ack_for_2xx` keeps an INVITE
    /// client alive after a 2xx to absorb retransmissions
    pub async fn send_request_with(
        &self,
        request: SipMessage,
        local: SocketAddr,
        remote: SocketAddr,
        will_send_ack_for_2xx: bool,
    ) -> Result<ClientTransaction> {
        if request.is_request_method("ACK") {
            return Err(TransactionError::InvalidMessage(
                "ACK is sent outside a transaction".to_string(),
            ));
        }
        let method = request
            .method()
            .ok_or_else(|| TransactionError::InvalidMessage(request.start_line().to_string()))?
            .to_string();
        let transport = self.transports.require(&local)?;
        let key = TransactionKey::from_message(&request, None)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let transaction = spawn_transaction(
            TransactionConfig {
                key: key.clone(),
                kind: TransactionKind::client_for(&method),
                parent: None,
                request: request.clone(),
                local_addr: local,
                remote_addr: remote,
                transport_type: transport.transport_type(),
                settings: self.settings.clone(),
                will_send_ack_for_2xx,
                events: Some(events_tx),
                user: None,
            },
            self.transports.clone(),
            self.pool.clone(),
        );
        self.pool.insert(transaction.clone());
        debug!(id = %key, kind = %transaction.kind(), %remote, "Created client transaction");

        if let Err(e) = transaction.send(request, None, None).await {
            let _ = transaction.terminate().await;
            return Err(e);
        }
        Ok(ClientTransaction { transaction, responses: ResponseStream::new(events_rx) })
    }

    /// Terminates every live transaction
    pub async fn stop(&self) {
        self.pool.terminate_all().await;
    }
}

#[async_trait]
impl MessageSender for TransactionDispatcher {
    async fn send_direct(&self, message: &SipMessage, local: SocketAddr, target: SocketAddr) -> Result<()> {
        trace!(%local, %target, start_line = %message.start_line(), "Sending stateless");
        self.transports
            .send(local, message, target)
            .await
            .map_err(TransactionError::from)
    }
}
