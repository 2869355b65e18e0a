//! One bridged request: the server transaction facing the sender and the
//! client transaction the SBC starts toward the target.
//!
//! ```text
//!   UA ──request──▶ [server tx] ─┐                  ┌─▶ [client tx] ──request──▶ far end
//!                                │  B2bTransaction  │
//!   UA ◀─response── [server tx] ◀┘  (CallContext)   └── [client tx] ◀─response── far end
//! ```
//!
//! [`B2bTransaction::run`] walks the request through the handler hooks and
//! starts the client transaction; [`B2bTransaction::relay_responses`] then
//! carries every response back through the response hooks to the server
//! transaction.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use sbc_sip_core::{SipMessage, TransportTable, TransportType, props};
use sbc_transaction_core::{
    ClientEvent, ClientTransaction, ResponseStream, Transaction, TransactionDispatcher,
    TransactionError,
};

use super::handler::{Handler, RouteOutcome};
use super::manager::B2bTransactionManager;
use super::message_type::MessageType;
use crate::context::{CallContext, SharedContext, shared_context};

/// Property naming the address the client request is sent to
pub const TARGET_ADDRESS: &str = "target-address";

pub struct B2bTransaction {
    id: String,
    server_transaction: Arc<Transaction>,
    server_request: RwLock<SipMessage>,
    client_request: RwLock<Option<SipMessage>>,
    client_transaction: RwLock<Option<Arc<Transaction>>>,
    context: SharedContext,
    handler: Handler,
    sdp_handler: Option<Handler>,
    dispatcher: Arc<TransactionDispatcher>,
    created_at: Instant,
}

impl B2bTransaction {
    pub fn new(
        request: SipMessage,
        server_transaction: Arc<Transaction>,
        handler: Handler,
        sdp_handler: Option<Handler>,
        dispatcher: Arc<TransactionDispatcher>,
    ) -> Self {
        B2bTransaction {
            id: server_transaction.key().to_string(),
            server_transaction,
            server_request: RwLock::new(request),
            client_request: RwLock::new(None),
            client_transaction: RwLock::new(None),
            context: shared_context(),
            handler,
            sdp_handler,
            dispatcher,
            created_at: Instant::now(),
        }
    }

    /// Id of the server transaction
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn context(&self) -> &SharedContext {
        &self.context
    }

    /// Snapshot of the shared context
    pub fn context_snapshot(&self) -> CallContext {
        self.context.read().clone()
    }

    /// The request as received on the server side
    pub fn server_request(&self) -> SipMessage {
        self.server_request.read().clone()
    }

    pub fn update_server_request<F>(&self, update: F)
    where
        F: FnOnce(&mut SipMessage),
    {
        update(&mut self.server_request.write());
    }

    /// The request sent on the client side, once routed
    pub fn client_request(&self) -> Option<SipMessage> {
        self.client_request.read().clone()
    }

    pub fn server_transaction(&self) -> &Arc<Transaction> {
        &self.server_transaction
    }

    pub fn client_transaction(&self) -> Option<Arc<Transaction>> {
        self.client_transaction.read().clone()
    }

    pub fn dispatcher(&self) -> &Arc<TransactionDispatcher> {
        &self.dispatcher
    }

    pub fn transports(&self) -> &Arc<TransportTable> {
        self.dispatcher.transports()
    }

    pub fn method(&self) -> String {
        self.server_request.read().method().unwrap_or_default().to_string()
    }

    pub fn call_id(&self) -> Option<String> {
        self.server_request.read().call_id().map(str::to_string)
    }

    /// Interface the request arrived on
    pub fn local_address(&self) -> SocketAddr {
        self.server_transaction.local_addr()
    }

    /// Packet source of the request
    pub fn source_address(&self) -> SocketAddr {
        self.server_request
            .read()
            .source_address()
            .unwrap_or_else(|| self.server_transaction.remote_addr())
    }

    pub fn source_transport(&self) -> TransportType {
        self.server_transaction.transport_type()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    fn body_handler(&self, message: &SipMessage) -> &Handler {
        match (&self.sdp_handler, MessageType::body_type(message)) {
            (Some(sdp), Some(MessageType::Sdp)) => sdp,
            _ => &self.handler,
        }
    }

    /// Where responses on the server side go; resolved once and cached
    pub fn response_target(&self, manager: &B2bTransactionManager) -> SocketAddr {
        if let Some(target) = self.context.read().response_target {
            return target;
        }
        let request = self.server_request();
        let target = manager
            .route_response(&request, self)
            .unwrap_or_else(|| self.source_address());
        self.context.write().response_target = Some(target);
        target
    }

    /// Sends a response on the server transaction
    pub async fn send_upstream(&self, response: SipMessage, manager: &B2bTransactionManager) {
        let target = self.response_target(manager);
        debug!(id = %self.id, start_line = %response.start_line(), %target, "Responding upstream");
        if let Err(e) = self.server_transaction.send_response(response, target).await {
            warn!(id = %self.id, error = %e, "Failed to send response upstream");
        }
    }

    async fn respond(&self, request: &SipMessage, code: u16, reason: &str, manager: &B2bTransactionManager) {
        match request.create_response(code, Some(reason)) {
            Ok(response) => self.send_upstream(response, manager).await,
            Err(e) => warn!(id = %self.id, error = %e, "Cannot build response"),
        }
    }

    /// Runs the request side of the pipeline.
    ///
    /// Returns the client transaction's response stream when the request was
    /// forwarded, `None` when it was answered locally.
    pub async fn run(&self, manager: &B2bTransactionManager) -> Option<ResponseStream> {
        let mut request = self.server_request();
        let created = self.handler.transaction_created(&mut request, self);
        *self.server_request.write() = request.clone();
        if let Some(response) = created {
            self.send_upstream(response, manager).await;
            return None;
        }

        if let Some(response) = manager.authenticate(&mut request, self) {
            self.send_upstream(response, manager).await;
            return None;
        }
        *self.server_request.write() = request.clone();

        let mut client_request = request.clone();
        let (local_interface, target) = match self.handler.route(&mut client_request, self) {
            RouteOutcome::Respond(response) => {
                self.send_upstream(response, manager).await;
                return None;
            }
            RouteOutcome::Local => {
                self.context.write().invoke_local_handler = true;
                match self.handler.invoke_local_handler(&mut client_request, self) {
                    Some(response) => self.send_upstream(response, manager).await,
                    None => self.respond(&request, 500, "No local handler specified", manager).await,
                }
                return None;
            }
            RouteOutcome::Forward { local_interface, target } => (local_interface, target),
        };

        let Some(local_interface) = local_interface.filter(|addr| self.transports().is_local(addr)) else {
            self.respond(&request, 500, "Unable to determine local interface", manager).await;
            return None;
        };

        let generate_local_response = {
            let mut ctx = self.context.write();
            let transport = *ctx.target_transport.get_or_insert(TransportType::Udp);
            client_request.set_property(props::TARGET_TRANSPORT, transport.to_string());
            ctx.local_interface = Some(local_interface);
            ctx.target_address = Some(target);
            ctx.generate_local_response
        };

        if generate_local_response {
            if let Some(mut response) = self.handler.generate_local_response(&request, self) {
                self.handler.process_response_outbound(&mut response, self);
                self.context.write().has_sent_local_response = true;
                self.send_upstream(response, manager).await;
            }
        }

        client_request.set_property(TARGET_ADDRESS, target.to_string());
        client_request.set_property(props::LOCAL_ADDRESS, local_interface.to_string());

        if client_request.has_body() {
            let body_handler = self.body_handler(&client_request).clone();
            if let Some(response) = body_handler.process_request_body(&mut client_request, self) {
                self.send_upstream(response, manager).await;
                return None;
            }
        }

        self.handler.process_outbound(&mut client_request, self);
        *self.client_request.write() = Some(client_request.clone());

        info!(
            id = %self.id,
            method = %client_request.method().unwrap_or_default(),
            local = %local_interface,
            %target,
            "Forwarding request"
        );
        match self.dispatcher.send_request(client_request, local_interface, target).await {
            Ok(ClientTransaction { transaction, responses }) => {
                *self.client_transaction.write() = Some(transaction);
                Some(responses)
            }
            Err(e) => {
                self.on_error(&e, manager).await;
                None
            }
        }
    }

    /// Relays every event of the client transaction until its stream ends
    pub async fn relay_responses(&self, mut responses: ResponseStream, manager: &B2bTransactionManager) {
        while let Some(event) = responses.recv().await {
            match event {
                ClientEvent::Response { response, .. } => self.on_response(response, manager).await,
                ClientEvent::Failed { error, .. } => self.on_error(&error, manager).await,
            }
        }
    }

    async fn on_response(&self, mut response: SipMessage, manager: &B2bTransactionManager) {
        self.handler.process_response_inbound(&mut response, self);
        if self.context.read().has_sent_local_response {
            return;
        }
        // 100 Trying is hop-by-hop
        if response.is_1xx_code(100) {
            return;
        }
        if response.has_property(props::DISALLOW_FORWARD) {
            debug!(id = %self.id, start_line = %response.start_line(), "Response held back");
            return;
        }

        let request = self.server_request();
        let replacement = if response.is_error_response() {
            self.handler.transaction_error(None, Some(&response), self)
        } else {
            None
        };
        let mut upstream = match replacement {
            Some(replacement) => replacement,
            None => match request.reformat_response(&response) {
                Ok(upstream) => upstream,
                Err(e) => {
                    warn!(id = %self.id, error = %e, "Cannot relay response");
                    return;
                }
            },
        };

        if !upstream.is_error_response() && upstream.has_body() {
            let body_handler = self.body_handler(&upstream).clone();
            body_handler.process_response_body(&mut upstream, self);
        }
        let target = self.response_target(manager);
        upstream.set_property(props::RESPONSE_TARGET, target.to_string());
        upstream.set_property(props::RESPONSE_INTERFACE, self.local_address().to_string());
        self.handler.process_response_outbound(&mut upstream, self);
        self.send_upstream(upstream, manager).await;
    }

    async fn on_error(&self, error: &TransactionError, manager: &B2bTransactionManager) {
        warn!(id = %self.id, error = %error, "Client transaction failed");
        let Some(mut response) = self.handler.transaction_error(Some(error), None, self) else {
            return;
        };
        if self.context.read().has_sent_local_response {
            return;
        }
        self.handler.process_response_outbound(&mut response, self);
        self.send_upstream(response, manager).await;
    }
}
