//! Handler slots
//!
//! A [`Handler`] is a set of optional hooks the B2B pipeline calls at fixed
//! points of a transaction's life. An empty slot behaves as a no-op (see the
//! invocation methods for what "no-op" means per hook), so a per-method
//! handler is usually the default handler with a few slots replaced:
//!
//! ```ignore
//! let services = services.clone();
//! let invite = behavior::default::handler(&services, MessageType::Invite)
//!     .on_route(move |request, b2b| my_route(&services, request, b2b));
//! manager.register_handler(invite);
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use sbc_sip_core::SipMessage;
use sbc_transaction_core::TransactionError;

use super::message_type::MessageType;
use super::transaction::B2bTransaction;

/// Result of routing a request
#[derive(Debug, Clone)]
pub enum RouteOutcome {
    /// Send the (rewritten) request to `target` from `local_interface`
    Forward {
        local_interface: Option<SocketAddr>,
        target: SocketAddr,
    },
    /// Answer the request with this response instead
    Respond(SipMessage),
    /// Hand the request to the local handler
    Local,
}

type RequestHook = Arc<dyn Fn(&mut SipMessage, &B2bTransaction) -> Option<SipMessage> + Send + Sync>;
type RouteHook = Arc<dyn Fn(&mut SipMessage, &B2bTransaction) -> RouteOutcome + Send + Sync>;
type RouteResponseHook = Arc<dyn Fn(&SipMessage, &B2bTransaction) -> Option<SocketAddr> + Send + Sync>;
type LocalResponseHook = Arc<dyn Fn(&SipMessage, &B2bTransaction) -> Option<SipMessage> + Send + Sync>;
type MutateHook = Arc<dyn Fn(&mut SipMessage, &B2bTransaction) + Send + Sync>;
type ErrorHook = Arc<
    dyn Fn(Option<&TransactionError>, Option<&SipMessage>, &B2bTransaction) -> Option<SipMessage>
        + Send
        + Sync,
>;
type LifecycleHook = Arc<dyn Fn(&B2bTransaction) + Send + Sync>;
type OrphanHook = Arc<dyn Fn(SipMessage) + Send + Sync>;

#[derive(Clone)]
pub struct Handler {
    message_type: MessageType,
    transaction_created: Option<RequestHook>,
    authenticate: Option<RequestHook>,
    route: Option<RouteHook>,
    route_response: Option<RouteResponseHook>,
    invoke_local_handler: Option<RequestHook>,
    generate_local_response: Option<LocalResponseHook>,
    process_request_body: Option<RequestHook>,
    process_response_body: Option<MutateHook>,
    process_outbound: Option<MutateHook>,
    process_response_inbound: Option<MutateHook>,
    process_response_outbound: Option<MutateHook>,
    transaction_error: Option<ErrorHook>,
    destroy: Option<LifecycleHook>,
    ack_for_2xx: Option<OrphanHook>,
    stray_response: Option<OrphanHook>,
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("message_type", &self.message_type)
            .field("route", &self.route.is_some())
            .field("transaction_error", &self.transaction_error.is_some())
            .finish_non_exhaustive()
    }
}

impl Handler {
    /// A handler with every slot empty
    pub fn new(message_type: MessageType) -> Self {
        Handler {
            message_type,
            transaction_created: None,
            authenticate: None,
            route: None,
            route_response: None,
            invoke_local_handler: None,
            generate_local_response: None,
            process_request_body: None,
            process_response_body: None,
            process_outbound: None,
            process_response_inbound: None,
            process_response_outbound: None,
            transaction_error: None,
            destroy: None,
            ack_for_2xx: None,
            stray_response: None,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Same slots, registered under another type
    pub fn for_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn on_transaction_created<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut SipMessage, &B2bTransaction) -> Option<SipMessage> + Send + Sync + 'static,
    {
        self.transaction_created = Some(Arc::new(f));
        self
    }

    pub fn on_authenticate<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut SipMessage, &B2bTransaction) -> Option<SipMessage> + Send + Sync + 'static,
    {
        self.authenticate = Some(Arc::new(f));
        self
    }

    pub fn on_route<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut SipMessage, &B2bTransaction) -> RouteOutcome + Send + Sync + 'static,
    {
        self.route = Some(Arc::new(f));
        self
    }

    pub fn on_route_response<F>(mut self, f: F) -> Self
    where
        F: Fn(&SipMessage, &B2bTransaction) -> Option<SocketAddr> + Send + Sync + 'static,
    {
        self.route_response = Some(Arc::new(f));
        self
    }

    pub fn on_invoke_local_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut SipMessage, &B2bTransaction) -> Option<SipMessage> + Send + Sync + 'static,
    {
        self.invoke_local_handler = Some(Arc::new(f));
        self
    }

    pub fn on_generate_local_response<F>(mut self, f: F) -> Self
    where
        F: Fn(&SipMessage, &B2bTransaction) -> Option<SipMessage> + Send + Sync + 'static,
    {
        self.generate_local_response = Some(Arc::new(f));
        self
    }

    pub fn on_process_request_body<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut SipMessage, &B2bTransaction) -> Option<SipMessage> + Send + Sync + 'static,
    {
        self.process_request_body = Some(Arc::new(f));
        self
    }

    pub fn on_process_response_body<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut SipMessage, &B2bTransaction) + Send + Sync + 'static,
    {
        self.process_response_body = Some(Arc::new(f));
        self
    }

    pub fn on_process_outbound<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut SipMessage, &B2bTransaction) + Send + Sync + 'static,
    {
        self.process_outbound = Some(Arc::new(f));
        self
    }

    pub fn on_process_response_inbound<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut SipMessage, &B2bTransaction) + Send + Sync + 'static,
    {
        self.process_response_inbound = Some(Arc::new(f));
        self
    }

    pub fn on_process_response_outbound<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut SipMessage, &B2bTransaction) + Send + Sync + 'static,
    {
        self.process_response_outbound = Some(Arc::new(f));
        self
    }

    pub fn on_transaction_error<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&TransactionError>, Option<&SipMessage>, &B2bTransaction) -> Option<SipMessage>
            + Send
            + Sync
            + 'static,
    {
        self.transaction_error = Some(Arc::new(f));
        self
    }

    pub fn on_destroy<F>(mut self, f: F) -> Self
    where
        F: Fn(&B2bTransaction) + Send + Sync + 'static,
    {
        self.destroy = Some(Arc::new(f));
        self
    }

    pub fn on_ack_for_2xx<F>(mut self, f: F) -> Self
    where
        F: Fn(SipMessage) + Send + Sync + 'static,
    {
        self.ack_for_2xx = Some(Arc::new(f));
        self
    }

    pub fn on_stray_response<F>(mut self, f: F) -> Self
    where
        F: Fn(SipMessage) + Send + Sync + 'static,
    {
        self.stray_response = Some(Arc::new(f));
        self
    }

    /// A response here ends the transaction before routing
    pub fn transaction_created(&self, request: &mut SipMessage, b2b: &B2bTransaction) -> Option<SipMessage> {
        self.transaction_created.as_ref().and_then(|f| f(request, b2b))
    }

    /// A response here (typically 401/407) ends the transaction
    pub fn authenticate(&self, request: &mut SipMessage, b2b: &B2bTransaction) -> Option<SipMessage> {
        self.authenticate.as_ref().and_then(|f| f(request, b2b))
    }

    /// Without a route hook every request is answered 500
    pub fn route(&self, request: &mut SipMessage, b2b: &B2bTransaction) -> RouteOutcome {
        match &self.route {
            Some(f) => f(request, b2b),
            None => match request.create_response(500, Some("No Route Handler")) {
                Ok(response) => RouteOutcome::Respond(response),
                Err(_) => RouteOutcome::Local,
            },
        }
    }

    pub fn has_route_response(&self) -> bool {
        self.route_response.is_some()
    }

    pub fn route_response(&self, request: &SipMessage, b2b: &B2bTransaction) -> Option<SocketAddr> {
        self.route_response.as_ref().and_then(|f| f(request, b2b))
    }

    pub fn invoke_local_handler(&self, request: &mut SipMessage, b2b: &B2bTransaction) -> Option<SipMessage> {
        self.invoke_local_handler.as_ref().and_then(|f| f(request, b2b))
    }

    /// Defaults to a plain 200
    pub fn generate_local_response(&self, request: &SipMessage, b2b: &B2bTransaction) -> Option<SipMessage> {
        match &self.generate_local_response {
            Some(f) => f(request, b2b),
            None => request.create_response(200, None).ok(),
        }
    }

    pub fn process_request_body(&self, request: &mut SipMessage, b2b: &B2bTransaction) -> Option<SipMessage> {
        self.process_request_body.as_ref().and_then(|f| f(request, b2b))
    }

    pub fn process_response_body(&self, response: &mut SipMessage, b2b: &B2bTransaction) {
        if let Some(f) = &self.process_response_body {
            f(response, b2b);
        }
    }

    pub fn process_outbound(&self, request: &mut SipMessage, b2b: &B2bTransaction) {
        if let Some(f) = &self.process_outbound {
            f(request, b2b);
        }
    }

    pub fn process_response_inbound(&self, response: &mut SipMessage, b2b: &B2bTransaction) {
        if let Some(f) = &self.process_response_inbound {
            f(response, b2b);
        }
    }

    pub fn process_response_outbound(&self, response: &mut SipMessage, b2b: &B2bTransaction) {
        if let Some(f) = &self.process_response_outbound {
            f(response, b2b);
        }
    }

    /// Response to send upstream after a failure, if any
    pub fn transaction_error(
        &self,
        error: Option<&TransactionError>,
        response: Option<&SipMessage>,
        b2b: &B2bTransaction,
    ) -> Option<SipMessage> {
        self.transaction_error.as_ref().and_then(|f| f(error, response, b2b))
    }

    pub fn destroy(&self, b2b: &B2bTransaction) {
        if let Some(f) = &self.destroy {
            f(b2b);
        }
    }

    /// Returns false when the slot is empty and the ACK was not consumed
    pub fn ack_for_2xx(&self, ack: SipMessage) -> bool {
        match &self.ack_for_2xx {
            Some(f) => {
                f(ack);
                true
            }
            None => false,
        }
    }

    pub fn stray_response(&self, response: SipMessage) -> bool {
        match &self.stray_response {
            Some(f) => {
                f(response);
                true
            }
            None => false,
        }
    }
}
