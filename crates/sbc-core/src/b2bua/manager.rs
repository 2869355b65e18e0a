//! B2B transaction manager
//!
//! The manager is the transaction user of the dispatcher: every new server
//! transaction becomes a [`B2bTransaction`] bound to the handler registered
//! for its message type, and the transaction's pipeline is scheduled on the
//! worker pool. When the pool is exhausted the pipeline runs on the calling
//! task instead of being dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use sbc_sip_core::SipMessage;
use sbc_sip_core::header::names;
use sbc_transaction_core::{Transaction, TransactionDispatcher, TransactionUser};

use super::handler::Handler;
use super::message_type::MessageType;
use super::transaction::B2bTransaction;
use super::worker::WorkerPool;
use crate::disconnect::{CallTimers, DisconnectPolicy};

const DEFAULT_MAX_FORWARDS: u32 = 70;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub pool_size: usize,
    /// Answer to the packet source instead of consulting the handlers
    pub use_source_address: bool,
    pub disconnect: Option<DisconnectPolicy>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            pool_size: 64,
            use_source_address: false,
            disconnect: None,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    dispatched: AtomicU64,
    inline: AtomicU64,
    delayed_disconnects: AtomicU64,
}

/// Point-in-time copy of the manager's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub created: u64,
    pub dispatched: u64,
    /// Pipelines that ran on the calling task because the pool was full
    pub inline: u64,
    pub delayed_disconnects: u64,
    pub active: u64,
}

pub struct B2bTransactionManager {
    dispatcher: Arc<TransactionDispatcher>,
    handlers: RwLock<HashMap<MessageType, Handler>>,
    workers: WorkerPool,
    disconnect: Option<DisconnectPolicy>,
    call_timers: Arc<CallTimers>,
    active: DashMap<String, Arc<B2bTransaction>>,
    counters: Counters,
    use_source_address: bool,
    weak_self: Weak<Self>,
}

impl B2bTransactionManager {
    pub fn new(
        dispatcher: Arc<TransactionDispatcher>,
        config: ManagerConfig,
        call_timers: Arc<CallTimers>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| B2bTransactionManager {
            dispatcher,
            handlers: RwLock::new(HashMap::new()),
            workers: WorkerPool::new(config.pool_size),
            disconnect: config.disconnect,
            call_timers,
            active: DashMap::new(),
            counters: Counters::default(),
            use_source_address: config.use_source_address,
            weak_self: weak_self.clone(),
        })
    }

    pub fn dispatcher(&self) -> &Arc<TransactionDispatcher> {
        &self.dispatcher
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    pub fn call_timers(&self) -> &Arc<CallTimers> {
        &self.call_timers
    }

    pub fn disconnect_policy(&self) -> Option<DisconnectPolicy> {
        self.disconnect
    }

    /// Registers `handler` for its message type, returning the one it replaces
    pub fn register_handler(&self, handler: Handler) -> Option<Handler> {
        let message_type = handler.message_type();
        let previous = self.handlers.write().insert(message_type, handler);
        if previous.is_some() {
            warn!(%message_type, "Replacing registered handler");
        } else {
            debug!(%message_type, "Registered handler");
        }
        previous
    }

    pub fn handler(&self, message_type: MessageType) -> Option<Handler> {
        self.handlers.read().get(&message_type).cloned()
    }

    /// Handler for a message, falling back to the `Any` handler
    pub fn handler_for(&self, message: &SipMessage) -> Option<Handler> {
        let handlers = self.handlers.read();
        handlers
            .get(&MessageType::of(message))
            .or_else(|| handlers.get(&MessageType::Any))
            .cloned()
    }

    pub fn sdp_handler(&self) -> Option<Handler> {
        self.handler(MessageType::Sdp)
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            created: self.counters.created.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            inline: self.counters.inline.load(Ordering::Relaxed),
            delayed_disconnects: self.counters.delayed_disconnects.load(Ordering::Relaxed),
            active: self.active.len() as u64,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn find_active(&self, id: &str) -> Option<Arc<B2bTransaction>> {
        self.active.get(id).map(|b2b| b2b.clone())
    }

    /// Max-Forwards check followed by the handler's authentication hook
    pub fn authenticate(&self, request: &mut SipMessage, b2b: &B2bTransaction) -> Option<SipMessage> {
        let max_forwards = request.max_forwards().unwrap_or(DEFAULT_MAX_FORWARDS);
        if max_forwards == 0 {
            return request.create_response(483, Some("Too Many Hops")).ok();
        }
        request.set_header(names::MAX_FORWARDS, (max_forwards - 1).to_string());
        b2b.handler().authenticate(request, b2b)
    }

    /// Destination for responses to `request`
    pub fn route_response(&self, request: &SipMessage, b2b: &B2bTransaction) -> Option<SocketAddr> {
        if self.use_source_address || b2b.source_transport().is_reliable() {
            return Some(b2b.source_address());
        }
        b2b.handler().route_response(request, b2b)
    }

    /// Schedules a transaction's pipeline.
    ///
    /// A BYE for a call younger than the disconnect policy's minimum connect
    /// time is held back for the yield time. Everything else goes to the
    /// worker pool, or runs inline when the pool is full.
    pub async fn on_dispatch(&self, b2b: Arc<B2bTransaction>) {
        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        if let Some(delay) = self.disconnect_delay(&b2b) {
            self.counters.delayed_disconnects.fetch_add(1, Ordering::Relaxed);
            info!(id = %b2b.id(), delay_ms = delay.as_millis() as u64, "Delaying early disconnect");
            self.workers.spawn_after(delay, Self::execute(manager, b2b));
            return;
        }

        if let Err(task) = self.workers.try_spawn(Self::execute(manager, b2b)) {
            self.counters.inline.fetch_add(1, Ordering::Relaxed);
            warn!(size = self.workers.size(), "Worker pool exhausted, running transaction inline");
            task.await;
        }
    }

    fn disconnect_delay(&self, b2b: &B2bTransaction) -> Option<std::time::Duration> {
        let policy = self.disconnect?;
        if !b2b.method().eq_ignore_ascii_case("BYE") {
            return None;
        }
        let call_id = b2b.call_id()?;
        policy.delay_for(self.call_timers.call_duration(&call_id))
    }

    async fn execute(manager: Arc<Self>, b2b: Arc<B2bTransaction>) {
        match b2b.run(&manager).await {
            Some(responses) => {
                tokio::spawn(async move {
                    b2b.relay_responses(responses, &manager).await;
                    manager.finish(&b2b);
                });
            }
            None => manager.finish(&b2b),
        }
    }

    fn finish(&self, b2b: &B2bTransaction) {
        b2b.handler().destroy(b2b);
        self.active.remove(b2b.id());
        debug!(id = %b2b.id(), age_ms = b2b.age().as_millis() as u64, "B2B transaction finished");
    }
}

#[async_trait]
impl TransactionUser for B2bTransactionManager {
    async fn on_request(&self, request: SipMessage, transaction: Arc<Transaction>) {
        let Some(handler) = self.handler_for(&request) else {
            warn!(method = ?request.method(), "No handler registered");
            let target = request.source_address().unwrap_or_else(|| transaction.remote_addr());
            match request.create_response(405, Some("No Corresponding Handler")) {
                Ok(response) => {
                    if let Err(e) = transaction.send_response(response, target).await {
                        warn!(error = %e, "Failed to send 405");
                    }
                }
                Err(e) => warn!(error = %e, "Cannot build 405"),
            }
            return;
        };

        let b2b = Arc::new(B2bTransaction::new(
            request,
            transaction,
            handler,
            self.sdp_handler(),
            self.dispatcher.clone(),
        ));
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        self.active.insert(b2b.id().to_string(), b2b.clone());
        self.on_dispatch(b2b).await;
    }

    async fn on_ack_for_2xx(&self, ack: SipMessage) {
        let Some(handler) = self.handler_for(&ack) else {
            debug!(call_id = ?ack.call_id(), "No handler for ACK");
            return;
        };
        let task = async move {
            if !handler.ack_for_2xx(ack) {
                debug!("ACK for 2xx not consumed");
            }
        };
        if let Err(task) = self.workers.try_spawn(task) {
            self.counters.inline.fetch_add(1, Ordering::Relaxed);
            task.await;
        }
    }

    async fn on_stray_response(&self, response: SipMessage) {
        if let Some(handler) = self.handler_for(&response) {
            if !handler.stray_response(response) {
                debug!("Stray response dropped");
            }
        }
    }
}
