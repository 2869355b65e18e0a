//! Per-method SBC behaviors
//!
//! Every behavior is a [`Handler`](crate::b2bua::Handler) whose slots are
//! closures over the shared [`Services`]. [`default::handler`] fills in the
//! slots every method shares (admission, routing, response routing, header
//! stamping, error mapping); the per-method modules start from it and replace
//! the slots they specialise.

pub mod bye;
pub mod cancel;
pub mod default;
pub mod invite;
pub mod notify;
pub mod options;
pub mod prack;
pub mod refer;
pub mod register;
pub mod subscribe;
pub mod update;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tokio::time::Instant;
use tracing::{debug, warn};

use sbc_sip_core::header;
use sbc_sip_core::SipMessage;
use sbc_transaction_core::{MessageSender, TransactionDispatcher};

use crate::b2bua::{B2bTransactionManager, MessageType};
use crate::cdr::CdrManager;
use crate::config::SbcConfig;
use crate::dialog_state::DialogStateManager;
use crate::disconnect::CallTimers;
use crate::registrar::Registrar;
use crate::reliable::ReliableResponseEngine;
use crate::routing::{Resolver, RoutePolicy, StaticRoutePolicy, SystemResolver};
use crate::store::KeyValueStore;
use crate::subscription::SubscriptionCache;

/// Credential check for out-of-dialog requests.
///
/// A returned response (typically 401 or 407 with a challenge) is sent
/// upstream and ends the transaction.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, request: &SipMessage) -> Option<SipMessage>;
}

/// Fixed one second window counter per source address
#[derive(Debug)]
pub struct PacketRateLimiter {
    limit: u32,
    window: Duration,
    counters: DashMap<IpAddr, (Instant, u32)>,
}

impl PacketRateLimiter {
    /// `limit` packets per second per source; zero disables the check
    pub fn new(limit: u32) -> Self {
        PacketRateLimiter {
            limit,
            window: Duration::from_secs(1),
            counters: DashMap::new(),
        }
    }

    /// Counts a packet from `source`; false once the source is over the limit
    pub fn check(&self, source: IpAddr) -> bool {
        if self.limit == 0 {
            return true;
        }
        let now = Instant::now();
        let mut entry = self.counters.entry(source).or_insert((now, 0));
        let (window_start, count) = &mut *entry;
        if now.duration_since(*window_start) >= self.window {
            *window_start = now;
            *count = 0;
        }
        *count += 1;
        *count <= self.limit
    }
}

/// State shared by every behavior
pub struct Services {
    pub config: SbcConfig,
    pub dispatcher: Arc<TransactionDispatcher>,
    pub dialogs: Arc<DialogStateManager>,
    pub subscriptions: Arc<SubscriptionCache>,
    pub reliable: Arc<ReliableResponseEngine>,
    pub call_timers: Arc<CallTimers>,
    pub registrar: Arc<Registrar>,
    pub cdr: Arc<CdrManager>,
    route_policy: Arc<dyn RoutePolicy>,
    resolver: Arc<dyn Resolver>,
    authenticator: Option<Arc<dyn Authenticator>>,
    banned: DashSet<IpAddr>,
    packet_rate: PacketRateLimiter,
    /// Client INVITEs still waiting for a final response, by server transaction id
    invites: DashMap<String, SipMessage>,
    /// Original Refer-To values behind retargeted `xfer-` users
    refer_targets: DashMap<String, String>,
}

impl Services {
    pub fn new(
        config: SbcConfig,
        dispatcher: Arc<TransactionDispatcher>,
        store: Arc<dyn KeyValueStore>,
        call_timers: Arc<CallTimers>,
    ) -> Self {
        let sender: Arc<dyn MessageSender> = dispatcher.clone();
        let reliable = ReliableResponseEngine::new(
            sender,
            config.reliable.tick(),
            config.reliable.max_retransmits,
        );
        let registrar = Arc::new(Registrar::new(store.clone()));
        let cdr = Arc::new(CdrManager::new(store.clone(), &config.limits, &config.cdr));
        let dialogs = Arc::new(DialogStateManager::new(store, dispatcher.transports().clone()));
        Services {
            route_policy: Arc::new(StaticRoutePolicy::new(config.routes.clone())),
            resolver: Arc::new(SystemResolver),
            authenticator: None,
            banned: DashSet::new(),
            packet_rate: PacketRateLimiter::new(config.max_packets_per_second),
            invites: DashMap::new(),
            refer_targets: DashMap::new(),
            subscriptions: Arc::new(SubscriptionCache::new()),
            config,
            dispatcher,
            dialogs,
            reliable,
            call_timers,
            registrar,
            cdr,
        }
    }

    pub fn with_route_policy(mut self, policy: Arc<dyn RoutePolicy>) -> Self {
        self.route_policy = policy;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn route_policy(&self) -> &Arc<dyn RoutePolicy> {
        &self.route_policy
    }

    pub fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.resolver
    }

    pub fn authenticator(&self) -> Option<&Arc<dyn Authenticator>> {
        self.authenticator.as_ref()
    }

    pub fn ban(&self, source: IpAddr) {
        if self.banned.insert(source) {
            warn!(%source, "Source banned");
        }
    }

    pub fn unban(&self, source: &IpAddr) -> bool {
        self.banned.remove(source).is_some()
    }

    pub fn is_banned(&self, source: &IpAddr) -> bool {
        self.banned.contains(source)
    }

    pub fn packet_rate(&self) -> &PacketRateLimiter {
        &self.packet_rate
    }

    pub(crate) fn track_invite(&self, id: String, client_invite: SipMessage) {
        self.invites.insert(id, client_invite);
    }

    pub(crate) fn pending_invite(&self, id: &str) -> Option<SipMessage> {
        self.invites.get(id).map(|invite| invite.clone())
    }

    pub(crate) fn untrack_invite(&self, id: &str) -> bool {
        self.invites.remove(id).is_some()
    }

    /// Number of forwarded INVITEs still cancellable
    pub fn pending_invites(&self) -> usize {
        self.invites.len()
    }

    pub(crate) fn remember_refer_target(&self, id: String, refer_to: String) {
        self.refer_targets.insert(id, refer_to);
    }

    pub(crate) fn refer_target(&self, id: &str) -> Option<String> {
        self.refer_targets.get(id).map(|r| r.clone())
    }

    /// Sends a message outside any transaction without blocking the caller
    pub(crate) fn send_detached(&self, message: SipMessage, local: SocketAddr, target: SocketAddr) {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.send_direct(&message, local, target).await {
                warn!(start_line = %message.start_line(), %target, error = %e, "Stateless send failed");
            }
        });
    }
}

/// True when any value of the token list header `name` carries `token`
pub(crate) fn has_token(message: &SipMessage, name: &str, token: &str) -> bool {
    message.header_values(name).any(|v| header::has_token(v, token))
}

/// Adds `token` to a token list header unless it is already present
pub(crate) fn add_token(message: &mut SipMessage, name: &str, token: &str) {
    if has_token(message, name, token) {
        return;
    }
    let mut tokens: Vec<String> = message.header_values(name).flat_map(header::tokens).collect();
    tokens.push(token.to_string());
    message.set_header(name, tokens.join(", "));
}

/// Removes `token` from a token list header, dropping the header once empty
pub(crate) fn remove_token(message: &mut SipMessage, name: &str, token: &str) {
    if !has_token(message, name, token) {
        return;
    }
    let remaining: Vec<String> = message
        .header_values(name)
        .flat_map(header::tokens)
        .filter(|t| !t.eq_ignore_ascii_case(token))
        .collect();
    message.remove_header(name);
    if !remaining.is_empty() {
        message.set_header(name, remaining.join(", "));
    }
}

/// Registers one handler per method plus the fallback
pub fn register_all(manager: &B2bTransactionManager, services: &Arc<Services>) {
    manager.register_handler(default::handler(services, MessageType::Any));
    manager.register_handler(invite::handler(services));
    manager.register_handler(prack::handler(services));
    manager.register_handler(bye::handler(services));
    manager.register_handler(cancel::handler(services));
    manager.register_handler(subscribe::handler(services));
    manager.register_handler(notify::handler(services));
    manager.register_handler(refer::handler(services));
    manager.register_handler(update::handler(services));
    manager.register_handler(options::handler(services));
    manager.register_handler(register::handler(services));
    for message_type in [MessageType::Message, MessageType::Info, MessageType::Publish] {
        manager.register_handler(default::handler(services, message_type));
    }
    debug!("Registered SBC behaviors");
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbc_sip_core::header::names;

    #[tokio::test(start_paused = true)]
    async fn packet_rate_window_resets() {
        let limiter = PacketRateLimiter::new(2);
        let source: IpAddr = "10.0.0.5".parse().unwrap();
        assert!(limiter.check(source));
        assert!(limiter.check(source));
        assert!(!limiter.check(source));
        assert!(limiter.check("10.0.0.6".parse().unwrap()));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.check(source));
    }

    #[test]
    fn unlimited_rate() {
        let limiter = PacketRateLimiter::new(0);
        let source: IpAddr = "10.0.0.5".parse().unwrap();
        assert!((0..1000).all(|_| limiter.check(source)));
    }

    #[test]
    fn token_lists() {
        let mut request = SipMessage::request("INVITE", "sip:bob@example.com");
        request.set_header(names::SUPPORTED, "timer, 100rel");
        assert!(has_token(&request, names::SUPPORTED, "100REL"));

        add_token(&mut request, names::SUPPORTED, "100rel");
        assert_eq!(request.header(names::SUPPORTED), Some("timer, 100rel"));

        add_token(&mut request, names::ALLOW, "PRACK");
        assert_eq!(request.header(names::ALLOW), Some("PRACK"));

        remove_token(&mut request, names::SUPPORTED, "timer");
        assert_eq!(request.header(names::SUPPORTED), Some("100rel"));
        remove_token(&mut request, names::SUPPORTED, "100rel");
        assert!(!request.has_header(names::SUPPORTED));
    }
}
