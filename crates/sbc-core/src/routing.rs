//! Out-of-dialog route policy and target resolution

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use tracing::{debug, trace};

use sbc_sip_core::header::DEFAULT_SIP_PORT;
use sbc_sip_core::{SipMessage, SipUri};

use crate::config::{RouteAction, RouteConfig};
use crate::store::wildcard_match;

/// Decides how an out-of-dialog request leaves the SBC
pub trait RoutePolicy: Send + Sync {
    /// The route entry for a request, or `None` to resolve the Request-URI host
    fn route(&self, request: &SipMessage, request_uri: &SipUri) -> Option<RouteConfig>;
}

/// First-match route table loaded from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticRoutePolicy {
    routes: Vec<RouteConfig>,
}

impl StaticRoutePolicy {
    pub fn new(routes: Vec<RouteConfig>) -> Self {
        StaticRoutePolicy { routes }
    }
}

impl RoutePolicy for StaticRoutePolicy {
    fn route(&self, request: &SipMessage, request_uri: &SipUri) -> Option<RouteConfig> {
        let method = request.method().unwrap_or_default();
        let subject = match &request_uri.user {
            Some(user) => format!("{}@{}", user, request_uri.host),
            None => request_uri.host.clone(),
        };
        let found = self.routes.iter().find(|r| {
            (r.methods.is_empty() || r.methods.iter().any(|m| m.eq_ignore_ascii_case(method)))
                && wildcard_match(&r.pattern, &subject)
        });
        match found {
            Some(route) => {
                debug!(%subject, pattern = %route.pattern, action = ?route.action, "Route matched");
                Some(route.clone())
            }
            None => {
                trace!(%subject, "No static route");
                None
            }
        }
    }
}

/// Host name resolution for Request-URI targets
pub trait Resolver: Send + Sync {
    fn resolve(&self, host: &str, port: u16) -> Option<SocketAddr>;
}

/// Resolver backed by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> Option<SocketAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(SocketAddr::new(ip, port));
        }
        match (host, port).to_socket_addrs() {
            Ok(mut addrs) => addrs.next(),
            Err(e) => {
                debug!(host, error = %e, "DNS lookup failed");
                None
            }
        }
    }
}

/// Target address named by a route entry
pub fn route_target(route: &RouteConfig) -> Option<SocketAddr> {
    let ip: IpAddr = route.target_address.as_deref()?.parse().ok()?;
    Some(SocketAddr::new(ip, route.target_port.unwrap_or(DEFAULT_SIP_PORT)))
}

/// True for entries that answer instead of forwarding
pub fn is_terminal_action(route: &RouteConfig) -> bool {
    matches!(route.action, RouteAction::Reject | RouteAction::Ban)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbc_sip_core::TransportType;

    fn policy() -> StaticRoutePolicy {
        StaticRoutePolicy::new(vec![
            RouteConfig {
                pattern: "911@*".into(),
                action: RouteAction::Reject,
                reject_code: Some(503),
                ..Default::default()
            },
            RouteConfig {
                pattern: "*@carrier.example.com".into(),
                methods: vec!["INVITE".into()],
                target_address: Some("203.0.113.10".into()),
                target_transport: Some(TransportType::Tcp),
                ..Default::default()
            },
        ])
    }

    fn route_for(method: &str, uri: &str) -> Option<RouteConfig> {
        let request = SipMessage::request(method, uri);
        policy().route(&request, &uri.parse().unwrap())
    }

    #[test]
    fn first_match_wins() {
        let route = route_for("INVITE", "sip:911@carrier.example.com").unwrap();
        assert_eq!(route.action, RouteAction::Reject);
        assert!(is_terminal_action(&route));
    }

    #[test]
    fn methods_restrict_entries() {
        let route = route_for("INVITE", "sip:bob@carrier.example.com").unwrap();
        assert_eq!(route_target(&route), Some("203.0.113.10:5060".parse().unwrap()));
        assert!(route_for("MESSAGE", "sip:bob@carrier.example.com").is_none());
    }

    #[test]
    fn system_resolver_accepts_literals() {
        assert_eq!(
            SystemResolver.resolve("198.51.100.7", 5070),
            Some("198.51.100.7:5070".parse().unwrap())
        );
    }
}
