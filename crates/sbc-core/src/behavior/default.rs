//! Slots shared by every method
//!
//! Out-of-dialog routing order:
//!
//! 1. The Request-URI must parse (400 otherwise).
//! 2. Requests other than REGISTER aimed at a Contact minted for a
//!    registration go to the UA that registered it (404 once the binding is
//!    gone). With `registrar.route_by_aor`, a Request-URI whose user has a
//!    live binding for the same host does too.
//! 3. The route policy may reject, ban, hand the request to the local
//!    handler, or name a target and interface.
//! 4. Without a route target the Request-URI host is resolved (404 on failure).
//! 5. INVITE, REGISTER, SUBSCRIBE and PUBLISH aimed back at one of our own
//!    listeners are refused as loops.
//! 6. The inbound Via, Route and Record-Route are dropped and a single Via
//!    with a branch derived from the inbound one is added.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use sbc_sip_core::header::{self, DEFAULT_SIP_PORT, names};
use sbc_sip_core::{SipMessage, SipUri, TransportType};
use sbc_transaction_core::TransactionError;

use super::Services;
use crate::b2bua::{B2bTransaction, Handler, MessageType, RouteOutcome};
use crate::config::RouteAction;
use crate::contact::{derived_branch, replace_via, strip_topology};
use crate::context::RouteFlags;
use crate::registrar::registration_id_of;
use crate::routing::route_target;

const LOOP_CHECKED_METHODS: [&str; 4] = ["INVITE", "REGISTER", "SUBSCRIBE", "PUBLISH"];

/// Handler with the default slots filled in
pub fn handler(services: &Arc<Services>, message_type: MessageType) -> Handler {
    Handler::new(message_type)
        .on_transaction_created({
            let services = services.clone();
            move |request, _| admit(&services, request)
        })
        .on_authenticate({
            let services = services.clone();
            move |request, _| authenticate(&services, request)
        })
        .on_route({
            let services = services.clone();
            move |request, b2b| route(&services, request, b2b)
        })
        .on_route_response(|request, b2b| route_response(request, b2b))
        .on_process_outbound({
            let services = services.clone();
            move |request, _| stamp_user_agent(&services, request)
        })
        .on_process_response_outbound({
            let services = services.clone();
            move |response, _| stamp_server(&services, response)
        })
        .on_transaction_error(transaction_error)
}

/// Answers `request` with `code` as a route outcome
pub fn respond(request: &SipMessage, code: u16, reason: &str) -> RouteOutcome {
    match request.create_response(code, Some(reason)) {
        Ok(response) => RouteOutcome::Respond(response),
        Err(e) => {
            warn!(error = %e, code, "Cannot build rejection");
            RouteOutcome::Local
        }
    }
}

/// Banned sources and packet-rate admission
pub fn admit(services: &Services, request: &SipMessage) -> Option<SipMessage> {
    let source = request.source_address()?.ip();
    if services.is_banned(&source) {
        debug!(%source, "Refusing request from banned source");
        return request.create_response(403, None).ok();
    }
    if !services.packet_rate().check(source) {
        warn!(%source, "Packet rate exceeded");
        return request
            .create_response(500, Some("Maximum Packets Per Second Violation"))
            .ok();
    }
    None
}

/// Out-of-dialog requests other than CANCEL go through the authenticator
pub fn authenticate(services: &Services, request: &mut SipMessage) -> Option<SipMessage> {
    if request.is_mid_dialog() || request.is_request_method("CANCEL") {
        return None;
    }
    services.authenticator()?.authenticate(request)
}

pub fn route(services: &Services, request: &mut SipMessage, b2b: &B2bTransaction) -> RouteOutcome {
    if request.is_mid_dialog() {
        route_mid_dialog(services, request, b2b)
    } else {
        route_out_of_dialog(services, request, b2b)
    }
}

/// Routes a request onto the other leg of its dialog
pub fn route_mid_dialog(services: &Services, request: &mut SipMessage, b2b: &B2bTransaction) -> RouteOutcome {
    match services.dialogs.route_mid_dialog(request) {
        Ok(route) => {
            let mut ctx = b2b.context().write();
            ctx.session_id = Some(route.session_id);
            ctx.leg_index = Some(route.sender);
            ctx.target_transport = Some(route.transport);
            RouteOutcome::Forward {
                local_interface: Some(route.local_interface),
                target: route.target,
            }
        }
        Err(rejection) => {
            debug!(id = %b2b.id(), code = rejection.code, reason = rejection.reason, "Mid-dialog request refused");
            respond(request, rejection.code, rejection.reason)
        }
    }
}

pub fn route_out_of_dialog(services: &Services, request: &mut SipMessage, b2b: &B2bTransaction) -> RouteOutcome {
    let Some(request_uri) = request.request_uri().and_then(|u| u.parse::<SipUri>().ok()) else {
        return respond(request, 400, "Bad Request - Unable to Parse R-URI");
    };
    if !request.is_request_method("REGISTER") {
        if let Some(outcome) = route_to_registration(services, request, &request_uri, b2b) {
            return outcome;
        }
    }

    let route = services.route_policy().route(request, &request_uri);
    if let Some(route) = &route {
        match route.action {
            RouteAction::Reject => {
                let code = route.reject_code.unwrap_or(404);
                let reason = route
                    .reject_reason
                    .clone()
                    .unwrap_or_else(|| header::reason_phrase(code).to_string());
                return respond(request, code, &reason);
            }
            RouteAction::Ban => {
                if let Some(source) = request.source_address() {
                    services.ban(source.ip());
                }
                return respond(request, 403, "Congratulations.  Your address is now banned.");
            }
            RouteAction::Local => return RouteOutcome::Local,
            RouteAction::Forward => {}
        }
        let mut ctx = b2b.context().write();
        ctx.route_flags = RouteFlags {
            disable_nat_compensation: route.disable_nat_compensation,
            respond_to_packet_source: route.respond_to_packet_source,
            retarget_refer: route.retarget_refer.clone(),
        };
        ctx.generate_local_response = route.local_response;
        if route.target_transport.is_some() {
            ctx.target_transport = route.target_transport;
        }
    }

    let transport = {
        let mut ctx = b2b.context().write();
        *ctx.target_transport.get_or_insert_with(|| {
            request_uri
                .param("transport")
                .and_then(|t| t.parse::<TransportType>().ok())
                .unwrap_or(TransportType::Udp)
        })
    };

    let target = match route.as_ref().and_then(route_target) {
        Some(target) => target,
        None => {
            let port = request_uri.port.unwrap_or(DEFAULT_SIP_PORT);
            match services.resolver().resolve(&request_uri.host, port) {
                Some(target) => target,
                None => return respond(request, 404, "Unable to resolve ultimate target via DNS lookup."),
            }
        }
    };

    let method = request.method().unwrap_or_default().to_ascii_uppercase();
    let transports = b2b.transports();
    if LOOP_CHECKED_METHODS.contains(&method.as_str()) && transports.is_local(&target) {
        info!(id = %b2b.id(), %target, %method, "Request would loop back to the SBC");
        return respond(request, 404, "No Upstream Route Configured");
    }

    let local_interface = route
        .as_ref()
        .and_then(|r| r.interface())
        .filter(|addr| transports.is_local(addr))
        .or_else(|| transports.default_for(transport));

    let branch = request.via_branch();
    if branch.is_empty() {
        return respond(request, 400, "Missing Via Branch Parameter");
    }
    strip_topology(request);
    if let Some(local) = local_interface {
        replace_via(request, transport, local, &derived_branch(&branch));
    }

    debug!(id = %b2b.id(), %method, %target, ?local_interface, %transport, "Routed out-of-dialog request");
    RouteOutcome::Forward { local_interface, target }
}

/// Sends a request for a registered binding to the UA behind it
fn route_to_registration(
    services: &Services,
    request: &mut SipMessage,
    request_uri: &SipUri,
    b2b: &B2bTransaction,
) -> Option<RouteOutcome> {
    let record = match registration_id_of(request_uri) {
        Some(id) => match services.registrar.find(&id) {
            Some(record) => record,
            None => {
                debug!(id = %b2b.id(), registration_id = %id, "No binding for request");
                return Some(respond(request, 404, "Registration Not Found"));
            }
        },
        None if services.config.registrar.route_by_aor => {
            let record = services.registrar.find_by_user(request_uri.user.as_deref()?)?;
            let aor_host = record.aor.parse::<SipUri>().ok()?.host;
            if !aor_host.eq_ignore_ascii_case(&request_uri.host) {
                return None;
            }
            record
        }
        None => return None,
    };

    let branch = request.via_branch();
    if branch.is_empty() {
        return Some(respond(request, 400, "Missing Via Branch Parameter"));
    }
    if let Err(e) = request.set_request_uri(&record.contact) {
        warn!(registration_id = %record.registration_id, error = %e, "Unusable registered contact");
        return Some(respond(request, 500, "Invalid Registered Contact"));
    }
    {
        let mut ctx = b2b.context().write();
        ctx.target_transport = Some(record.transport);
        ctx.registration_id = Some(record.registration_id.clone());
        ctx.registered_contact = Some(record.contact.clone());
    }
    strip_topology(request);
    replace_via(request, record.transport, record.local_interface, &derived_branch(&branch));

    let target = record.target();
    debug!(id = %b2b.id(), registration_id = %record.registration_id, %target, "Routed to registered contact");
    Some(RouteOutcome::Forward { local_interface: Some(record.local_interface), target })
}

/// Response destination by the top Via sent-by.
///
/// A private sent-by is replaced with the packet source unless the route
/// disabled NAT compensation.
pub fn route_response(request: &SipMessage, b2b: &B2bTransaction) -> Option<SocketAddr> {
    let flags = b2b.context().read().route_flags.clone();
    let source = b2b.source_address();
    if !flags.disable_nat_compensation && flags.respond_to_packet_source {
        return Some(source);
    }
    let Some(sent_by) = request.top_via().and_then(|via| via.sent_by_addr()) else {
        return Some(source);
    };
    if header::is_private_ip(&sent_by.ip()) && !flags.disable_nat_compensation {
        Some(source)
    } else {
        Some(sent_by)
    }
}

pub fn stamp_user_agent(services: &Services, request: &mut SipMessage) {
    if !services.config.user_agent.is_empty() {
        request.set_header(names::USER_AGENT, services.config.user_agent.clone());
    }
}

pub fn stamp_server(services: &Services, response: &mut SipMessage) {
    if !services.config.user_agent.is_empty() {
        response.set_header(names::SERVER, services.config.user_agent.clone());
    }
}

/// A failed client transaction is answered upstream with 408; error
/// responses from the far end are relayed unchanged
pub fn transaction_error(
    error: Option<&TransactionError>,
    response: Option<&SipMessage>,
    b2b: &B2bTransaction,
) -> Option<SipMessage> {
    let error = error?;
    if response.is_some() {
        return None;
    }
    debug!(id = %b2b.id(), %error, timeout = error.is_timeout(), "Answering failed transaction");
    b2b.server_request().create_response(408, None).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::config::SbcConfig;
    use crate::disconnect::CallTimers;
    use sbc_transaction_core::{TimerSettings, TransactionDispatcher};
    use sbc_sip_core::TransportTable;

    fn services(config: SbcConfig) -> Services {
        let dispatcher = TransactionDispatcher::new(Arc::new(TransportTable::new()), TimerSettings::default());
        Services::new(config, dispatcher, Arc::new(MemoryStore::new()), Arc::new(CallTimers::new()))
    }

    fn request_from(source: &str) -> SipMessage {
        let mut request = SipMessage::request("MESSAGE", "sip:bob@example.com");
        request.set_header(names::VIA, "SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bKm1");
        request.set_header(names::FROM, "<sip:alice@example.com>;tag=a");
        request.set_header(names::TO, "<sip:bob@example.com>");
        request.set_header(names::CALL_ID, "m1");
        request.set_header(names::CSEQ, "1 MESSAGE");
        request.set_property(sbc_sip_core::props::SOURCE_ADDRESS, source);
        request
    }

    #[tokio::test(start_paused = true)]
    async fn admission_limits_packet_rate() {
        let config = SbcConfig { max_packets_per_second: 1, ..Default::default() };
        let services = services(config);
        let request = request_from("203.0.113.9:5060");
        assert!(admit(&services, &request).is_none());

        let refused = admit(&services, &request).unwrap();
        assert_eq!(refused.status_code(), Some(500));
        assert_eq!(refused.reason(), Some("Maximum Packets Per Second Violation"));
    }

    #[tokio::test]
    async fn banned_sources_get_403() {
        let services = services(SbcConfig::default());
        services.ban("203.0.113.9".parse().unwrap());
        let refused = admit(&services, &request_from("203.0.113.9:5060")).unwrap();
        assert_eq!(refused.status_code(), Some(403));
        assert!(admit(&services, &request_from("203.0.113.10:5060")).is_none());
    }

    struct Deny;

    impl super::super::Authenticator for Deny {
        fn authenticate(&self, request: &SipMessage) -> Option<SipMessage> {
            request.create_response(407, None).ok()
        }
    }

    #[tokio::test]
    async fn mid_dialog_and_cancel_skip_authentication() {
        let services = services(SbcConfig::default()).with_authenticator(Arc::new(Deny));
        let mut request = request_from("203.0.113.9:5060");
        assert_eq!(authenticate(&services, &mut request).and_then(|r| r.status_code()), Some(407));

        let mut cancel = request.clone();
        cancel.set_start_line("CANCEL sip:bob@example.com SIP/2.0");
        assert!(authenticate(&services, &mut cancel).is_none());

        request.set_header(names::TO, "<sip:bob@example.com>;tag=b");
        assert!(authenticate(&services, &mut request).is_none());
    }

    #[tokio::test]
    async fn user_agent_and_server_stamps() {
        let config = SbcConfig { user_agent: "edge".into(), ..Default::default() };
        let services = services(config);
        let mut request = request_from("203.0.113.9:5060");
        stamp_user_agent(&services, &mut request);
        assert_eq!(request.header(names::USER_AGENT), Some("edge"));

        let mut response = request.create_response(200, None).unwrap();
        stamp_server(&services, &mut response);
        assert_eq!(response.header(names::SERVER), Some("edge"));
    }
}
