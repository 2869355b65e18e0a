//! OPTIONS behavior
//!
//! OPTIONS aimed at one of the SBC's own listeners is answered with the
//! SBC's capabilities unless `route_options` asks for it to be routed.
//! Every other OPTIONS is routed like any request.

use std::sync::Arc;

use tracing::debug;

use sbc_sip_core::header::names;
use sbc_sip_core::{SipMessage, SipUri};

use super::{Services, default};
use crate::b2bua::{B2bTransaction, Handler, MessageType, RouteOutcome};

pub fn handler(services: &Arc<Services>) -> Handler {
    default::handler(services, MessageType::Options)
        .on_route({
            let services = services.clone();
            move |request, b2b| route(&services, request, b2b)
        })
        .on_process_response_outbound({
            let services = services.clone();
            move |response, b2b| {
                default::stamp_server(&services, response);
                super::refer::transform_response_contact(response, b2b);
            }
        })
}

fn addressed_to_sbc(request: &SipMessage, b2b: &B2bTransaction) -> bool {
    let Some(uri) = request.request_uri().and_then(|u| u.parse::<SipUri>().ok()) else {
        return false;
    };
    let transports = b2b.transports();
    uri.socket_addr().is_some_and(|addr| transports.is_local(&addr))
        || (uri.user.is_none() && uri.host_ip().is_some_and(|ip| transports.is_local_ip(&ip)))
}

fn route(services: &Services, request: &mut SipMessage, b2b: &B2bTransaction) -> RouteOutcome {
    if services.config.features.route_options || !addressed_to_sbc(request, b2b) {
        return default::route(services, request, b2b);
    }
    match capabilities(services, request) {
        Some(response) => {
            debug!(id = %b2b.id(), "OPTIONS answered locally");
            RouteOutcome::Respond(response)
        }
        None => default::respond(request, 500, "Server Internal Error"),
    }
}

/// 200 OK listing what the SBC accepts
pub fn capabilities(services: &Services, request: &SipMessage) -> Option<SipMessage> {
    let features = &services.config.features;
    let mut response = request.create_response(200, None).ok()?;
    response.set_header(names::ALLOW, features.allow.clone());
    response.set_header(names::ACCEPT, "application/sdp");
    if features.local_100rel {
        super::add_token(&mut response, names::ALLOW, "PRACK");
        response.set_header(names::SUPPORTED, "100rel");
    }
    if features.local_update {
        super::add_token(&mut response, names::ALLOW, "UPDATE");
    }
    default::stamp_server(services, &mut response);
    Some(response)
}
