//! SUBSCRIBE behavior
//!
//! An initial SUBSCRIBE is routed like any out-of-dialog request. When the
//! notifier accepts it, the subscription is cached by (Event, Call-ID) along
//! with the notifier's Contact and route set and the subscriber's address, so
//! refreshes go back to the same notifier and NOTIFYs find their way to the
//! subscriber without another policy lookup.
//!
//! A refresh that fails drops the cached entry: a 481 from the notifier, a
//! transaction failure, or any error to an unsubscribe (`Expires: 0`). A
//! challenge leaves it in place for the retry.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info};

use sbc_sip_core::header::{self, names};
use sbc_sip_core::{SipMessage, SipUri, TransportType, props};
use sbc_transaction_core::TransactionError;

use super::{Services, default};
use crate::b2bua::{B2bTransaction, Handler, MessageType, RouteOutcome};
use crate::contact::{derived_branch, generate_session_id, replace_via, strip_topology, transform_contact};
use crate::context::LegIndex;
use crate::subscription::{Subscription, subscription_key};

const DEFAULT_EXPIRES: u32 = 3600;

pub fn handler(services: &Arc<Services>) -> Handler {
    default::handler(services, MessageType::Subscribe)
        .on_route({
            let services = services.clone();
            move |request, b2b| route(&services, request, b2b)
        })
        .on_process_outbound({
            let services = services.clone();
            move |request, b2b| process_outbound(&services, request, b2b)
        })
        .on_process_response_inbound(process_response_inbound)
        .on_process_response_outbound({
            let services = services.clone();
            move |response, b2b| process_response_outbound(&services, response, b2b)
        })
        .on_transaction_error({
            let services = services.clone();
            move |error, response, b2b| transaction_error(&services, error, response, b2b)
        })
}

fn route(services: &Services, request: &mut SipMessage, b2b: &B2bTransaction) -> RouteOutcome {
    let Some(event) = request.header(names::EVENT).map(str::to_string) else {
        return default::respond(request, 400, "Bad Event Header");
    };
    let call_id = request.call_id().unwrap_or_default().to_string();
    b2b.context().write().session_id = Some(generate_session_id(&call_id));

    if request.is_mid_dialog() {
        return route_refresh(services, request, b2b, &event, &call_id);
    }

    let outcome = default::route_out_of_dialog(services, request, b2b);
    if let RouteOutcome::Forward { local_interface, target } = &outcome {
        let mut ctx = b2b.context().write();
        ctx.subscribe_target_address = Some(*target);
        ctx.subscribe_interface = *local_interface;
    }
    outcome
}

/// Sends a refresh to the notifier that accepted the subscription
fn route_refresh(
    services: &Services,
    request: &mut SipMessage,
    b2b: &B2bTransaction,
    event: &str,
    call_id: &str,
) -> RouteOutcome {
    let Some(subscription) = services.subscriptions.find_by(event, call_id) else {
        return default::respond(request, 481, "Subscription Does Not Exist");
    };
    let (Some(target), Some(local)) = (subscription.target_address, subscription.local_interface) else {
        return default::respond(request, 481, "Subscription Does Not Exist");
    };

    let branch = request.via_branch();
    if branch.is_empty() {
        return default::respond(request, 400, "Missing Via Branch Parameter");
    }
    if let Some(uri) = &subscription.target_uri {
        if request.set_request_uri(uri).is_err() {
            return default::respond(request, 400, "Bad Request - Unable to Parse R-URI");
        }
    }
    let transport = subscription
        .target_uri
        .as_deref()
        .and_then(|u| u.parse::<SipUri>().ok())
        .and_then(|u| u.param("transport").and_then(|t| t.parse::<TransportType>().ok()))
        .unwrap_or_default();

    strip_topology(request);
    for route in &subscription.routes {
        request.append_header(names::ROUTE, route.clone());
    }
    replace_via(request, transport, local, &derived_branch(&branch));

    let mut ctx = b2b.context().write();
    ctx.target_transport = Some(transport);
    ctx.subscribe_target_address = Some(target);
    ctx.subscribe_interface = Some(local);
    ctx.subscribe_target_uri = subscription.target_uri.clone();
    ctx.subscribe_routes = subscription.routes.clone();
    debug!(id = %b2b.id(), %event, %target, "Routing subscription refresh");
    RouteOutcome::Forward { local_interface: Some(local), target }
}

fn process_outbound(services: &Services, request: &mut SipMessage, b2b: &B2bTransaction) {
    default::stamp_user_agent(services, request);
    let ctx = b2b.context_snapshot();
    let (Some(session_id), Some(local)) = (ctx.session_id, ctx.subscribe_interface) else {
        return;
    };
    transform_contact(
        request,
        local,
        ctx.target_transport.unwrap_or_default(),
        &session_id,
        LegIndex::Outbound,
    );
}

fn process_response_inbound(response: &mut SipMessage, b2b: &B2bTransaction) {
    if !response.is_2xx() || b2b.server_request().is_mid_dialog() {
        return;
    }
    let target_uri = response.header(names::CONTACT).map(|c| header::uri_part(c).to_string());
    let transports = b2b.transports();
    let routes: Vec<String> = response
        .header_values(names::RECORD_ROUTE)
        .rev()
        .filter(|rr| {
            let addr = header::uri_part(rr).parse::<SipUri>().ok().and_then(|u| u.socket_addr());
            !addr.is_some_and(|addr| transports.is_local(&addr))
        })
        .map(str::to_string)
        .collect();

    let mut ctx = b2b.context().write();
    if target_uri.is_some() {
        ctx.subscribe_target_uri = target_uri;
    }
    ctx.subscribe_routes = routes;
}

fn process_response_outbound(services: &Services, response: &mut SipMessage, b2b: &B2bTransaction) {
    default::stamp_server(services, response);
    if !response.is_2xx() {
        return;
    }
    let ctx = b2b.context_snapshot();
    let request = b2b.server_request();
    let Some(session_id) = ctx.session_id.clone() else {
        return;
    };

    let contact = transform_contact(
        response,
        b2b.local_address(),
        b2b.source_transport(),
        &session_id,
        LegIndex::Inbound,
    );
    let (Some(event), Some(call_id)) = (request.header(names::EVENT), request.call_id()) else {
        return;
    };
    let expires = response.expires().or_else(|| request.expires()).unwrap_or(DEFAULT_EXPIRES);

    let previous = services.subscriptions.find_by(event, call_id);
    let subscription = Subscription {
        event: event.to_string(),
        call_id: call_id.to_string(),
        request: previous.as_ref().map_or_else(|| request.clone(), |p| p.request.clone()),
        expires,
        target_address: ctx.subscribe_target_address,
        local_interface: ctx.subscribe_interface,
        target_uri: ctx.subscribe_target_uri.clone(),
        routes: ctx.subscribe_routes.clone(),
        notify_local_contact: Some(contact),
        notify_local_address: Some(b2b.local_address()),
        notify_target_address: Some(notify_target(&request, b2b)),
        notify_from_uri: response.header(names::TO).map(str::to_string),
    };
    let key = subscription.key();
    match services.subscriptions.register(subscription) {
        Some(bucket) => info!(%key, expires, bucket, "Subscription active"),
        None => info!(%key, "Subscription ended"),
    }
}

fn transaction_error(
    services: &Services,
    error: Option<&TransactionError>,
    response: Option<&SipMessage>,
    b2b: &B2bTransaction,
) -> Option<SipMessage> {
    let request = b2b.server_request();
    if request.is_mid_dialog() {
        let code = response.and_then(SipMessage::status_code);
        let challenged = matches!(code, Some(401 | 407));
        let unsubscribing = request.expires() == Some(0);
        if error.is_some() || code == Some(481) || (unsubscribing && !challenged) {
            if let (Some(event), Some(call_id)) = (request.header(names::EVENT), request.call_id()) {
                let key = subscription_key(event, call_id);
                if services.subscriptions.expire(&key) {
                    info!(%key, ?code, "Subscription dropped after failed refresh");
                }
            }
        }
    }
    default::transaction_error(error, response, b2b)
}

/// Address NOTIFYs for this subscriber are sent to
fn notify_target(request: &SipMessage, b2b: &B2bTransaction) -> SocketAddr {
    request
        .property_addr(props::SOURCE_ADDRESS)
        .unwrap_or_else(|| b2b.source_address())
}
