//! INVITE behavior
//!
//! On top of the default routing an initial INVITE gets a session id, a
//! Contact on the outbound leg that carries that id, and optionally a new
//! Call-ID. Both legs are recorded with the dialog state manager as responses
//! arrive, so later mid-dialog requests can be mapped across. Each new call
//! is admitted against the call limits and tracked by the CDR manager until
//! its final response or BYE.
//!
//! With `local_100rel` the SBC terminates reliable provisionals on each leg:
//!
//! ```text
//!   UA                       SBC                        far end
//!    │ INVITE (100rel?)       │ INVITE Supported:100rel  │
//!    │───────────────────────▶│─────────────────────────▶│
//!    │                        │ 183 RSeq:7 Require:100rel│
//!    │ 183 RSeq:1 (if the UA  │◀─────────────────────────│
//!    │ supports 100rel)       │ PRACK RAck:7 1 INVITE    │
//!    │◀───────────────────────│─────────────────────────▶│
//!    │ PRACK RAck:1           │                          │
//!    │───────────────────────▶│ (answered locally)       │
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use sbc_sip_core::header::{generate_branch, names};
use sbc_sip_core::{SipMessage, props};
use sbc_transaction_core::TransactionError;

use super::{Services, add_token, default, has_token, refer, remove_token};
use crate::b2bua::{B2bTransaction, Handler, MessageType, RouteOutcome};
use crate::config::CidCorrelation;
use crate::contact::{build_contact_uri, construct_via, generate_session_id, transform_contact};
use crate::context::LegIndex;
use crate::dialog_state::LegInfo;

const X_CID: &str = "X-CID";
const SDP_CONTENT_TYPE: &str = "application/sdp";

pub fn handler(services: &Arc<Services>) -> Handler {
    default::handler(services, MessageType::Invite)
        .on_route({
            let services = services.clone();
            move |request, b2b| route(&services, request, b2b)
        })
        .on_process_outbound({
            let services = services.clone();
            move |request, b2b| process_outbound(&services, request, b2b)
        })
        .on_process_response_inbound({
            let services = services.clone();
            move |response, b2b| process_response_inbound(&services, response, b2b)
        })
        .on_process_response_outbound({
            let services = services.clone();
            move |response, b2b| process_response_outbound(&services, response, b2b)
        })
        .on_transaction_error({
            let services = services.clone();
            move |error, response, b2b| transaction_error(&services, error, response, b2b)
        })
        .on_destroy({
            let services = services.clone();
            move |b2b| {
                if let Ok(id) = b2b.server_request().transaction_id(None) {
                    services.untrack_invite(&id);
                }
            }
        })
        .on_ack_for_2xx({
            let services = services.clone();
            move |ack| relay_ack(&services, ack)
        })
        .on_stray_response({
            let services = services.clone();
            move |response| resend_cached_2xx(&services, response)
        })
}

fn route(services: &Services, request: &mut SipMessage, b2b: &B2bTransaction) -> RouteOutcome {
    if request.is_mid_dialog() {
        b2b.context().write().reinvite = true;
        return default::route_mid_dialog(services, request, b2b);
    }

    if refer::retarget_transfer(services, request) {
        b2b.context().write().retargeted = true;
    }
    if let Some(refused) = rewrite_replaces(services, request) {
        return refused;
    }

    let call_id = request.call_id().unwrap_or_default().to_string();
    let session_id = generate_session_id(&call_id);
    b2b.context().write().session_id = Some(session_id.clone());

    let outcome = default::route_out_of_dialog(services, request, b2b);
    let local = match &outcome {
        RouteOutcome::Forward { local_interface: Some(local), .. } => *local,
        _ => return outcome,
    };

    let server = b2b.server_request();
    if let Err(violation) = services.cdr.on_call_setup(&session_id, &server, b2b.source_address()) {
        warn!(id = %b2b.id(), %session_id, error = %violation, "Call refused");
        return default::respond(&server, 403, "Channel Count Exceeded");
    }

    send_trying(services, b2b);
    correlate_call_id(services, request, &call_id);

    let transport = b2b.context().read().target_transport.unwrap_or_default();
    let contact = transform_contact(request, local, transport, &session_id, LegIndex::Outbound);
    b2b.context().write().leg2_contact = Some(contact);

    let features = &services.config.features;
    if features.local_100rel || features.local_update {
        request.set_header(names::ALLOW, features.allow.clone());
    }
    if features.local_100rel {
        add_token(request, names::ALLOW, "PRACK");
        add_token(request, names::SUPPORTED, "100rel");
        remove_token(request, names::REQUIRE, "100rel");
    }
    if features.local_update {
        add_token(request, names::ALLOW, "UPDATE");
    }

    info!(id = %b2b.id(), %session_id, %call_id, "Routing new call");
    outcome
}

/// Points a `Replaces` header at the far leg of the dialog it names
fn rewrite_replaces(services: &Services, request: &mut SipMessage) -> Option<RouteOutcome> {
    let replaces = request.header(names::REPLACES)?.to_string();
    let call_id = replaces.split(';').next().unwrap_or_default().trim();
    let other = services.dialogs.find_by_call_id(call_id).and_then(|dialog| {
        [LegIndex::Inbound, LegIndex::Outbound]
            .into_iter()
            .find(|index| dialog.leg(*index).is_some_and(|leg| leg.call_id == call_id))
            .and_then(|index| dialog.leg(index.other()).cloned())
    });
    let Some(leg) = other else {
        return Some(default::respond(request, 404, "Attempt to replace an non-existent dialog"));
    };

    let mut value = leg.call_id.clone();
    if let Some(tag) = leg.remote_tag() {
        value.push_str(&format!(";to-tag={}", tag));
    }
    if let Some(tag) = leg.local_tag() {
        value.push_str(&format!(";from-tag={}", tag));
    }
    request.set_header(names::REPLACES, value);
    None
}

fn correlate_call_id(services: &Services, request: &mut SipMessage, call_id: &str) {
    match services.config.features.cid_correlation {
        CidCorrelation::None => {}
        CidCorrelation::B2b => {
            request.set_header(
                names::CALL_ID,
                format!("{}{}", call_id, services.config.features.b2b_cid_suffix),
            );
        }
        CidCorrelation::XCid => {
            request.set_header(X_CID, call_id);
            request.set_header(names::CALL_ID, uuid::Uuid::new_v4().to_string());
        }
    }
}

/// Destination of responses toward the UA, without the manager at hand
fn upstream_target(services: &Services, b2b: &B2bTransaction, request: &SipMessage) -> SocketAddr {
    if let Some(target) = b2b.context().read().response_target {
        return target;
    }
    if services.config.use_source_address_for_responses || b2b.source_transport().is_reliable() {
        return b2b.source_address();
    }
    default::route_response(request, b2b).unwrap_or_else(|| b2b.source_address())
}

fn send_trying(services: &Services, b2b: &B2bTransaction) {
    let request = b2b.server_request();
    let Ok(trying) = request.create_response(100, None) else {
        return;
    };
    let target = upstream_target(services, b2b, &request);
    let transaction = b2b.server_transaction().clone();
    tokio::spawn(async move {
        if let Err(e) = transaction.send_response(trying, target).await {
            debug!(id = %transaction.key(), error = %e, "100 Trying not sent");
        }
    });
}

fn process_outbound(services: &Services, request: &mut SipMessage, b2b: &B2bTransaction) {
    default::stamp_user_agent(services, request);
    match b2b.server_request().transaction_id(None) {
        Ok(id) => services.track_invite(id, request.clone()),
        Err(e) => debug!(id = %b2b.id(), error = %e, "INVITE not cancellable"),
    }
}

fn rseq_of(response: &SipMessage) -> Option<u32> {
    response.header(names::RSEQ)?.trim().parse().ok()
}

fn supports_100rel(request: &SipMessage) -> bool {
    has_token(request, names::SUPPORTED, "100rel") || has_token(request, names::REQUIRE, "100rel")
}

fn process_response_inbound(services: &Services, response: &mut SipMessage, b2b: &B2bTransaction) {
    if response.is_1xx_code(100) {
        return;
    }
    let features = &services.config.features;
    if features.disable_181_relay && response.is_1xx_code(181) {
        response.set_property(props::DISALLOW_FORWARD, "1");
    }

    if response.to_tag().is_some() && !response.is_error_response() {
        record_outbound_leg(services, response, b2b);
    }
    if features.local_100rel && response.is_1xx() && has_token(response, names::REQUIRE, "100rel") {
        acknowledge_reliable(services, response, b2b);
    }

    if response.is_2xx() {
        let server_call_id = b2b.call_id();
        let client_call_id = b2b.client_request().and_then(|r| r.call_id().map(str::to_string));
        for call_id in [server_call_id, client_call_id].into_iter().flatten() {
            services.call_timers.mark_call_start(&call_id);
        }
    }
    if response.is_final_response() {
        if let Ok(id) = b2b.server_request().transaction_id(None) {
            services.untrack_invite(&id);
        }
        let ctx = b2b.context_snapshot();
        if let (false, Some(session_id)) = (ctx.reinvite, ctx.session_id) {
            services.cdr.on_final(&session_id, response);
        }
        if response.is_error_response() {
            drop_failed_call(services, b2b);
        }
    }
}

/// Records the leg toward the far end from a response carrying its tag
fn record_outbound_leg(services: &Services, response: &SipMessage, b2b: &B2bTransaction) {
    let ctx = b2b.context_snapshot();
    let Some(session_id) = ctx.session_id else {
        return;
    };
    let Some(client) = b2b.client_request() else {
        return;
    };

    if ctx.reinvite {
        let target = ctx.leg_index.unwrap_or(LegIndex::Inbound).other();
        let updated = services.dialogs.update_leg(&session_id, target, |leg| {
            if let Some(contact) = response.header(names::CONTACT) {
                leg.remote_contact = contact.to_string();
            }
            if response.has_body() {
                leg.remote_sdp = Some(response.body().to_string());
            }
            if client.has_body() {
                leg.local_sdp = Some(client.body().to_string());
            }
        });
        if let Err(e) = updated {
            warn!(%session_id, error = %e, "Failed to update dialog after re-INVITE");
        }
        return;
    }

    let existing = services.dialogs.find(&session_id).and_then(|d| d.leg2);
    let invite_cseq = client.cseq().map(|c| c.number).unwrap_or(1);
    let remote_contact = response
        .header(names::CONTACT)
        .map(str::to_string)
        .or_else(|| existing.as_ref().map(|l| l.remote_contact.clone()))
        .unwrap_or_else(|| format!("<{}>", client.request_uri().unwrap_or_default()));
    let remote_sdp = if response.has_body() {
        Some(response.body().to_string())
    } else {
        existing.as_ref().and_then(|l| l.remote_sdp.clone())
    };

    let leg = LegInfo {
        call_id: client.call_id().unwrap_or_default().to_string(),
        from: client.header(names::FROM).unwrap_or_default().to_string(),
        to: response.header(names::TO).unwrap_or_default().to_string(),
        remote_contact,
        local_contact: ctx.leg2_contact.unwrap_or_default(),
        local_record_route: None,
        remote_ip: ctx.target_address,
        target_transport: ctx.target_transport.unwrap_or_default(),
        local_sdp: client.has_body().then(|| client.body().to_string()),
        remote_sdp,
        route_set: response.header_values(names::RECORD_ROUTE).rev().map(str::to_string).collect(),
        local_cseq: existing.as_ref().map_or(invite_cseq, |l| l.local_cseq.max(invite_cseq)),
        invite_cseq,
        no_rtp_proxy: false,
    };
    if let Err(e) = services.dialogs.set_leg(&session_id, LegIndex::Outbound, leg) {
        warn!(%session_id, error = %e, "Failed to record outbound leg");
    }
}

/// Sends the PRACK for a reliable provisional from the far end
fn acknowledge_reliable(services: &Services, response: &mut SipMessage, b2b: &B2bTransaction) {
    let Some(rseq) = rseq_of(response) else {
        return;
    };
    let session_id = {
        let mut ctx = b2b.context().write();
        if ctx.last_remote_rseq == Some(rseq) {
            response.set_property(props::DISALLOW_FORWARD, "1");
            return;
        }
        ctx.last_remote_rseq = Some(rseq);
        ctx.session_id.clone()
    };
    let Some(session_id) = session_id else {
        return;
    };

    let server = b2b.server_request();
    let transport = b2b.source_transport();
    let own_contact = build_contact_uri(None, b2b.local_address(), transport, &session_id, LegIndex::Inbound);
    let inbound_seq = server.cseq().map(|c| c.number).unwrap_or(1);
    let invite_seq = response.cseq().map(|c| c.number).unwrap_or(1);

    let mut prack = SipMessage::request("PRACK", &own_contact.to_string());
    prack.set_header(names::VIA, construct_via(transport, b2b.local_address(), &generate_branch()));
    prack.set_header(names::CSEQ, format!("{} PRACK", inbound_seq));
    prack.set_header(names::MAX_FORWARDS, "70");
    prack.set_header(names::RACK, format!("{} {} INVITE", rseq, invite_seq));
    prack.set_header(names::CONTENT_LENGTH, "0");

    let route = match services.dialogs.route_mid_dialog(&mut prack) {
        Ok(route) => route,
        Err(rejection) => {
            warn!(%session_id, reason = rejection.reason, "Cannot route PRACK");
            return;
        }
    };
    default::stamp_user_agent(services, &mut prack);
    debug!(%session_id, rseq, target = %route.target, "Acknowledging reliable provisional");

    let dispatcher = services.dispatcher.clone();
    tokio::spawn(async move {
        match dispatcher.send_request(prack, route.local_interface, route.target).await {
            Ok(client) => match client.responses.wait().await {
                Ok(answer) => debug!(status = ?answer.status_code(), "PRACK answered"),
                Err(e) => warn!(error = %e, "PRACK failed"),
            },
            Err(e) => warn!(error = %e, "PRACK not sent"),
        }
    });
}

fn process_response_outbound(services: &Services, response: &mut SipMessage, b2b: &B2bTransaction) {
    default::stamp_server(services, response);
    if response.is_1xx_code(100) {
        return;
    }
    let ctx = b2b.context_snapshot();
    let Some(session_id) = ctx.session_id.clone() else {
        return;
    };
    let sender = ctx.leg_index.unwrap_or(LegIndex::Inbound);
    let establishing = response.to_tag().is_some() && !response.is_error_response();

    if establishing {
        let contact = transform_contact(
            response,
            b2b.local_address(),
            b2b.source_transport(),
            &session_id,
            sender,
        );
        let mut ctx = b2b.context().write();
        match sender {
            LegIndex::Inbound => ctx.leg1_contact = Some(contact),
            LegIndex::Outbound => ctx.leg2_contact = Some(contact),
        }
    }

    if services.config.features.local_100rel {
        apply_local_100rel(services, response, b2b);
    }

    if establishing {
        record_inbound_leg(services, response, b2b, &session_id);
    }
    if response.is_2xx() {
        services.dialogs.cache_2xx(&session_id, response.clone());
    }
}

/// Makes provisionals toward the UA reliable when it supports 100rel, and
/// carries held-back SDP into the final answer when it does not
fn apply_local_100rel(services: &Services, response: &mut SipMessage, b2b: &B2bTransaction) {
    let ua_supports = supports_100rel(&b2b.server_request());
    if response.is_1xx() {
        if ua_supports && response.to_tag().is_some() {
            let rseq = b2b.context().write().next_local_rseq();
            add_token(response, names::REQUIRE, "100rel");
            response.set_header(names::RSEQ, rseq.to_string());
            if !services.reliable.queue(response) {
                warn!(id = %b2b.id(), "Reliable provisional not queued");
            }
        } else {
            remove_token(response, names::REQUIRE, "100rel");
            response.remove_header(names::RSEQ);
            if response.has_body() {
                b2b.context().write().local_100rel_sdp = Some(response.body().to_string());
            }
        }
        return;
    }

    if let Some(call_id) = response.call_id() {
        services.reliable.remove(call_id, None);
    }
    if !ua_supports && response.is_2xx() && !response.has_body() {
        let held = b2b.context().write().local_100rel_sdp.take();
        if let Some(sdp) = held {
            response.set_header(names::CONTENT_TYPE, SDP_CONTENT_TYPE);
            response.set_body(sdp);
        }
    }
}

/// Records the leg toward the sender of the INVITE
fn record_inbound_leg(services: &Services, response: &SipMessage, b2b: &B2bTransaction, session_id: &str) {
    let ctx = b2b.context_snapshot();
    let server = b2b.server_request();

    if ctx.reinvite {
        let sender = ctx.leg_index.unwrap_or(LegIndex::Inbound);
        let updated = services.dialogs.update_leg(session_id, sender, |leg| {
            if response.has_body() {
                leg.local_sdp = Some(response.body().to_string());
            }
            if server.has_body() {
                leg.remote_sdp = Some(server.body().to_string());
            }
        });
        if let Err(e) = updated {
            warn!(%session_id, error = %e, "Failed to update dialog after re-INVITE");
        }
        return;
    }

    let existing = services.dialogs.find(session_id).and_then(|d| d.leg1);
    let local_sdp = if response.has_body() {
        Some(response.body().to_string())
    } else {
        existing.as_ref().and_then(|l| l.local_sdp.clone())
    };
    let leg = LegInfo {
        call_id: server.call_id().unwrap_or_default().to_string(),
        from: response.header(names::TO).unwrap_or_default().to_string(),
        to: server.header(names::FROM).unwrap_or_default().to_string(),
        remote_contact: server.header(names::CONTACT).unwrap_or_default().to_string(),
        local_contact: ctx
            .leg1_contact
            .or_else(|| response.header(names::CONTACT).map(str::to_string))
            .unwrap_or_default(),
        local_record_route: None,
        remote_ip: Some(b2b.source_address()),
        target_transport: b2b.source_transport(),
        local_sdp,
        remote_sdp: server.has_body().then(|| server.body().to_string()),
        route_set: server.header_values(names::RECORD_ROUTE).map(str::to_string).collect(),
        local_cseq: existing.as_ref().map_or(0, |l| l.local_cseq),
        invite_cseq: existing.as_ref().map_or(0, |l| l.invite_cseq),
        no_rtp_proxy: false,
    };
    if let Err(e) = services.dialogs.set_leg(session_id, LegIndex::Inbound, leg) {
        warn!(%session_id, error = %e, "Failed to record inbound leg");
    }
}

fn drop_failed_call(services: &Services, b2b: &B2bTransaction) {
    let ctx = b2b.context_snapshot();
    if let Some(call_id) = b2b.call_id() {
        services.reliable.remove(&call_id, None);
    }
    if ctx.reinvite {
        return;
    }
    if let Some(session_id) = ctx.session_id {
        if services.dialogs.remove_dialog(&session_id) {
            debug!(id = %b2b.id(), %session_id, "Dropped dialog of failed call");
        }
    }
}

fn transaction_error(
    services: &Services,
    error: Option<&TransactionError>,
    response: Option<&SipMessage>,
    b2b: &B2bTransaction,
) -> Option<SipMessage> {
    if let Some(error) = error {
        if let Ok(id) = b2b.server_request().transaction_id(None) {
            services.untrack_invite(&id);
        }
        let ctx = b2b.context_snapshot();
        if let (false, Some(session_id)) = (ctx.reinvite, ctx.session_id) {
            services.cdr.on_failed(&session_id, &error.to_string());
        }
        drop_failed_call(services, b2b);
    }
    default::transaction_error(error, response, b2b)
}

/// Carries an ACK for a 2xx across to the other leg
fn relay_ack(services: &Services, mut ack: SipMessage) {
    match services.dialogs.route_ack(&mut ack) {
        Ok(route) => {
            debug!(session_id = %route.session_id, target = %route.target, "Relaying ACK");
            services.send_detached(ack, route.local_interface, route.target);
        }
        Err(rejection) => debug!(call_id = ?ack.call_id(), reason = rejection.reason, "ACK dropped"),
    }
}

/// A retransmitted 2xx from the far end means our ACK has not reached it yet;
/// the UA gets the cached 2xx again so it repeats its ACK
fn resend_cached_2xx(services: &Services, response: SipMessage) {
    if !response.is_2xx() {
        return;
    }
    let Some(dialog) = response.call_id().and_then(|c| services.dialogs.find_by_call_id(c)) else {
        return;
    };
    let Some(cached) = services.dialogs.cached_2xx(&dialog.session_id) else {
        return;
    };
    let (Some(target), Some(local)) = (
        cached.property_addr(props::RESPONSE_TARGET),
        cached.property_addr(props::RESPONSE_INTERFACE),
    ) else {
        return;
    };
    debug!(session_id = %dialog.session_id, %target, "Retransmitting cached 2xx");
    services.send_detached(cached, local, target);
}
