//! PRACK behavior
//!
//! With local 100rel the SBC is the endpoint of every PRACK: the UA's PRACK
//! acknowledges a provisional the SBC made reliable, so it is answered here
//! and only stops the retransmission. Otherwise PRACK is an ordinary
//! mid-dialog request.

use std::sync::Arc;

use tracing::debug;

use sbc_sip_core::SipMessage;
use sbc_sip_core::header::names;

use super::{Services, default};
use crate::b2bua::{B2bTransaction, Handler, MessageType, RouteOutcome};

pub fn handler(services: &Arc<Services>) -> Handler {
    default::handler(services, MessageType::Prack).on_route({
        let services = services.clone();
        move |request, b2b| route(&services, request, b2b)
    })
}

/// RSeq, CSeq number and method of a RAck value
pub fn parse_rack(value: &str) -> Option<(u32, u32, String)> {
    let mut parts = value.split_whitespace();
    let rseq = parts.next()?.parse().ok()?;
    let cseq = parts.next()?.parse().ok()?;
    let method = parts.next()?.to_ascii_uppercase();
    parts.next().is_none().then_some((rseq, cseq, method))
}

fn route(services: &Services, request: &mut SipMessage, b2b: &B2bTransaction) -> RouteOutcome {
    if !request.is_mid_dialog() {
        return default::respond(request, 400, "PRACK Outside Of Dialog");
    }
    if !services.config.features.local_100rel {
        return default::route_mid_dialog(services, request, b2b);
    }

    if request.has_body() {
        return default::respond(request, 406, "SDP in PRACK Unsupported");
    }
    let Some(rack) = request.header(names::RACK) else {
        return default::respond(request, 400, "Missing RAck Header");
    };
    let Some((rseq, _, _)) = parse_rack(rack) else {
        return default::respond(request, 400, "Malformed RAck Header");
    };

    let call_id = request.call_id().unwrap_or_default().to_string();
    let acknowledged = services.reliable.remove(&call_id, Some(rseq));
    debug!(id = %b2b.id(), %call_id, rseq, acknowledged, "PRACK answered locally");
    default::respond(request, 200, "OK")
}
