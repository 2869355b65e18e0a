//! REFER behavior and transfer retargeting
//!
//! A REFER whose route asks for retargeting gets its Refer-To replaced with
//! `sip:xfer-<id>@<host>`, where `host` is the retarget host of the route.
//! The transferee's INVITE for that URI comes back through the SBC, and
//! [`retarget_transfer`] restores the original Refer-To target, including a
//! `Replaces` carried in its URI headers.

use std::sync::Arc;

use tracing::{debug, info};

use sbc_sip_core::header::{self, generate_tag, names};
use sbc_sip_core::{SipMessage, SipUri};

use super::{Services, default};
use crate::b2bua::{B2bTransaction, Handler, MessageType, RouteOutcome};
use crate::contact::transform_contact;
use crate::context::LegIndex;

pub const XFER_PREFIX: &str = "xfer-";
/// Present on a REFER that must be forwarded without retargeting
pub const BRIDGE_RETARGET_HEADER: &str = "X-Bridge-Retarget";
/// Carries the original Refer-To of a retargeted REFER
pub const RETARGET_HEADER: &str = "X-SBC-Retarget";

pub fn handler(services: &Arc<Services>) -> Handler {
    default::handler(services, MessageType::Refer)
        .on_route({
            let services = services.clone();
            move |request, b2b| route(&services, request, b2b)
        })
        .on_process_response_outbound({
            let services = services.clone();
            move |response, b2b| {
                default::stamp_server(&services, response);
                transform_response_contact(response, b2b);
            }
        })
}

fn route(services: &Services, request: &mut SipMessage, b2b: &B2bTransaction) -> RouteOutcome {
    let outcome = default::route(services, request, b2b);
    if !matches!(outcome, RouteOutcome::Forward { .. }) || request.has_header(BRIDGE_RETARGET_HEADER) {
        return outcome;
    }
    let Some(refer_to) = request.header(names::REFER_TO).map(str::to_string) else {
        return outcome;
    };

    let configured = b2b.context().read().route_flags.retarget_refer.clone();
    let host = configured.or_else(|| {
        let uri = header::uri_part(&refer_to).parse::<SipUri>().ok()?;
        services.route_policy().route(request, &uri)?.retarget_refer
    });
    let Some(host) = host else {
        return outcome;
    };

    let id = format!("{}{}", XFER_PREFIX, generate_tag());
    info!(id = %b2b.id(), xfer = %id, %host, "Retargeting REFER");
    services.remember_refer_target(id.clone(), refer_to.clone());
    request.set_header(names::REFER_TO, format!("<sip:{}@{}>", id, host));
    request.set_header(RETARGET_HEADER, refer_to);
    outcome
}

/// Restores the original Refer-To target on an INVITE for an `xfer-` user.
///
/// Returns whether the request was retargeted.
pub fn retarget_transfer(services: &Services, request: &mut SipMessage) -> bool {
    let Some(user) = request
        .request_uri()
        .and_then(|u| u.parse::<SipUri>().ok())
        .and_then(|u| u.user)
        .filter(|user| user.starts_with(XFER_PREFIX))
    else {
        return false;
    };
    let Some(refer_to) = services.refer_target(&user) else {
        debug!(%user, "Unknown transfer target");
        return false;
    };
    let Ok(mut target) = header::uri_part(&refer_to).parse::<SipUri>() else {
        return false;
    };

    if let Some(replaces) = target.headers.take().and_then(|h| uri_header(&h, names::REPLACES)) {
        request.set_header(names::REPLACES, replaces);
    }
    let mut identity = SipUri::new(target.user.as_deref(), target.host.clone(), target.port);
    identity.scheme = target.scheme.clone();
    request.set_header(names::TO, format!("<{}>", identity));
    if request.set_request_uri(&target.to_string()).is_err() {
        return false;
    }
    info!(%user, target = %target, "Transfer retargeted");
    true
}

/// Value of `name` in the `?`-headers of a URI, percent-decoded
fn uri_header(headers: &str, name: &str) -> Option<String> {
    headers.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        key.trim().eq_ignore_ascii_case(name).then(|| percent_decode(value))
    })
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Rewrites the Contact of a mid-dialog response toward the request sender
pub(crate) fn transform_response_contact(response: &mut SipMessage, b2b: &B2bTransaction) {
    if response.is_error_response() || response.is_1xx_code(100) {
        return;
    }
    let ctx = b2b.context_snapshot();
    let Some(session_id) = ctx.session_id else {
        return;
    };
    transform_contact(
        response,
        b2b.local_address(),
        b2b.source_transport(),
        &session_id,
        ctx.leg_index.unwrap_or(LegIndex::Inbound),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_is_decoded_from_uri_headers() {
        let headers = "Replaces=abc%40host%3Bto-tag%3D1%3Bfrom-tag%3D2&Priority=urgent";
        assert_eq!(
            uri_header(headers, "replaces").as_deref(),
            Some("abc@host;to-tag=1;from-tag=2")
        );
        assert_eq!(uri_header(headers, "Priority").as_deref(), Some("urgent"));
        assert!(uri_header(headers, "Subject").is_none());
    }

    #[test]
    fn malformed_escapes_are_kept() {
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz%41"), "%zzA");
    }
}
