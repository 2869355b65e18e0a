//! CANCEL behavior
//!
//! A CANCEL is answered hop by hop by the transaction layer; what goes out on
//! the far leg is built from the INVITE that was forwarded there, so it
//! matches that INVITE's Call-ID, From, To, CSeq number and Via branch.

use std::sync::Arc;

use tracing::debug;

use sbc_sip_core::header::names;
use sbc_sip_core::{SipMessage, props};

use super::{Services, default};
use crate::b2bua::{B2bTransaction, Handler, MessageType, RouteOutcome, TARGET_ADDRESS};

/// Headers of the forwarded INVITE that have no place in its CANCEL
const DROPPED_HEADERS: [&str; 7] = [
    names::CONTENT_TYPE,
    names::MIN_SE,
    names::SESSION_EXPIRES,
    names::AUTHORIZATION,
    names::PROXY_AUTHORIZATION,
    names::ALLOW,
    names::SUPPORTED,
];

pub fn handler(services: &Arc<Services>) -> Handler {
    default::handler(services, MessageType::Cancel).on_route({
        let services = services.clone();
        move |request, b2b| route(&services, request, b2b)
    })
}

fn route(services: &Services, request: &mut SipMessage, b2b: &B2bTransaction) -> RouteOutcome {
    let invite = request
        .transaction_id(Some("invite"))
        .ok()
        .and_then(|id| services.pending_invite(&id));
    let Some(invite) = invite else {
        debug!(id = %b2b.id(), call_id = ?request.call_id(), "CANCEL matches no pending INVITE");
        return default::respond(request, 481, "Call/Transaction Does Not Exist");
    };
    let (Some(local), Some(target)) = (
        invite.property_addr(props::LOCAL_ADDRESS),
        invite.property_addr(TARGET_ADDRESS),
    ) else {
        return default::respond(request, 481, "Call/Transaction Does Not Exist");
    };

    match build_cancel(&invite) {
        Some(cancel) => {
            *request = cancel;
            RouteOutcome::Forward { local_interface: Some(local), target }
        }
        None => default::respond(request, 500, "Unable To Build CANCEL"),
    }
}

/// CANCEL for a forwarded INVITE
pub fn build_cancel(invite: &SipMessage) -> Option<SipMessage> {
    let mut cancel = invite.clone();
    cancel.set_method("CANCEL").ok()?;
    let number = invite.cseq()?.number;
    cancel.set_header(names::CSEQ, format!("{} CANCEL", number));
    cancel.set_body(String::new());
    for name in DROPPED_HEADERS {
        cancel.remove_header(name);
    }
    Some(cancel)
}
