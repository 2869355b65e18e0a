//! Topology hiding helpers
//!
//! The SBC replaces every Contact it relays with one of its own listeners.
//! The replacement carries the session id and the leg index as URI
//! parameters so a later mid-dialog request addressed to that Contact can be
//! matched to its dialog without any other state:
//!
//! ```text
//! <sip:alice@192.0.2.1:5060;transport=udp;sbc-session-id=4f2a..;sbc-call-index=1>
//! ```

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use sbc_sip_core::header::{self, BRANCH_MAGIC_COOKIE, names};
use sbc_sip_core::{SipMessage, SipUri, TransportType, Via};

use crate::context::LegIndex;

pub const SESSION_ID_PARAM: &str = "sbc-session-id";
pub const CALL_INDEX_PARAM: &str = "sbc-call-index";

pub(crate) fn hash_of(value: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// New session id for a call, mixing the Call-ID with randomness
pub fn generate_session_id(call_id: &str) -> String {
    format!("{:016x}{:08x}", hash_of(call_id), fastrand::u32(..))
}

/// Branch for the outbound copy of a request, derived from the inbound branch
pub fn derived_branch(inbound_branch: &str) -> String {
    format!("{}{:016x}", BRANCH_MAGIC_COOKIE, hash_of(&format!("{}-b2b", inbound_branch)))
}

/// `SIP/2.0/<T> host:port;branch=..;rport`
pub fn construct_via(transport: TransportType, local: SocketAddr, branch: &str) -> String {
    let mut via = Via::new(transport.via_token(), local.ip().to_string(), Some(local.port()), branch);
    via.set_param("rport", None);
    via.to_string()
}

/// Replaces the Via stack with a single Via for `local`
pub fn replace_via(message: &mut SipMessage, transport: TransportType, local: SocketAddr, branch: &str) {
    message.remove_header(names::VIA);
    message.prepend_header(names::VIA, construct_via(transport, local, branch));
}

/// Removes the headers that would leak the inbound leg's topology
pub fn strip_topology(message: &mut SipMessage) {
    message.remove_header(names::VIA);
    message.remove_header(names::ROUTE);
    message.remove_header(names::RECORD_ROUTE);
}

/// Contact URI the SBC presents on one leg of a session
pub fn build_contact_uri(
    user: Option<&str>,
    local: SocketAddr,
    transport: TransportType,
    session_id: &str,
    index: LegIndex,
) -> SipUri {
    let mut uri = SipUri::new(user, local.ip().to_string(), Some(local.port()));
    uri.set_param("transport", Some(&transport.to_string()));
    uri.set_param(SESSION_ID_PARAM, Some(session_id));
    uri.set_param(CALL_INDEX_PARAM, Some(&index.number().to_string()));
    uri
}

/// Swaps the message's Contact for one pointing at `local`.
///
/// The user part comes from the From URI on requests and the To URI on
/// responses; a display name on the old Contact is kept. Returns the new
/// Contact value.
pub fn transform_contact(
    message: &mut SipMessage,
    local: SocketAddr,
    transport: TransportType,
    session_id: &str,
    index: LegIndex,
) -> String {
    let identity = if message.is_request() { names::FROM } else { names::TO };
    let user = message
        .header(identity)
        .and_then(|v| header::uri_part(v).parse::<SipUri>().ok())
        .and_then(|u| u.user);
    let display = message
        .header(names::CONTACT)
        .and_then(|c| c.find('<').map(|open| c[..open].trim().to_string()))
        .filter(|d| !d.is_empty());

    let uri = build_contact_uri(user.as_deref(), local, transport, session_id, index);
    let contact = match display {
        Some(display) => format!("{} <{}>", display, uri),
        None => format!("<{}>", uri),
    };
    message.remove_header(names::CONTACT);
    message.prepend_header(names::CONTACT, contact.clone());
    contact
}

/// Session id and leg index carried by a mid-dialog request.
///
/// Looks at the Request-URI first and then at the top Route.
pub fn session_info(request: &SipMessage) -> Option<(String, LegIndex)> {
    let from_uri = |uri: &SipUri| {
        let session_id = uri.param(SESSION_ID_PARAM).filter(|s| !s.is_empty())?;
        let index = uri.param(CALL_INDEX_PARAM)?.parse::<u8>().ok()?;
        Some((session_id.to_string(), LegIndex::from_number(index)?))
    };

    if let Some(uri) = request.request_uri().and_then(|u| u.parse::<SipUri>().ok()) {
        if let Some(info) = from_uri(&uri) {
            return Some(info);
        }
    }
    request
        .header(names::ROUTE)
        .and_then(|r| header::uri_part(r).parse::<SipUri>().ok())
        .and_then(|uri| from_uri(&uri))
}
