//! UPDATE behavior
//!
//! With `local_update` an UPDATE is answered by the SBC from the session
//! descriptions it already holds for the dialog. The offer's `o=` session id
//! tells which side sent it; the answer is the description last given to
//! that side.

use std::sync::Arc;

use tracing::debug;

use sbc_sip_core::SipMessage;
use sbc_sip_core::header::names;

use super::{Services, default};
use crate::b2bua::{B2bTransaction, Handler, MessageType, RouteOutcome};
use crate::dialog_state::LegInfo;

pub fn handler(services: &Arc<Services>) -> Handler {
    default::handler(services, MessageType::Update)
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

/// Session id of the `o=` line of an SDP body
pub fn sdp_session_id(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix("o="))
        .and_then(|origin| origin.split_whitespace().nth(1))
}

fn route(services: &Services, request: &mut SipMessage, b2b: &B2bTransaction) -> RouteOutcome {
    if !services.config.features.local_update {
        return default::route(services, request, b2b);
    }
    let Some((dialog, _)) = services.dialogs.find_dialog_for(request) else {
        return default::respond(request, 481, "Call/Transaction Does Not Exist");
    };
    if !request.has_body() {
        return default::respond(request, 200, "OK");
    }

    let local_sdp = |leg: Option<&LegInfo>| leg.and_then(|l| l.local_sdp.clone());
    let (Some(leg1_sdp), Some(leg2_sdp)) = (local_sdp(dialog.leg1.as_ref()), local_sdp(dialog.leg2.as_ref()))
    else {
        return default::respond(request, 500, "Unable To Generate Media Description");
    };

    let offered = sdp_session_id(request.body());
    let answer = if offered.is_some() && offered == sdp_session_id(&leg1_sdp) {
        leg2_sdp
    } else if offered.is_some() && offered == sdp_session_id(&leg2_sdp) {
        leg1_sdp
    } else {
        return default::respond(request, 488, "Invalid Session-ID in SDP");
    };

    let Ok(mut response) = request.create_response(200, None) else {
        return default::respond(request, 500, "Unable To Generate Media Description");
    };
    response.set_header(names::CONTENT_TYPE, "application/sdp");
    response.set_body(answer);
    default::stamp_server(services, &mut response);
    debug!(id = %b2b.id(), session_id = %dialog.session_id, "UPDATE answered locally");
    RouteOutcome::Respond(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_session_id() {
        let sdp = "v=0\r\no=alice 2890844526 2890844527 IN IP4 192.0.2.5\r\ns=-\r\n";
        assert_eq!(sdp_session_id(sdp), Some("2890844526"));
        assert_eq!(sdp_session_id("v=0\r\ns=-\r\n"), None);
    }
}
