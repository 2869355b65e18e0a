//! BYE behavior
//!
//! BYE clears the call's connect time on both Call-IDs when it is forwarded
//! and drops the dialog, closing its call record, once the far end accepts
//! it. A challenge (401/407)
//! leaves the dialog in place so the UA can retry with credentials.

use std::sync::Arc;

use tracing::debug;

use sbc_sip_core::SipMessage;
use sbc_transaction_core::TransactionError;

use super::{Services, default};
use crate::b2bua::{B2bTransaction, Handler, MessageType, RouteOutcome};

pub fn handler(services: &Arc<Services>) -> Handler {
    default::handler(services, MessageType::Bye)
        .on_route({
            let services = services.clone();
            move |request, b2b| route(&services, request, b2b)
        })
        .on_process_outbound({
            let services = services.clone();
            move |request, b2b| {
                default::stamp_user_agent(&services, request);
                let server_call_id = b2b.call_id();
                let client_call_id = request.call_id().map(str::to_string);
                for call_id in [server_call_id, client_call_id].into_iter().flatten() {
                    services.call_timers.remove_call_start(&call_id);
                }
            }
        })
        .on_process_response_inbound({
            let services = services.clone();
            move |response, b2b| {
                if response.is_2xx() {
                    remove_dialog(&services, b2b);
                }
            }
        })
        .on_transaction_error({
            let services = services.clone();
            move |error, response, b2b| transaction_error(&services, error, response, b2b)
        })
}

fn route(services: &Services, request: &mut SipMessage, b2b: &B2bTransaction) -> RouteOutcome {
    if !request.is_mid_dialog() {
        return default::respond(request, 400, "BYE Outside Of Dialog");
    }
    default::route_mid_dialog(services, request, b2b)
}

fn remove_dialog(services: &Services, b2b: &B2bTransaction) {
    let Some(session_id) = b2b.context().read().session_id.clone() else {
        return;
    };
    if services.dialogs.remove_dialog(&session_id) {
        debug!(id = %b2b.id(), %session_id, "Dialog ended");
    }
    services.cdr.on_terminated(&session_id);
}

fn transaction_error(
    services: &Services,
    error: Option<&TransactionError>,
    response: Option<&SipMessage>,
    b2b: &B2bTransaction,
) -> Option<SipMessage> {
    let challenged = response.and_then(SipMessage::status_code).is_some_and(|code| code == 401 || code == 407);
    if !challenged {
        remove_dialog(services, b2b);
    }
    default::transaction_error(error, response, b2b)
}
