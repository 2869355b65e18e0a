//! REGISTER behavior
//!
//! The UA's Contact is replaced with one the SBC mints on the outbound
//! interface, so the upstream registrar only ever learns SBC addresses. The
//! 2xx is mapped back before it reaches the UA and the accepted binding is
//! persisted through the [`Registrar`](crate::registrar::Registrar).
//!
//! Only the first binding of a REGISTER is relayed. A wildcard (`*`)
//! unregister passes through unchanged and drops the user's binding once the
//! registrar accepts it.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use sbc_sip_core::header::{self, names};
use sbc_sip_core::{SipMessage, SipUri};

use super::{Services, default};
use crate::b2bua::{B2bTransaction, Handler, MessageType, RouteOutcome};
use crate::registrar::{RegistrationRecord, registration_id, registration_id_of};

pub fn handler(services: &Arc<Services>) -> Handler {
    default::handler(services, MessageType::Register)
        .on_route({
            let services = services.clone();
            move |request, b2b| route(&services, request, b2b)
        })
        .on_process_response_outbound({
            let services = services.clone();
            move |response, b2b| process_response_outbound(&services, response, b2b)
        })
}

fn bindings(message: &SipMessage) -> Vec<String> {
    message
        .header_values(names::CONTACT)
        .flat_map(header::split_name_addrs)
        .map(str::to_string)
        .collect()
}

fn expires_param(binding: &str) -> Option<u32> {
    header::header_param(binding, "expires").and_then(|e| e.trim().parse().ok())
}

fn aor_user(message: &SipMessage) -> Option<String> {
    message
        .header(names::TO)
        .and_then(|to| header::uri_part(to).parse::<SipUri>().ok())
        .and_then(|uri| uri.user)
}

fn route(services: &Services, request: &mut SipMessage, b2b: &B2bTransaction) -> RouteOutcome {
    let outcome = default::route_out_of_dialog(services, request, b2b);
    let local = match &outcome {
        RouteOutcome::Forward { local_interface: Some(local), .. } => *local,
        _ => return outcome,
    };

    let Some(binding) = bindings(request).into_iter().next() else {
        return outcome;
    };
    if binding == "*" {
        return outcome;
    }

    let contact = header::uri_part(&binding).parse::<SipUri>();
    let (Some(user), Ok(contact)) = (aor_user(request), contact) else {
        return default::respond(&b2b.server_request(), 400, "Bad Request - Invalid Contact or To");
    };

    let expires = request
        .expires()
        .or_else(|| expires_param(&binding))
        .unwrap_or(services.config.registrar.default_expires);
    let id = registration_id(&user, &contact);
    let transport = b2b.context().read().target_transport.unwrap_or_default();

    let mut minted = SipUri::new(Some(id.as_str()), local.ip().to_string(), Some(local.port()));
    minted.set_param("transport", Some(&transport.to_string()));
    request.remove_header(names::CONTACT);
    request.set_header(names::CONTACT, format!("<{}>;expires={}", minted, expires));
    request.remove_header(names::EXPIRES);

    debug!(id = %b2b.id(), registration_id = %id, contact = %contact, expires, "Relaying registration");
    {
        let mut ctx = b2b.context().write();
        ctx.registration_id = Some(id);
        ctx.registered_contact = Some(contact.to_string());
    }
    outcome
}

fn process_response_outbound(services: &Services, response: &mut SipMessage, b2b: &B2bTransaction) {
    default::stamp_server(services, response);
    if !response.is_2xx() {
        return;
    }
    let server = b2b.server_request();
    let ctx = b2b.context_snapshot();

    if bindings(&server).first().is_some_and(|b| b == "*") {
        if let Some(record) = aor_user(&server).and_then(|user| services.registrar.find_by_user(&user)) {
            services.registrar.remove(&record.registration_id);
        }
        return;
    }

    let header_expires = response.expires();
    let mut granted = None;
    let mut rewritten = Vec::new();
    for binding in bindings(response) {
        let Some(id) = header::uri_part(&binding).parse::<SipUri>().ok().and_then(|uri| registration_id_of(&uri)) else {
            rewritten.push(binding);
            continue;
        };
        let expires = expires_param(&binding).or(header_expires);
        if ctx.registration_id.as_ref() == Some(&id) {
            let Some(contact) = &ctx.registered_contact else {
                continue;
            };
            let expires = expires.unwrap_or(services.config.registrar.default_expires);
            granted = Some(expires);
            rewritten.push(format!("<{}>;expires={}", contact, expires));
        } else if let Some(record) = services.registrar.find(&id) {
            rewritten.push(format!("<{}>;expires={}", record.contact, expires.unwrap_or(record.expires)));
        }
    }
    response.remove_header(names::CONTACT);
    for binding in rewritten {
        response.append_header(names::CONTACT, binding);
    }

    let (Some(id), Some(contact)) = (ctx.registration_id, ctx.registered_contact) else {
        return;
    };
    match granted {
        Some(expires) if expires > 0 => {
            let record = RegistrationRecord {
                registration_id: id,
                contact,
                aor: server.header(names::TO).map(|to| header::uri_part(to).to_string()).unwrap_or_default(),
                call_id: server.call_id().unwrap_or_default().to_string(),
                packet_source: b2b.source_address(),
                local_interface: b2b.local_address(),
                transport: b2b.source_transport(),
                expires,
                registered_at: Utc::now(),
            };
            if let Err(e) = services.registrar.save(&record) {
                warn!(registration_id = %record.registration_id, error = %e, "Failed to save registration");
            }
        }
        _ => {
            if services.registrar.remove(&id) {
                info!(registration_id = %id, "Binding released by registrar");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindings_split_across_headers() {
        let mut response = SipMessage::new("SIP/2.0 200 OK");
        response.set_header(names::CONTACT, "<sip:a@192.0.2.1>;expires=60, \"B, Jr\" <sip:b@192.0.2.2>");
        response.append_header(names::CONTACT, "<sip:c@192.0.2.3>");
        let all = bindings(&response);
        assert_eq!(all.len(), 3);
        assert_eq!(expires_param(&all[0]), Some(60));
        assert_eq!(header::uri_part(&all[1]), "sip:b@192.0.2.2");
        assert_eq!(expires_param(&all[2]), None);
    }

    #[test]
    fn aor_user_comes_from_to() {
        let mut request = SipMessage::request("REGISTER", "sip:example.com");
        request.set_header(names::TO, "\"Alice\" <sip:alice@example.com>");
        assert_eq!(aor_user(&request).as_deref(), Some("alice"));
        request.set_header(names::TO, "<sip:example.com>");
        assert_eq!(aor_user(&request), None);
    }
}
