//! NOTIFY behavior
//!
//! NOTIFYs are matched to a cached subscription by (Event, Call-ID) and sent
//! to the subscriber as if they came from the SBC's side of the subscription
//! dialog. A `Subscription-State: terminated` NOTIFY drops the cache entry.

use std::sync::Arc;

use tracing::{debug, info};

use sbc_sip_core::header::{self, names};
use sbc_sip_core::{SipMessage, TransportType, props};

use super::{Services, default};
use crate::b2bua::{B2bTransaction, Handler, MessageType, RouteOutcome};
use crate::contact::{derived_branch, replace_via, strip_topology};
use crate::subscription::subscription_key;

pub fn handler(services: &Arc<Services>) -> Handler {
    default::handler(services, MessageType::Notify).on_route({
        let services = services.clone();
        move |request, b2b| route(&services, request, b2b)
    })
}

fn route(services: &Services, request: &mut SipMessage, b2b: &B2bTransaction) -> RouteOutcome {
    let (Some(event), Some(call_id)) = (
        request.header(names::EVENT).map(str::to_string),
        request.call_id().map(str::to_string),
    ) else {
        return default::respond(request, 400, "Bad Event Header");
    };
    let Some(subscription) = services.subscriptions.find_by(&event, &call_id) else {
        debug!(id = %b2b.id(), %event, %call_id, "NOTIFY without subscription");
        return default::respond(request, 404, "Subscription Does Not Exist");
    };
    let (Some(local), Some(target)) = (subscription.notify_local_address, subscription.notify_target_address) else {
        return default::respond(request, 404, "Subscription Does Not Exist");
    };

    let branch = request.via_branch();
    if branch.is_empty() {
        return default::respond(request, 400, "Missing Via Branch Parameter");
    }

    let subscribe = &subscription.request;
    let subscriber = subscribe
        .header(names::CONTACT)
        .or_else(|| subscribe.header(names::FROM))
        .map(|v| header::uri_part(v).to_string())
        .unwrap_or_default();
    if request.set_request_uri(&subscriber).is_err() {
        return default::respond(request, 404, "Subscription Does Not Exist");
    }
    if let Some(from) = &subscription.notify_from_uri {
        request.set_header(names::FROM, from.clone());
    }
    if let Some(to) = subscribe.header(names::FROM) {
        request.set_header(names::TO, to.to_string());
    }
    if let Some(contact) = &subscription.notify_local_contact {
        request.set_header(names::CONTACT, contact.clone());
    }

    let transport = subscribe
        .property(props::SOURCE_TRANSPORT)
        .and_then(|t| t.parse::<TransportType>().ok())
        .unwrap_or_default();
    strip_topology(request);
    replace_via(request, transport, local, &derived_branch(&branch));
    for route in subscribe.header_values(names::RECORD_ROUTE) {
        request.append_header(names::ROUTE, route.to_string());
    }
    b2b.context().write().target_transport = Some(transport);

    let terminated = request
        .header(names::SUBSCRIPTION_STATE)
        .is_some_and(|state| state.trim().to_ascii_lowercase().starts_with("terminated"));
    if terminated && services.subscriptions.expire(&subscription_key(&event, &call_id)) {
        info!(%event, %call_id, "Subscription terminated by notifier");
    }

    debug!(id = %b2b.id(), %event, %target, "Routing NOTIFY to subscriber");
    RouteOutcome::Forward { local_interface: Some(local), target }
}
