//! Dialog state for calls bridged by the SBC
//!
//! Every established dialog is recorded with both of its legs: the inbound
//! leg facing the UA that placed the call and the outbound leg facing the far
//! end. For each leg the record keeps what the SBC needs to originate requests
//! on it (Call-ID, From/To as the SBC sends them, remote Contact, the SBC's
//! own Contact, route set, CSeq). Records are cached in memory and persisted
//! as JSON through the [`KeyValueStore`], keyed by session id.
//!
//! Mid-dialog requests find their record through the `sbc-session-id` and
//! `sbc-call-index` parameters of the Contact the SBC handed out, falling
//! back to Call-ID and tag matching.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sbc_sip_core::header::{self, generate_branch, names};
use sbc_sip_core::{SipMessage, SipUri, TransportTable, TransportType};

use crate::contact::{construct_via, derived_branch, session_info};
use crate::context::LegIndex;
use crate::error::Result;
use crate::store::KeyValueStore;

const STORE_PREFIX: &str = "dialog-";

/// One side of a bridged dialog, as seen by the SBC
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegInfo {
    pub call_id: String,
    /// From header of requests the SBC sends on this leg
    pub from: String,
    /// To header of requests the SBC sends on this leg
    pub to: String,
    /// Contact of the peer on this leg
    pub remote_contact: String,
    /// Contact the SBC presented on this leg
    pub local_contact: String,
    pub local_record_route: Option<String>,
    /// Packet source of the peer, used when its Contact is unreachable
    pub remote_ip: Option<SocketAddr>,
    pub target_transport: TransportType,
    pub local_sdp: Option<String>,
    pub remote_sdp: Option<String>,
    pub route_set: Vec<String>,
    /// Last CSeq number the SBC used on this leg
    pub local_cseq: u32,
    /// CSeq of the last INVITE sent on this leg; ACKs for its 2xx reuse it
    #[serde(default)]
    pub invite_cseq: u32,
    pub no_rtp_proxy: bool,
}

impl LegInfo {
    /// Tag of the peer on this leg
    pub fn remote_tag(&self) -> Option<String> {
        header::tag(&self.to)
    }

    pub fn local_tag(&self) -> Option<String> {
        header::tag(&self.from)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogData {
    pub session_id: String,
    pub leg1: Option<LegInfo>,
    pub leg2: Option<LegInfo>,
    pub created_at: DateTime<Utc>,
}

impl DialogData {
    pub fn new(session_id: impl Into<String>) -> Self {
        DialogData {
            session_id: session_id.into(),
            leg1: None,
            leg2: None,
            created_at: Utc::now(),
        }
    }

    pub fn leg(&self, index: LegIndex) -> Option<&LegInfo> {
        match index {
            LegIndex::Inbound => self.leg1.as_ref(),
            LegIndex::Outbound => self.leg2.as_ref(),
        }
    }

    pub fn leg_mut(&mut self, index: LegIndex) -> &mut Option<LegInfo> {
        match index {
            LegIndex::Inbound => &mut self.leg1,
            LegIndex::Outbound => &mut self.leg2,
        }
    }

    /// Leg a request with the given From tag was sent on
    fn sender_by_tag(&self, from_tag: &str) -> Option<LegIndex> {
        [LegIndex::Inbound, LegIndex::Outbound]
            .into_iter()
            .find(|index| {
                self.leg(*index)
                    .and_then(LegInfo::remote_tag)
                    .is_some_and(|tag| tag == from_tag)
            })
    }
}

/// A SIP-level refusal: the caller answers the request with it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub code: u16,
    pub reason: &'static str,
}

impl Rejection {
    pub const fn new(code: u16, reason: &'static str) -> Self {
        Rejection { code, reason }
    }

    /// Builds the response to `request`
    pub fn respond_to(&self, request: &SipMessage) -> Option<SipMessage> {
        request.create_response(self.code, Some(self.reason)).ok()
    }
}

/// Where a request rewritten onto the other leg must go
#[derive(Debug, Clone, PartialEq)]
pub struct DialogRoute {
    pub session_id: String,
    /// Leg the request arrived on
    pub sender: LegIndex,
    pub local_interface: SocketAddr,
    pub target: SocketAddr,
    pub transport: TransportType,
}

#[derive(Debug, Clone, Copy)]
enum CSeqMode {
    /// Next number on the target leg
    Next,
    /// The target leg's current number (ACK)
    Current,
}

pub struct DialogStateManager {
    dialogs: DashMap<String, DialogData>,
    by_call_id: DashMap<String, String>,
    ok_cache: DashMap<String, SipMessage>,
    store: Arc<dyn KeyValueStore>,
    transports: Arc<TransportTable>,
}

impl DialogStateManager {
    pub fn new(store: Arc<dyn KeyValueStore>, transports: Arc<TransportTable>) -> Self {
        DialogStateManager {
            dialogs: DashMap::new(),
            by_call_id: DashMap::new(),
            ok_cache: DashMap::new(),
            store,
            transports,
        }
    }

    /// Reloads persisted dialogs into the cache; returns how many were loaded
    pub fn load(&self) -> Result<usize> {
        let mut loaded = 0;
        for (key, value) in self.store.get_records(&format!("{}*", STORE_PREFIX))? {
            match serde_json::from_str::<DialogData>(&value) {
                Ok(dialog) => {
                    self.index(&dialog);
                    self.dialogs.insert(dialog.session_id.clone(), dialog);
                    loaded += 1;
                }
                Err(e) => warn!(%key, error = %e, "Skipping unreadable dialog record"),
            }
        }
        info!(loaded, "Loaded persisted dialogs");
        Ok(loaded)
    }

    fn index(&self, dialog: &DialogData) {
        for leg in [&dialog.leg1, &dialog.leg2].into_iter().flatten() {
            if !leg.call_id.is_empty() {
                self.by_call_id.insert(leg.call_id.clone(), dialog.session_id.clone());
            }
        }
    }

    fn persist(&self, dialog: &DialogData) -> Result<()> {
        let json = serde_json::to_string(dialog)?;
        self.store.put(&format!("{}{}", STORE_PREFIX, dialog.session_id), &json)
    }

    /// Inserts or replaces a dialog record
    pub fn add_dialog(&self, dialog: DialogData) -> Result<()> {
        self.persist(&dialog)?;
        self.index(&dialog);
        debug!(session_id = %dialog.session_id, "Dialog recorded");
        self.dialogs.insert(dialog.session_id.clone(), dialog);
        Ok(())
    }

    /// Sets one leg of a dialog, creating the record when needed
    pub fn set_leg(&self, session_id: &str, index: LegIndex, leg: LegInfo) -> Result<()> {
        let mut dialog = self.find(session_id).unwrap_or_else(|| DialogData::new(session_id));
        *dialog.leg_mut(index) = Some(leg);
        self.add_dialog(dialog)
    }

    /// Applies `update` to one leg; returns false when the leg does not exist
    pub fn update_leg<F>(&self, session_id: &str, index: LegIndex, update: F) -> Result<bool>
    where
        F: FnOnce(&mut LegInfo),
    {
        let Some(mut dialog) = self.find(session_id) else {
            return Ok(false);
        };
        let Some(leg) = dialog.leg_mut(index).as_mut() else {
            return Ok(false);
        };
        update(leg);
        self.add_dialog(dialog)?;
        Ok(true)
    }

    pub fn find(&self, session_id: &str) -> Option<DialogData> {
        self.dialogs.get(session_id).map(|d| d.clone())
    }

    pub fn find_by_call_id(&self, call_id: &str) -> Option<DialogData> {
        let session_id = self.by_call_id.get(call_id).map(|s| s.clone())?;
        self.find(&session_id)
    }

    pub fn has_call_id(&self, call_id: &str) -> bool {
        self.by_call_id.contains_key(call_id)
    }

    pub fn remove_dialog(&self, session_id: &str) -> bool {
        let Some((_, dialog)) = self.dialogs.remove(session_id) else {
            return false;
        };
        for leg in [&dialog.leg1, &dialog.leg2].into_iter().flatten() {
            self.by_call_id.remove(&leg.call_id);
        }
        self.ok_cache.remove(session_id);
        if let Err(e) = self.store.del(&format!("{}{}", STORE_PREFIX, session_id)) {
            warn!(%session_id, error = %e, "Failed to delete dialog record");
        }
        debug!(%session_id, "Dialog removed");
        true
    }

    pub fn remove_by_call_id(&self, call_id: &str) -> bool {
        let session_id = self.by_call_id.get(call_id).map(|s| s.clone());
        match session_id {
            Some(session_id) => self.remove_dialog(&session_id),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogs.is_empty()
    }

    /// Remembers the 2xx relayed to the inbound leg for retransmission
    pub fn cache_2xx(&self, session_id: &str, response: SipMessage) {
        self.ok_cache.insert(session_id.to_string(), response);
    }

    pub fn cached_2xx(&self, session_id: &str) -> Option<SipMessage> {
        self.ok_cache.get(session_id).map(|r| r.clone())
    }

    /// Dialog and sending leg of a mid-dialog request
    pub fn find_dialog_for(&self, request: &SipMessage) -> Option<(DialogData, LegIndex)> {
        if let Some((session_id, sender)) = session_info(request) {
            return self.find(&session_id).map(|d| (d, sender));
        }
        let dialog = self.find_by_call_id(request.call_id()?)?;
        let sender = dialog.sender_by_tag(&request.from_tag()?)?;
        Some((dialog, sender))
    }

    /// Rewrites a mid-dialog request onto the other leg of its dialog.
    ///
    /// Dialog identifiers, CSeq, Contact, Via and the route set are replaced
    /// with the target leg's; the returned route names the interface and the
    /// address to send to.
    pub fn route_mid_dialog(&self, request: &mut SipMessage) -> std::result::Result<DialogRoute, Rejection> {
        let branch = request.via_branch();
        if branch.is_empty() {
            return Err(Rejection::new(400, "Missing Via Branch Parameter"));
        }
        self.retarget(request, &derived_branch(&branch), CSeqMode::Next)
    }

    /// Rewrites an ACK for a 2xx onto the other leg
    pub fn route_ack(&self, ack: &mut SipMessage) -> std::result::Result<DialogRoute, Rejection> {
        match ack.max_forwards() {
            Some(0) => return Err(Rejection::new(483, "Too Many Hops")),
            Some(n) => ack.set_header(names::MAX_FORWARDS, (n - 1).to_string()),
            None => ack.set_header(names::MAX_FORWARDS, "70"),
        }
        self.retarget(ack, &generate_branch(), CSeqMode::Current)
    }

    fn retarget(
        &self,
        request: &mut SipMessage,
        branch: &str,
        mode: CSeqMode,
    ) -> std::result::Result<DialogRoute, Rejection> {
        if request.request_uri().and_then(|u| u.parse::<SipUri>().ok()).is_none() {
            return Err(Rejection::new(400, "Bad Request URI"));
        }
        let method = request.method().unwrap_or_default().to_string();
        let Some((dialog, sender)) = self.find_dialog_for(request) else {
            return Err(Rejection::new(481, "Unable to match dialog"));
        };
        let target_index = sender.other();
        let Some(target) = dialog.leg(target_index).cloned() else {
            return Err(Rejection::new(481, "Unable to match dialog"));
        };

        let inbound_seq = request.cseq().map(|c| c.number).unwrap_or_default();
        let seq = match mode {
            CSeqMode::Current if target.invite_cseq > 0 => target.invite_cseq,
            CSeqMode::Current => target.local_cseq,
            CSeqMode::Next if inbound_seq > target.local_cseq => inbound_seq,
            CSeqMode::Next => target.local_cseq + 1,
        };
        if matches!(mode, CSeqMode::Next) {
            let is_invite = method == "INVITE";
            let persisted = self.update_leg(&dialog.session_id, target_index, |leg| {
                leg.local_cseq = seq;
                if is_invite {
                    leg.invite_cseq = seq;
                }
            });
            if let Err(e) = persisted {
                warn!(session_id = %dialog.session_id, error = %e, "Failed to persist CSeq");
            }
        }

        for name in [
            names::CALL_ID,
            names::FROM,
            names::TO,
            names::CSEQ,
            names::CONTACT,
            names::VIA,
            names::ROUTE,
            names::RECORD_ROUTE,
        ] {
            request.remove_header(name);
        }

        let remote_uri = header::uri_part(&target.remote_contact).to_string();
        if request.set_request_uri(&remote_uri).is_err() {
            return Err(Rejection::new(481, "Unable to determine dialog target"));
        }
        request.set_header(names::FROM, target.from.clone());
        request.set_header(names::TO, target.to.clone());
        request.set_header(names::CALL_ID, target.call_id.clone());
        request.set_header(names::CSEQ, format!("{} {}", seq, method));
        if !target.local_contact.is_empty() && method != "ACK" {
            request.set_header(names::CONTACT, target.local_contact.clone());
        }
        if let Some(rr) = &target.local_record_route {
            request.set_header(names::RECORD_ROUTE, rr.clone());
        }

        let local_interface = header::uri_part(&target.local_contact)
            .parse::<SipUri>()
            .ok()
            .and_then(|u| u.socket_addr())
            .filter(|addr| self.transports.is_local(addr))
            .or_else(|| self.transports.default_for(target.target_transport))
            .ok_or(Rejection::new(500, "Unable to determine local interface"))?;
        request.prepend_header(
            names::VIA,
            construct_via(target.target_transport, local_interface, branch),
        );

        let destination = match target.route_set.first() {
            Some(top) => {
                let top_uri = header::uri_part(top).parse::<SipUri>().ok();
                let loose = top_uri.as_ref().is_some_and(|u| u.param("lr").is_some());
                if loose {
                    for route in &target.route_set {
                        request.append_header(names::ROUTE, route.clone());
                    }
                } else {
                    // Strict router: it becomes the Request-URI, the remote target the last Route
                    let _ = request.set_request_uri(header::uri_part(top));
                    for route in target.route_set.iter().skip(1) {
                        request.append_header(names::ROUTE, route.clone());
                    }
                    request.append_header(names::ROUTE, format!("<{}>", remote_uri));
                }
                top_uri.and_then(|u| u.socket_addr())
            }
            None => {
                let contact = remote_uri.parse::<SipUri>().ok().and_then(|u| u.socket_addr());
                match contact {
                    Some(addr)
                        if !(header::is_private_ip(&addr.ip())
                            && target.target_transport == TransportType::Udp
                            && target.remote_ip.is_some()) =>
                    {
                        Some(addr)
                    }
                    _ => target.remote_ip,
                }
            }
        };
        let Some(destination) = destination else {
            return Err(Rejection::new(481, "Unable to determine dialog target"));
        };

        debug!(
            session_id = %dialog.session_id,
            from_leg = sender.number(),
            %method,
            target = %destination,
            "Routed mid-dialog request"
        );
        Ok(DialogRoute {
            session_id: dialog.session_id,
            sender,
            local_interface,
            target: destination,
            transport: target.target_transport,
        })
    }
}
