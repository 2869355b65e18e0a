//! Per-call state shared by both legs of a B2B transaction
//!
//! Behaviors pass session ids, routing decisions and leg bookkeeping between
//! hooks through a [`CallContext`]. The keys the core itself needs are typed
//! fields; anything a custom handler invents goes into the `extra` map.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use sbc_sip_core::TransportType;

/// Which side of the B2BUA a leg faces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LegIndex {
    /// Faces the UA that sent the initial request
    Inbound = 1,
    /// Faces the far end the SBC forwarded to
    Outbound = 2,
}

impl LegIndex {
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(LegIndex::Inbound),
            2 => Some(LegIndex::Outbound),
            _ => None,
        }
    }

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn other(self) -> Self {
        match self {
            LegIndex::Inbound => LegIndex::Outbound,
            LegIndex::Outbound => LegIndex::Inbound,
        }
    }
}

/// Flags the route policy attached to this call
#[derive(Debug, Clone, Default)]
pub struct RouteFlags {
    pub disable_nat_compensation: bool,
    pub respond_to_packet_source: bool,
    pub retarget_refer: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub session_id: Option<String>,
    /// Leg the current request arrived on, for mid-dialog requests
    pub leg_index: Option<LegIndex>,
    pub leg_identifier: Option<String>,
    pub local_interface: Option<SocketAddr>,
    pub target_address: Option<SocketAddr>,
    pub target_transport: Option<TransportType>,
    pub route_flags: RouteFlags,
    /// Contact the SBC presented on the inbound leg
    pub leg1_contact: Option<String>,
    /// Contact the SBC presented on the outbound leg
    pub leg2_contact: Option<String>,
    pub reinvite: bool,
    pub retargeted: bool,
    /// Answer upstream locally instead of relaying the far end's responses
    pub generate_local_response: bool,
    pub invoke_local_handler: bool,
    pub has_sent_local_response: bool,
    /// Cached destination for responses on the inbound leg
    pub response_target: Option<SocketAddr>,
    pub subscribe_target_address: Option<SocketAddr>,
    pub subscribe_interface: Option<SocketAddr>,
    pub subscribe_target_uri: Option<String>,
    pub subscribe_routes: Vec<String>,
    /// Last RSeq seen from the far end, to drop retransmitted reliable provisionals
    pub last_remote_rseq: Option<u32>,
    /// RSeq counter for reliable provisionals generated toward the inbound leg
    pub local_rseq: u32,
    /// SDP held back from an unreliable provisional
    pub local_100rel_sdp: Option<String>,
    /// Registration id minted for a relayed REGISTER
    pub registration_id: Option<String>,
    /// The registering UA's own Contact URI
    pub registered_contact: Option<String>,
    pub extra: HashMap<String, String>,
}

impl CallContext {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.extra.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.extra.remove(key)
    }

    pub fn next_local_rseq(&mut self) -> u32 {
        self.local_rseq += 1;
        self.local_rseq
    }
}

/// Context handle shared between the server and client side of a call
pub type SharedContext = Arc<RwLock<CallContext>>;

pub fn shared_context() -> SharedContext {
    Arc::new(RwLock::new(CallContext::default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_are_visible_through_every_handle() {
        let server_side = shared_context();
        let client_side = server_side.clone();
        server_side.write().session_id = Some("abc".into());
        server_side.write().set("tenant", "blue");
        assert_eq!(client_side.read().session_id.as_deref(), Some("abc"));
        assert_eq!(client_side.read().get("tenant"), Some("blue"));
    }

    #[test]
    fn leg_index_round_trips_numbers() {
        assert_eq!(LegIndex::from_number(1), Some(LegIndex::Inbound));
        assert_eq!(LegIndex::Outbound.number(), 2);
        assert_eq!(LegIndex::Inbound.other(), LegIndex::Outbound);
        assert_eq!(LegIndex::from_number(3), None);
    }

    #[test]
    fn rseq_counter_starts_at_one() {
        let mut ctx = CallContext::default();
        assert_eq!(ctx.next_local_rseq(), 1);
        assert_eq!(ctx.next_local_rseq(), 2);
    }
}
