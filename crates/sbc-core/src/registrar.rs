//! Registration records for UAs registering through the SBC
//!
//! A REGISTER relayed upstream carries a Contact the SBC mints for the
//! binding:
//!
//! ```text
//! <sip:sbc-reg-alice-9c1e04d2b7a3f610@198.51.100.1:5060;transport=udp>;expires=600
//! ```
//!
//! When the upstream registrar accepts it, the UA's own Contact and the
//! address it registered from are persisted through the [`KeyValueStore`]
//! under that registration id, and again under the AOR user so requests for
//! the user can find the latest binding. Requests the registrar later sends
//! to the minted Contact are mapped back to the UA through the record.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sbc_sip_core::header;
use sbc_sip_core::{SipUri, TransportType};

use crate::contact::hash_of;
use crate::error::Result;
use crate::store::KeyValueStore;

/// User part prefix of minted Contacts; registration ids are store keys too
pub const REGISTRATION_PREFIX: &str = "sbc-reg-";
const USER_PREFIX: &str = "reg-user-";

/// Expiry granted when neither the request nor the response names one
pub const DEFAULT_EXPIRES: u32 = 3600;

/// A binding the upstream registrar accepted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub registration_id: String,
    /// The UA's Contact URI
    pub contact: String,
    /// Address of record, the REGISTER's To URI
    pub aor: String,
    pub call_id: String,
    /// Where the REGISTER came from
    pub packet_source: SocketAddr,
    /// Interface the REGISTER arrived on
    pub local_interface: SocketAddr,
    pub transport: TransportType,
    pub expires: u32,
    pub registered_at: DateTime<Utc>,
}

impl RegistrationRecord {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.registered_at + chrono::Duration::seconds(i64::from(self.expires))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    /// User part of the AOR
    pub fn user(&self) -> Option<String> {
        self.aor.parse::<SipUri>().ok().and_then(|uri| uri.user)
    }

    /// Where requests for this binding are sent.
    ///
    /// The Contact address is trusted when it is public or sits on the packet
    /// source's IP; a private Contact behind NAT falls back to the packet source.
    pub fn target(&self) -> SocketAddr {
        let contact = self.contact.parse::<SipUri>().ok().and_then(|uri| uri.socket_addr());
        match contact {
            Some(addr) if !header::is_private_ip(&addr.ip()) || addr.ip() == self.packet_source.ip() => addr,
            _ => self.packet_source,
        }
    }
}

/// Registration id for the binding `contact` of the AOR user `user`.
///
/// Stable for the same Contact host, port and `rinstance`, so refreshes map
/// to the same id.
pub fn registration_id(user: &str, contact: &SipUri) -> String {
    let host_port = match contact.port {
        Some(port) => format!("{}:{}", contact.host, port),
        None => contact.host.clone(),
    };
    let rinstance = contact.param("rinstance").unwrap_or_default();
    format!("{}{}-{:016x}", REGISTRATION_PREFIX, user, hash_of(&format!("{}{}", host_port, rinstance)))
}

/// Registration id carried in the user part of a minted Contact
pub fn registration_id_of(uri: &SipUri) -> Option<String> {
    uri.user.as_deref().filter(|user| user.starts_with(REGISTRATION_PREFIX)).map(str::to_string)
}

/// Persistent registration bindings
pub struct Registrar {
    store: Arc<dyn KeyValueStore>,
}

impl Registrar {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Registrar { store }
    }

    /// Stores `record` under its registration id and its AOR user
    pub fn save(&self, record: &RegistrationRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        self.store.put(&record.registration_id, &json)?;
        if let Some(user) = record.user() {
            self.store.put(&format!("{}{}", USER_PREFIX, user), &json)?;
        }
        info!(
            registration_id = %record.registration_id,
            aor = %record.aor,
            source = %record.packet_source,
            expires = record.expires,
            "Registration saved"
        );
        Ok(())
    }

    /// The live binding for a registration id
    pub fn find(&self, registration_id: &str) -> Option<RegistrationRecord> {
        self.read(registration_id).filter(|r| !r.is_expired_at(Utc::now()))
    }

    /// The latest live binding of an AOR user
    pub fn find_by_user(&self, user: &str) -> Option<RegistrationRecord> {
        self.read(&format!("{}{}", USER_PREFIX, user)).filter(|r| !r.is_expired_at(Utc::now()))
    }

    fn read(&self, key: &str) -> Option<RegistrationRecord> {
        match self.store.get(key) {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(%key, error = %e, "Unreadable registration record");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(%key, error = %e, "Registration lookup failed");
                None
            }
        }
    }

    /// Deletes a binding; the user entry goes with it when it names this binding
    pub fn remove(&self, registration_id: &str) -> bool {
        let record = self.read(registration_id);
        let removed = match self.store.del(registration_id) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(%registration_id, error = %e, "Failed to delete registration");
                false
            }
        };
        if let Some(user) = record.and_then(|r| r.user()) {
            let key = format!("{}{}", USER_PREFIX, user);
            if self.read(&key).is_some_and(|r| r.registration_id == registration_id) {
                let _ = self.store.del(&key);
            }
        }
        if removed {
            info!(%registration_id, "Registration removed");
        }
        removed
    }

    /// Number of stored bindings, expired or not
    pub fn len(&self) -> usize {
        self.store
            .get_keys(&format!("{}*", REGISTRATION_PREFIX))
            .map(|keys| keys.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    /// Deletes bindings expired at `now`; returns how many bindings went
    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut purged = 0;
        for prefix in [REGISTRATION_PREFIX, USER_PREFIX] {
            let records = match self.store.get_records(&format!("{}*", prefix)) {
                Ok(records) => records,
                Err(e) => {
                    warn!(error = %e, "Registration sweep failed");
                    return purged;
                }
            };
            for (key, json) in records {
                let expired = serde_json::from_str::<RegistrationRecord>(&json)
                    .map_or(true, |record| record.is_expired_at(now));
                if expired && self.store.del(&key).unwrap_or(false) && prefix == REGISTRATION_PREFIX {
                    purged += 1;
                }
            }
        }
        if purged > 0 {
            debug!(purged, "Purged expired registrations");
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn record(id: &str, contact: &str, expires: u32) -> RegistrationRecord {
        RegistrationRecord {
            registration_id: id.to_string(),
            contact: contact.to_string(),
            aor: "sip:alice@example.com".to_string(),
            call_id: "reg-1".to_string(),
            packet_source: "203.0.113.5:40112".parse().unwrap(),
            local_interface: "10.0.0.1:5060".parse().unwrap(),
            transport: TransportType::Udp,
            expires,
            registered_at: Utc::now(),
        }
    }

    #[test]
    fn registration_ids_follow_the_binding() {
        let a: SipUri = "sip:alice@192.168.1.10:5060;rinstance=1".parse().unwrap();
        let b: SipUri = "sip:alice@192.168.1.10:5060;rinstance=2".parse().unwrap();
        let id = registration_id("alice", &a);
        assert!(id.starts_with("sbc-reg-alice-"));
        assert_eq!(id, registration_id("alice", &a));
        assert_ne!(id, registration_id("alice", &b));

        let minted = SipUri::new(Some(id.as_str()), "10.0.0.1", Some(5060));
        assert_eq!(registration_id_of(&minted), Some(id));
        assert_eq!(registration_id_of(&a), None);
    }

    #[test]
    fn save_find_and_remove() {
        let registrar = Registrar::new(Arc::new(MemoryStore::new()));
        let saved = record("sbc-reg-alice-1", "sip:alice@192.168.1.10:5060", 600);
        registrar.save(&saved).unwrap();

        assert_eq!(registrar.find("sbc-reg-alice-1"), Some(saved.clone()));
        assert_eq!(registrar.find_by_user("alice"), Some(saved));
        assert_eq!(registrar.len(), 1);

        assert!(registrar.remove("sbc-reg-alice-1"));
        assert!(registrar.find_by_user("alice").is_none());
        assert!(registrar.is_empty());
        assert!(!registrar.remove("sbc-reg-alice-1"));
    }

    #[test]
    fn removing_an_older_binding_keeps_the_user_entry() {
        let registrar = Registrar::new(Arc::new(MemoryStore::new()));
        registrar.save(&record("sbc-reg-alice-1", "sip:alice@192.168.1.10", 600)).unwrap();
        registrar.save(&record("sbc-reg-alice-2", "sip:alice@192.168.1.11", 600)).unwrap();

        assert!(registrar.remove("sbc-reg-alice-1"));
        let latest = registrar.find_by_user("alice").unwrap();
        assert_eq!(latest.registration_id, "sbc-reg-alice-2");
    }

    #[test]
    fn expired_bindings_are_hidden_then_purged() {
        let registrar = Registrar::new(Arc::new(MemoryStore::new()));
        let mut stale = record("sbc-reg-alice-1", "sip:alice@192.168.1.10", 60);
        stale.registered_at = Utc::now() - chrono::Duration::seconds(120);
        registrar.save(&stale).unwrap();
        registrar.save(&record("sbc-reg-bob-1", "sip:bob@192.168.1.20", 600)).unwrap();

        assert!(registrar.find("sbc-reg-alice-1").is_none());
        assert_eq!(registrar.purge_expired(), 1);
        assert_eq!(registrar.len(), 1);
        assert!(registrar.find("sbc-reg-bob-1").is_some());

        let later = Utc::now() + chrono::Duration::seconds(601);
        assert_eq!(registrar.purge_expired_at(later), 1);
        assert!(registrar.is_empty());
    }

    #[test]
    fn nat_bindings_target_the_packet_source() {
        let behind_nat = record("r", "sip:alice@192.168.1.10:5060", 600);
        assert_eq!(behind_nat.target(), "203.0.113.5:40112".parse().unwrap());

        let public = record("r", "sip:alice@198.51.100.7:5062", 600);
        assert_eq!(public.target(), "198.51.100.7:5062".parse().unwrap());

        let mut same_host = record("r", "sip:alice@192.168.1.10:5070", 600);
        same_host.packet_source = "192.168.1.10:5070".parse().unwrap();
        assert_eq!(same_host.target(), "192.168.1.10:5070".parse().unwrap());
    }
}
