//! Call detail records
//!
//! A record is opened when a new INVITE is routed and kept in the
//! [`KeyValueStore`] while the call is up. It is flushed, which logs it on the
//! `sbc::cdr` target and frees the call's [`CallLimits`] slots, when the call
//! fails, when its BYE completes, or when the sweeper finds it stale. A
//! challenge (401/407) discards the record without logging it; the
//! authenticated retry opens a new one.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sbc_sip_core::header::{self, names};
use sbc_sip_core::{SipMessage, SipUri};

use crate::config::{CdrConfig, LimitsConfig};
use crate::limits::{CallLimits, LimitViolation};
use crate::store::KeyValueStore;

const CDR_PREFIX: &str = "cdr-";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdrRecord {
    pub session_id: String,
    pub call_id: String,
    pub source: SocketAddr,
    pub from_uri: String,
    pub to_uri: String,
    pub request_uri: String,
    pub caller_contact: Option<String>,
    pub called_contact: Option<String>,
    /// Status line of the final error response or the failure reason
    pub error_response: Option<String>,
    pub setup_time: DateTime<Utc>,
    pub connect_time: Option<DateTime<Utc>>,
    pub disconnect_time: Option<DateTime<Utc>>,
}

impl CdrRecord {
    /// Connected duration; zero for calls that never connected
    pub fn duration(&self) -> chrono::Duration {
        match (self.connect_time, self.disconnect_time) {
            (Some(connect), Some(disconnect)) => disconnect - connect,
            _ => chrono::Duration::zero(),
        }
    }
}

fn uri_of(value: Option<&str>) -> String {
    value.map(|v| header::uri_part(v).to_string()).unwrap_or_default()
}

pub struct CdrManager {
    store: Arc<dyn KeyValueStore>,
    limits: CallLimits,
    stale_after: Duration,
}

impl CdrManager {
    pub fn new(store: Arc<dyn KeyValueStore>, limits: &LimitsConfig, config: &CdrConfig) -> Self {
        CdrManager { store, limits: CallLimits::new(limits), stale_after: config.stale_after() }
    }

    pub fn limits(&self) -> &CallLimits {
        &self.limits
    }

    /// Admits a new call against the limits and opens its record.
    ///
    /// A refused call leaves no record behind.
    pub fn on_call_setup(&self, session_id: &str, request: &SipMessage, source: SocketAddr) -> Result<(), LimitViolation> {
        let from_uri = uri_of(request.header(names::FROM));
        let request_uri = request.request_uri().unwrap_or_default().to_string();
        let domain = from_uri.parse::<SipUri>().map(|uri| uri.host).unwrap_or_default();
        let dial_string = request_uri.parse::<SipUri>().ok().and_then(|uri| uri.user).unwrap_or_default();

        self.limits.admit(session_id, &dial_string, &domain)?;

        let record = CdrRecord {
            session_id: session_id.to_string(),
            call_id: request.call_id().unwrap_or_default().to_string(),
            source,
            from_uri,
            to_uri: uri_of(request.header(names::TO)),
            request_uri,
            caller_contact: request.header(names::CONTACT).map(str::to_string),
            called_contact: None,
            error_response: None,
            setup_time: Utc::now(),
            connect_time: None,
            disconnect_time: None,
        };
        self.write(&record);
        debug!(%session_id, "CDR opened");
        Ok(())
    }

    /// Applies a final response of the initial INVITE
    pub fn on_final(&self, session_id: &str, response: &SipMessage) {
        let Some(mut record) = self.read(session_id) else {
            return;
        };
        match response.status_code() {
            Some(401 | 407) => {
                self.discard(session_id);
            }
            Some(code) if (200..300).contains(&code) => {
                if record.connect_time.is_none() {
                    record.connect_time = Some(Utc::now());
                    record.called_contact = response.header(names::CONTACT).map(str::to_string);
                    self.write(&record);
                }
            }
            Some(_) if record.connect_time.is_none() => {
                record.error_response = Some(response.start_line().to_string());
                self.flush(record);
            }
            _ => {}
        }
    }

    /// The call failed without a final response
    pub fn on_failed(&self, session_id: &str, reason: &str) {
        let Some(mut record) = self.read(session_id) else {
            return;
        };
        if record.connect_time.is_none() {
            record.error_response = Some(reason.to_string());
            self.flush(record);
        }
    }

    /// The call ended; returns the flushed record
    pub fn on_terminated(&self, session_id: &str) -> Option<CdrRecord> {
        let record = self.read(session_id)?;
        Some(self.flush(record))
    }

    /// Records still open
    pub fn open_records(&self) -> usize {
        self.store
            .get_keys(&format!("{}*", CDR_PREFIX))
            .map(|keys| keys.len())
            .unwrap_or_default()
    }

    pub fn find(&self, session_id: &str) -> Option<CdrRecord> {
        self.read(session_id)
    }

    pub fn purge_stale(&self) -> usize {
        self.purge_stale_at(Utc::now())
    }

    /// Flushes records that never connected and were set up before
    /// `now - stale_after`
    pub fn purge_stale_at(&self, now: DateTime<Utc>) -> usize {
        let Ok(stale_after) = chrono::Duration::from_std(self.stale_after) else {
            return 0;
        };
        let records = match self.store.get_records(&format!("{}*", CDR_PREFIX)) {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "CDR sweep failed");
                return 0;
            }
        };
        let mut purged = 0;
        for (key, json) in records {
            match serde_json::from_str::<CdrRecord>(&json) {
                Ok(mut record) if record.connect_time.is_none() && now - record.setup_time >= stale_after => {
                    record.error_response.get_or_insert_with(|| "No final response".to_string());
                    self.flush(record);
                    purged += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(%key, error = %e, "Unreadable CDR dropped");
                    let _ = self.store.del(&key);
                }
            }
        }
        purged
    }

    fn flush(&self, mut record: CdrRecord) -> CdrRecord {
        record.disconnect_time.get_or_insert_with(Utc::now);
        self.discard(&record.session_id);
        info!(
            target: "sbc::cdr",
            session_id = %record.session_id,
            call_id = %record.call_id,
            source = %record.source,
            from = %record.from_uri,
            to = %record.to_uri,
            request_uri = %record.request_uri,
            caller_contact = ?record.caller_contact,
            called_contact = ?record.called_contact,
            error = ?record.error_response,
            setup_time = %record.setup_time.to_rfc3339(),
            connect_time = ?record.connect_time.map(|t| t.to_rfc3339()),
            duration_secs = record.duration().num_seconds(),
            "Call completed"
        );
        record
    }

    fn discard(&self, session_id: &str) {
        if let Err(e) = self.store.del(&format!("{}{}", CDR_PREFIX, session_id)) {
            warn!(%session_id, error = %e, "Failed to delete CDR");
        }
        self.limits.release(session_id);
    }

    fn read(&self, session_id: &str) -> Option<CdrRecord> {
        let json = self.store.get(&format!("{}{}", CDR_PREFIX, session_id)).ok().flatten()?;
        serde_json::from_str(&json).ok()
    }

    fn write(&self, record: &CdrRecord) {
        let written = serde_json::to_string(record)
            .map_err(crate::error::SbcError::from)
            .and_then(|json| self.store.put(&format!("{}{}", CDR_PREFIX, record.session_id), &json));
        if let Err(e) = written {
            warn!(session_id = %record.session_id, error = %e, "Failed to store CDR");
        }
    }
}
