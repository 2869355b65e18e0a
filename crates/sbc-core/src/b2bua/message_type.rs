use std::fmt;

use sbc_sip_core::SipMessage;
use sbc_sip_core::header::names;

/// Key under which handlers are registered with the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Invite,
    Register,
    Bye,
    Cancel,
    Refer,
    Subscribe,
    Notify,
    Prack,
    Update,
    Options,
    Message,
    Info,
    Publish,
    /// Session descriptions in INVITE, UPDATE, ACK and PRACK bodies
    Sdp,
    /// Fallback for everything without a dedicated handler
    Any,
}

impl MessageType {
    /// Type of a request or response, keyed by its CSeq method
    pub fn of(message: &SipMessage) -> Self {
        let method = message
            .cseq_method()
            .or_else(|| message.method().map(str::to_ascii_uppercase))
            .unwrap_or_default();
        Self::for_method(&method)
    }

    pub fn for_method(method: &str) -> Self {
        // ACK belongs to its INVITE
        match method.to_ascii_uppercase().as_str() {
            "INVITE" | "ACK" => MessageType::Invite,
            "REGISTER" => MessageType::Register,
            "BYE" => MessageType::Bye,
            "CANCEL" => MessageType::Cancel,
            "REFER" => MessageType::Refer,
            "SUBSCRIBE" => MessageType::Subscribe,
            "NOTIFY" => MessageType::Notify,
            "PRACK" => MessageType::Prack,
            "UPDATE" => MessageType::Update,
            "OPTIONS" => MessageType::Options,
            "MESSAGE" => MessageType::Message,
            "INFO" => MessageType::Info,
            "PUBLISH" => MessageType::Publish,
            _ => MessageType::Any,
        }
    }

    /// `Sdp` when the message carries a session description the SDP handler should see
    pub fn body_type(message: &SipMessage) -> Option<Self> {
        let method = message.cseq_method()?;
        let carries_sdp = matches!(method.as_str(), "INVITE" | "UPDATE" | "ACK" | "PRACK");
        let is_sdp = message
            .header(names::CONTENT_TYPE)
            .is_some_and(|ct| ct.trim().to_ascii_lowercase().starts_with("application/sdp"));
        (carries_sdp && message.has_body() && is_sdp).then_some(MessageType::Sdp)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
