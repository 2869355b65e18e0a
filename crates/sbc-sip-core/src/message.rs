//! # SIP message model
//!
//! [`SipMessage`] is a mutable request or response: a start line, an ordered
//! list of headers (a header name may repeat), a body, and a per-message
//! property bag used to carry metadata between components that never travels
//! on the wire (packet source, response target, target transport, ...).
//!
//! The model is deliberately shallow. Header values stay text and are only
//! interpreted on demand through the helpers in [`crate::header`]. This keeps
//! header rewriting (topology hiding, contact rewriting, Via replacement) a
//! matter of list manipulation.
//!
//! ```text
//! INVITE sip:bob@example.com SIP/2.0          <- start line
//! Via: SIP/2.0/UDP 10.0.0.1;branch=z9hG4bK1   <- headers (ordered, repeatable)
//! Via: SIP/2.0/UDP 10.0.0.9;branch=z9hG4bK0
//! CSeq: 1 INVITE
//! ...
//!                                             <- blank line
//! v=0                                         <- body
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::header::{self, CSeq, Via, names};

/// Well-known per-message property keys
pub mod props {
    /// Address the packet arrived from
    pub const SOURCE_ADDRESS: &str = "source-address";
    /// Local address the packet arrived on
    pub const LOCAL_ADDRESS: &str = "local-address";
    /// Transport name the packet arrived on
    pub const SOURCE_TRANSPORT: &str = "source-transport";
    /// Where a relayed response must be sent
    pub const RESPONSE_TARGET: &str = "response-target";
    /// Local interface a relayed response must leave from
    pub const RESPONSE_INTERFACE: &str = "response-interface";
    /// Transport the outbound request should use
    pub const TARGET_TRANSPORT: &str = "target-transport";
    /// Overall transaction timeout in milliseconds
    pub const TRANSACTION_TIMEOUT: &str = "transaction-timeout";
    /// Contact the inbound leg presented before topology hiding
    pub const INBOUND_CONTACT: &str = "inbound-contact";
    /// Set on a response that must not be relayed to the other leg
    pub const DISALLOW_FORWARD: &str = "disallow-forward-response";
}

/// Per-message property bag
pub type PropertyMap = HashMap<String, String>;

/// A single header line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// A SIP request or response
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SipMessage {
    start_line: String,
    headers: Vec<Header>,
    body: String,
    properties: PropertyMap,
}

impl SipMessage {
    /// Creates a message with only a start line
    pub fn new(start_line: impl Into<String>) -> Self {
        SipMessage {
            start_line: start_line.into(),
            ..Default::default()
        }
    }

    /// Creates a request with the given method and request URI
    pub fn request(method: &str, uri: &str) -> Self {
        Self::new(format!("{} {} SIP/2.0", method.to_ascii_uppercase(), uri))
    }

    /// Parses a message from its textual form
    pub fn parse(text: &str) -> Result<Self> {
        let (head, body) = match text.find("\r\n\r\n") {
            Some(idx) => (&text[..idx], &text[idx + 4..]),
            None => match text.find("\n\n") {
                Some(idx) => (&text[..idx], &text[idx + 2..]),
                None => (text, ""),
            },
        };

        let mut lines = head.lines();
        let start_line = lines
            .by_ref()
            .map(str::trim_end)
            .find(|l| !l.is_empty())
            .ok_or_else(|| Error::Parse("empty message".to_string()))?;

        let mut message = SipMessage::new(start_line);
        if !message.is_request() && !message.is_response() {
            return Err(Error::Parse(format!("invalid start line: {}", start_line)));
        }

        for line in lines {
            let line = line.trim_end_matches('\r');
            if line.starts_with(' ') || line.starts_with('\t') {
                // Folded continuation of the previous header
                let last = message
                    .headers
                    .last_mut()
                    .ok_or_else(|| Error::Parse("continuation before first header".to_string()))?;
                last.value.push(' ');
                last.value.push_str(line.trim());
                continue;
            }
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::Parse(format!("malformed header line: {}", line)))?;
            message.headers.push(Header {
                name: header::expand_compact_name(name.trim()).to_string(),
                value: value.trim().to_string(),
            });
        }
        message.body = body.to_string();
        Ok(message)
    }

    pub fn start_line(&self) -> &str {
        &self.start_line
    }

    pub fn set_start_line(&mut self, start_line: impl Into<String>) {
        self.start_line = start_line.into();
    }

    pub fn is_request(&self) -> bool {
        !self.start_line.starts_with("SIP/") && self.start_line.ends_with("SIP/2.0")
    }

    pub fn is_response(&self) -> bool {
        self.start_line.starts_with("SIP/2.0 ")
    }

    /// Returns true if this is a request for the given method
    pub fn is_request_method(&self, method: &str) -> bool {
        self.method().is_some_and(|m| m.eq_ignore_ascii_case(method))
    }

    /// The method token of a request start line
    pub fn method(&self) -> Option<&str> {
        if !self.is_request() {
            return None;
        }
        self.start_line.split_whitespace().next()
    }

    /// Replaces the method token of a request start line
    pub fn set_method(&mut self, method: &str) -> Result<()> {
        let uri = self.request_uri().ok_or(Error::NotARequest)?.to_string();
        self.start_line = format!("{} {} SIP/2.0", method.to_ascii_uppercase(), uri);
        Ok(())
    }

    pub fn request_uri(&self) -> Option<&str> {
        if !self.is_request() {
            return None;
        }
        self.start_line.split_whitespace().nth(1)
    }

    pub fn set_request_uri(&mut self, uri: &str) -> Result<()> {
        let method = self.method().ok_or(Error::NotARequest)?.to_string();
        self.start_line = format!("{} {} SIP/2.0", method, uri);
        Ok(())
    }

    pub fn status_code(&self) -> Option<u16> {
        if !self.is_response() {
            return None;
        }
        self.start_line.split_whitespace().nth(1)?.parse().ok()
    }

    pub fn reason(&self) -> Option<&str> {
        if !self.is_response() {
            return None;
        }
        self.start_line.splitn(3, ' ').nth(2)
    }

    pub fn is_1xx(&self) -> bool {
        self.status_code().is_some_and(|c| (100..200).contains(&c))
    }

    /// Provisional response with exactly this code
    pub fn is_1xx_code(&self, code: u16) -> bool {
        self.is_1xx() && self.status_code() == Some(code)
    }

    pub fn is_2xx(&self) -> bool {
        self.status_code().is_some_and(|c| (200..300).contains(&c))
    }

    pub fn is_final_response(&self) -> bool {
        self.status_code().is_some_and(|c| c >= 200)
    }

    pub fn is_error_response(&self) -> bool {
        self.status_code().is_some_and(|c| c >= 300)
    }

    /// Both the From and To tags are present
    pub fn is_mid_dialog(&self) -> bool {
        self.from_tag().is_some() && self.to_tag().is_some()
    }

    /// First value of the named header
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| header::name_matches(&h.name, name))
            .map(|h| h.value.as_str())
    }

    /// Value of the `index`th occurrence of the named header
    pub fn header_at(&self, name: &str, index: usize) -> Option<&str> {
        self.header_values(name).nth(index)
    }

    /// Every value of the named header, in order
    pub fn header_values<'a, 'n>(&'a self, name: &'n str) -> impl DoubleEndedIterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |h| header::name_matches(&h.name, name))
            .map(|h| h.value.as_str())
    }

    pub fn header_count(&self, name: &str) -> usize {
        self.header_values(name).count()
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// All header lines, in wire order
    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// Sets a single-valued header, replacing every existing occurrence in place
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.headers.iter().position(|h| header::name_matches(&h.name, name)) {
            Some(pos) => {
                self.headers[pos].value = value;
                let mut idx = 0;
                self.headers.retain(|h| {
                    let keep = idx <= pos || !header::name_matches(&h.name, name);
                    idx += 1;
                    keep
                });
            }
            None => self.headers.push(Header { name: name.to_string(), value }),
        }
    }

    /// Appends a value after the last occurrence of the header (or at the end)
    pub fn append_header(&mut self, name: &str, value: impl Into<String>) {
        let header = Header { name: name.to_string(), value: value.into() };
        match self.headers.iter().rposition(|h| header::name_matches(&h.name, name)) {
            Some(pos) => self.headers.insert(pos + 1, header),
            None => self.headers.push(header),
        }
    }

    /// Inserts a value before the first occurrence of the header (or at the top)
    pub fn prepend_header(&mut self, name: &str, value: impl Into<String>) {
        let header = Header { name: name.to_string(), value: value.into() };
        let pos = self
            .headers
            .iter()
            .position(|h| header::name_matches(&h.name, name))
            .unwrap_or(0);
        self.headers.insert(pos, header);
    }

    /// Removes every occurrence of the header, returning how many were removed
    pub fn remove_header(&mut self, name: &str) -> usize {
        let before = self.headers.len();
        self.headers.retain(|h| !header::name_matches(&h.name, name));
        before - self.headers.len()
    }

    /// Removes the `index`th occurrence of the header
    pub fn remove_header_at(&mut self, name: &str, index: usize) -> Option<String> {
        let pos = self
            .headers
            .iter()
            .enumerate()
            .filter(|(_, h)| header::name_matches(&h.name, name))
            .nth(index)
            .map(|(pos, _)| pos)?;
        Some(self.headers.remove(pos).value)
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Replaces the body and keeps Content-Length consistent
    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
        self.set_header(names::CONTENT_LENGTH, self.body.len().to_string());
    }

    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn set_property(&mut self, key: &str, value: impl Into<String>) {
        self.properties.insert(key.to_string(), value.into());
    }

    pub fn remove_property(&mut self, key: &str) -> Option<String> {
        self.properties.remove(key)
    }

    pub fn has_property(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    /// Property parsed as a socket address
    pub fn property_addr(&self, key: &str) -> Option<SocketAddr> {
        self.property(key).and_then(|v| v.parse().ok())
    }

    /// Packet source recorded by the transport layer
    pub fn source_address(&self) -> Option<SocketAddr> {
        self.property_addr(props::SOURCE_ADDRESS)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header(names::CALL_ID).map(str::trim).filter(|c| !c.is_empty())
    }

    pub fn cseq(&self) -> Option<CSeq> {
        self.header(names::CSEQ).and_then(|v| v.parse().ok())
    }

    /// CSeq method, uppercased
    pub fn cseq_method(&self) -> Option<String> {
        self.cseq().map(|c| c.method.to_ascii_uppercase())
    }

    pub fn top_via(&self) -> Option<Via> {
        self.header(names::VIA).and_then(|v| v.parse().ok())
    }

    /// Branch parameter of the top Via, empty when absent
    pub fn via_branch(&self) -> String {
        self.top_via()
            .and_then(|v| v.branch().map(str::to_string))
            .unwrap_or_default()
    }

    pub fn from_tag(&self) -> Option<String> {
        self.header(names::FROM).and_then(header::tag)
    }

    pub fn to_tag(&self) -> Option<String> {
        self.header(names::TO).and_then(header::tag)
    }

    /// Expires header value
    pub fn expires(&self) -> Option<u32> {
        self.header(names::EXPIRES).and_then(|v| v.trim().parse().ok())
    }

    /// Max-Forwards header value
    pub fn max_forwards(&self) -> Option<u32> {
        self.header(names::MAX_FORWARDS).and_then(|v| v.trim().parse().ok())
    }

    /// Transaction identifier: lowercase method, CSeq number and top Via branch.
    ///
    /// The method comes from the CSeq unless `method_override` is given; ACK
    /// maps onto its INVITE transaction. The Call-ID stands in for an empty branch.
    pub fn transaction_id(&self, method_override: Option<&str>) -> Result<String> {
        let cseq = self.cseq().ok_or(Error::MissingHeader(names::CSEQ))?;
        let mut method = method_override.unwrap_or(&cseq.method).to_ascii_lowercase();
        if method == "ack" {
            method = "invite".to_string();
        }
        let mut branch = self.via_branch();
        if branch.is_empty() {
            branch = self
                .call_id()
                .ok_or(Error::MissingHeader(names::CALL_ID))?
                .to_string();
        }
        Ok(format!("{}{}{}", method, cseq.number, branch))
    }

    /// Builds a response to this request.
    ///
    /// Copies From, To, Call-ID, CSeq, every Via and Record-Route. The reason
    /// defaults to the standard phrase for the code.
    pub fn create_response(&self, code: u16, reason: Option<&str>) -> Result<SipMessage> {
        self.create_response_with_tag(code, reason, None)
    }

    /// Like [`create_response`](Self::create_response) but adds a To tag when
    /// the request's To has none
    pub fn create_response_with_tag(
        &self,
        code: u16,
        reason: Option<&str>,
        to_tag: Option<&str>,
    ) -> Result<SipMessage> {
        if !self.is_request() {
            return Err(Error::NotARequest);
        }
        let reason = reason.unwrap_or_else(|| header::reason_phrase(code));
        let mut response = SipMessage::new(format!("SIP/2.0 {} {}", code, reason));
        for via in self.header_values(names::VIA) {
            response.append_header(names::VIA, via);
        }
        if let Some(from) = self.header(names::FROM) {
            response.set_header(names::FROM, from);
        }
        if let Some(to) = self.header(names::TO) {
            let to = match to_tag {
                Some(tag) if header::tag(to).is_none() => header::set_header_param(to, "tag", tag),
                _ => to.to_string(),
            };
            response.set_header(names::TO, to);
        }
        if let Some(call_id) = self.header(names::CALL_ID) {
            response.set_header(names::CALL_ID, call_id);
        }
        if let Some(cseq) = self.header(names::CSEQ) {
            response.set_header(names::CSEQ, cseq);
        }
        for rr in self.header_values(names::RECORD_ROUTE) {
            response.append_header(names::RECORD_ROUTE, rr);
        }
        response.set_header(names::CONTENT_LENGTH, "0");
        Ok(response)
    }

    /// Rewrites a response received on the client leg so it answers this
    /// (server leg) request.
    ///
    /// Dialog identifying headers and the Via stack come from this request;
    /// the status line, body and remaining headers come from the response. The
    /// response's To tag is preserved.
    pub fn reformat_response(&self, client_response: &SipMessage) -> Result<SipMessage> {
        if !self.is_request() {
            return Err(Error::NotARequest);
        }
        if !client_response.is_response() {
            return Err(Error::NotAResponse);
        }
        let mut response = client_response.clone();

        response.remove_header(names::VIA);
        let vias: Vec<&str> = self.header_values(names::VIA).collect();
        for via in vias.iter().rev() {
            response.headers.insert(0, Header { name: names::VIA.to_string(), value: via.to_string() });
        }

        if let Some(from) = self.header(names::FROM) {
            response.set_header(names::FROM, from);
        }
        if let Some(to) = self.header(names::TO) {
            let to = match client_response.to_tag() {
                Some(tag) => header::set_header_param(to, "tag", &tag),
                None => to.to_string(),
            };
            response.set_header(names::TO, to);
        }
        if let Some(call_id) = self.header(names::CALL_ID) {
            response.set_header(names::CALL_ID, call_id);
        }
        if let Some(cseq) = self.header(names::CSEQ) {
            response.set_header(names::CSEQ, cseq);
        }
        response.remove_header(names::RECORD_ROUTE);
        for rr in self.header_values(names::RECORD_ROUTE) {
            response.append_header(names::RECORD_ROUTE, rr);
        }
        Ok(response)
    }

    /// Recomputes Content-Length from the body
    pub fn update_content_length(&mut self) {
        self.set_header(names::CONTENT_LENGTH, self.body.len().to_string());
    }
}

impl FromStr for SipMessage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SipMessage::parse(s)
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\r\n", self.start_line)?;
        for header in &self.headers {
            write!(f, "{}: {}\r\n", header.name, header.value)?;
        }
        write!(f, "\r\n{}", self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &str = "INVITE sip:bob@biloxi.example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP pc33.atlanta.example.com;branch=z9hG4bK776asdhds\r\n\
Via: SIP/2.0/UDP 10.0.0.9:5060;branch=z9hG4bKold\r\n\
Max-Forwards: 70\r\n\
To: Bob <sip:bob@biloxi.example.com>\r\n\
From: Alice <sip:alice@atlanta.example.com>;tag=1928301774\r\n\
Call-ID: a84b4c76e66710@pc33.atlanta.example.com\r\n\
CSeq: 314159 INVITE\r\n\
Record-Route: <sip:p1.example.com;lr>\r\n\
Contact: <sip:alice@pc33.atlanta.example.com>\r\n\
Content-Type: application/sdp\r\n\
Content-Length: 4\r\n\
\r\n\
v=0\n";

    fn invite() -> SipMessage {
        SipMessage::parse(INVITE).unwrap()
    }

    #[test]
    fn test_parse_request() {
        let msg = invite();
        assert!(msg.is_request());
        assert!(msg.is_request_method("invite"));
        assert_eq!(msg.request_uri(), Some("sip:bob@biloxi.example.com"));
        assert_eq!(msg.header_count(names::VIA), 2);
        assert_eq!(msg.cseq(), Some(CSeq::new(314159, "INVITE")));
        assert_eq!(msg.via_branch(), "z9hG4bK776asdhds");
        assert_eq!(msg.from_tag().as_deref(), Some("1928301774"));
        assert_eq!(msg.to_tag(), None);
        assert!(!msg.is_mid_dialog());
        assert_eq!(msg.body(), "v=0\n");
        assert_eq!(msg.max_forwards(), Some(70));
    }

    #[test]
    fn test_parse_compact_and_folded() {
        let text = "OPTIONS sip:a@b SIP/2.0\r\nv: SIP/2.0/UDP h;branch=z9hG4bKx\r\ni: abc\r\nSubject: one\r\n  two\r\nCSeq: 1 OPTIONS\r\n\r\n";
        let msg = SipMessage::parse(text).unwrap();
        assert_eq!(msg.call_id(), Some("abc"));
        assert_eq!(msg.header("Subject"), Some("one two"));
        assert_eq!(msg.header("Via"), Some("SIP/2.0/UDP h;branch=z9hG4bKx"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(SipMessage::parse("").is_err());
        assert!(SipMessage::parse("hello world\r\n\r\n").is_err());
        assert!(SipMessage::parse("BYE sip:a@b SIP/2.0\r\nno-colon-here\r\n\r\n").is_err());
    }

    #[test]
    fn test_header_values_reverse() {
        let mut msg = invite();
        msg.append_header("record-route", "<sip:p2.example.com;lr>");
        msg.append_header(names::RECORD_ROUTE, "<sip:p3.example.com;lr>");
        let reversed: Vec<&str> = msg.header_values(names::RECORD_ROUTE).rev().collect();
        assert_eq!(reversed, ["<sip:p3.example.com;lr>", "<sip:p2.example.com;lr>", "<sip:p1.example.com;lr>"]);
    }

    #[test]
    fn test_transaction_id() {
        let msg = invite();
        assert_eq!(msg.transaction_id(None).unwrap(), "invite314159z9hG4bK776asdhds");
        assert_eq!(
            msg.transaction_id(Some("CANCEL")).unwrap(),
            "cancel314159z9hG4bK776asdhds"
        );

        let mut ack = msg.clone();
        ack.set_method("ACK").unwrap();
        ack.set_header(names::CSEQ, "314159 ACK");
        assert_eq!(ack.transaction_id(None).unwrap(), msg.transaction_id(None).unwrap());

        let mut no_branch = msg.clone();
        no_branch.remove_header(names::VIA);
        no_branch.set_header(names::VIA, "SIP/2.0/UDP legacy.example.com");
        assert_eq!(
            no_branch.transaction_id(None).unwrap(),
            "invite314159a84b4c76e66710@pc33.atlanta.example.com"
        );
    }

    #[test]
    fn test_create_response() {
        let msg = invite();
        let resp = msg.create_response_with_tag(180, None, Some("abc")).unwrap();
        assert_eq!(resp.start_line(), "SIP/2.0 180 Ringing");
        assert!(resp.is_1xx_code(180));
        assert_eq!(resp.header_count(names::VIA), 2);
        assert_eq!(resp.header_count(names::RECORD_ROUTE), 1);
        assert_eq!(resp.to_tag().as_deref(), Some("abc"));
        assert_eq!(resp.header(names::CONTENT_LENGTH), Some("0"));
        assert!(resp.is_mid_dialog());

        let resp = msg.create_response(404, Some("Nowhere")).unwrap();
        assert_eq!(resp.reason(), Some("Nowhere"));
        assert!(resp.is_error_response());
        assert!(resp.create_response(200, None).is_err());
    }

    #[test]
    fn test_reformat_response() {
        let server_request = invite();
        let mut client_request = server_request.clone();
        client_request.remove_header(names::VIA);
        client_request.set_header(names::VIA, "SIP/2.0/UDP 192.0.2.1;branch=z9hG4bKleg2");
        client_request.set_header(names::CALL_ID, "leg2-call-id");
        client_request.remove_header(names::RECORD_ROUTE);

        let mut client_response = client_request.create_response_with_tag(200, None, Some("callee")).unwrap();
        client_response.set_header(names::CONTACT, "<sip:bob@192.0.2.50>");
        client_response.set_body("v=0\r\n");

        let relayed = server_request.reformat_response(&client_response).unwrap();
        assert!(relayed.is_2xx());
        assert_eq!(relayed.call_id(), server_request.call_id());
        assert_eq!(relayed.header_count(names::VIA), 2);
        assert_eq!(relayed.via_branch(), "z9hG4bK776asdhds");
        assert_eq!(relayed.to_tag().as_deref(), Some("callee"));
        assert_eq!(relayed.header(names::RECORD_ROUTE), Some("<sip:p1.example.com;lr>"));
        assert_eq!(relayed.header(names::CONTACT), Some("<sip:bob@192.0.2.50>"));
        assert_eq!(relayed.body(), "v=0\r\n");
    }

    #[test]
    fn test_header_list_operations() {
        let mut msg = invite();
        msg.prepend_header(names::VIA, "SIP/2.0/UDP sbc;branch=z9hG4bKtop");
        assert_eq!(msg.via_branch(), "z9hG4bKtop");
        assert_eq!(msg.header_count(names::VIA), 3);
        assert_eq!(msg.remove_header_at(names::VIA, 0).as_deref(), Some("SIP/2.0/UDP sbc;branch=z9hG4bKtop"));
        msg.append_header(names::RECORD_ROUTE, "<sip:p2.example.com;lr>");
        assert_eq!(msg.header_at(names::RECORD_ROUTE, 1), Some("<sip:p2.example.com;lr>"));
        assert_eq!(msg.remove_header(names::VIA), 2);
        assert!(!msg.has_header(names::VIA));

        msg.append_header("X-Test", "1");
        msg.append_header("X-Test", "2");
        msg.set_header("x-test", "3");
        assert_eq!(msg.header_values("X-Test").collect::<Vec<_>>(), vec!["3"]);
    }

    #[test]
    fn test_body_and_properties() {
        let mut msg = invite();
        msg.set_body("");
        assert_eq!(msg.header(names::CONTENT_LENGTH), Some("0"));
        assert!(!msg.has_body());

        msg.set_property(props::SOURCE_ADDRESS, "192.0.2.7:5062");
        assert_eq!(msg.source_address(), Some("192.0.2.7:5062".parse().unwrap()));
        assert_eq!(msg.remove_property(props::SOURCE_ADDRESS).as_deref(), Some("192.0.2.7:5062"));
        assert!(!msg.has_property(props::SOURCE_ADDRESS));
    }

    #[test]
    fn test_display_reparses() {
        let msg = invite();
        let reparsed = SipMessage::parse(&msg.to_string()).unwrap();
        assert_eq!(reparsed.headers(), msg.headers());
        assert_eq!(reparsed.body(), msg.body());
    }

    #[test]
    fn test_set_request_uri_and_method() {
        let mut msg = invite();
        msg.set_request_uri("sip:bob@192.0.2.10:5070").unwrap();
        msg.set_method("cancel").unwrap();
        assert_eq!(msg.start_line(), "CANCEL sip:bob@192.0.2.10:5070 SIP/2.0");
        let resp = invite().create_response(200, None).unwrap();
        let mut resp2 = resp.clone();
        assert!(resp2.set_request_uri("sip:x@y").is_err());
        assert_eq!(resp.method(), None);
    }
}
