//! Header value helpers
//!
//! The message model stores header values as text. This module interprets
//! the handful of values the transaction layer and the SBC behaviors need to
//! read or rewrite: `Via`, `CSeq`, SIP URIs, and name-addr parameters such as
//! the dialog `tag`.
//!
//! ```text
//! Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK776;rport
//!      \_________/ \___________/ \___________________/
//!       protocol      sent-by          params
//!
//! To: "Bob" <sip:bob@example.com;transport=tcp>;tag=a6c85cf
//!           \______________________________/ \_________/
//!                        uri                   header params
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Magic cookie every RFC 3261 branch starts with
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Default SIP port when a URI or Via omits one
pub const DEFAULT_SIP_PORT: u16 = 5060;

/// Canonical header names used throughout the crates
pub mod names {
    pub const VIA: &str = "Via";
    pub const FROM: &str = "From";
    pub const TO: &str = "To";
    pub const CALL_ID: &str = "Call-ID";
    pub const CSEQ: &str = "CSeq";
    pub const CONTACT: &str = "Contact";
    pub const ROUTE: &str = "Route";
    pub const RECORD_ROUTE: &str = "Record-Route";
    pub const MAX_FORWARDS: &str = "Max-Forwards";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const EXPIRES: &str = "Expires";
    pub const EVENT: &str = "Event";
    pub const ALLOW: &str = "Allow";
    pub const SUPPORTED: &str = "Supported";
    pub const REQUIRE: &str = "Require";
    pub const RSEQ: &str = "RSeq";
    pub const RACK: &str = "RAck";
    pub const REFER_TO: &str = "Refer-To";
    pub const REPLACES: &str = "Replaces";
    pub const USER_AGENT: &str = "User-Agent";
    pub const SERVER: &str = "Server";
    pub const ACCEPT: &str = "Accept";
    pub const MIN_SE: &str = "Min-SE";
    pub const SESSION_EXPIRES: &str = "Session-Expires";
    pub const AUTHORIZATION: &str = "Authorization";
    pub const PROXY_AUTHORIZATION: &str = "Proxy-Authorization";
    pub const SUBSCRIPTION_STATE: &str = "Subscription-State";
}

/// Expands an RFC 3261 compact header form to its full name
pub fn expand_compact_name(name: &str) -> &str {
    if name.len() != 1 {
        return name;
    }
    match name.as_bytes()[0].to_ascii_lowercase() {
        b'i' => names::CALL_ID,
        b'm' => names::CONTACT,
        b'e' => "Content-Encoding",
        b'l' => names::CONTENT_LENGTH,
        b'c' => names::CONTENT_TYPE,
        b'f' => names::FROM,
        b's' => "Subject",
        b'k' => names::SUPPORTED,
        b't' => names::TO,
        b'v' => names::VIA,
        b'o' => names::EVENT,
        b'r' => names::REFER_TO,
        b'u' => "Allow-Events",
        b'x' => names::SESSION_EXPIRES,
        _ => name,
    }
}

/// Case-insensitive header name comparison that understands compact forms
pub fn name_matches(actual: &str, wanted: &str) -> bool {
    expand_compact_name(actual).eq_ignore_ascii_case(expand_compact_name(wanted))
}

/// Standard reason phrase for a status code
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        181 => "Call Is Being Forwarded",
        182 => "Queued",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Moved Temporarily",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        482 => "Loop Detected",
        483 => "Too Many Hops",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        489 => "Bad Event",
        491 => "Request Pending",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Server Time-out",
        600 => "Busy Everywhere",
        603 => "Decline",
        _ => "Unknown",
    }
}

/// Generates a random dialog tag
pub fn generate_tag() -> String {
    format!("{:08x}", fastrand::u32(..))
}

/// Generates a random RFC 3261 branch
pub fn generate_branch() -> String {
    format!("{}{:016x}", BRANCH_MAGIC_COOKIE, fastrand::u64(..))
}

/// Generic `;name=value` parameter list
pub type Params = Vec<(String, Option<String>)>;

fn parse_params(text: &str) -> Params {
    text.split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((name, value)) => (name.trim().to_string(), Some(value.trim().to_string())),
            None => (p.to_string(), None),
        })
        .collect()
}

fn write_params(f: &mut fmt::Formatter<'_>, params: &Params) -> fmt::Result {
    for (name, value) in params {
        match value {
            Some(value) => write!(f, ";{}={}", name, value)?,
            None => write!(f, ";{}", name)?,
        }
    }
    Ok(())
}

fn find_param<'a>(params: &'a Params, name: &str) -> Option<&'a (String, Option<String>)> {
    params.iter().find(|(n, _)| n.eq_ignore_ascii_case(name))
}

fn upsert_param(params: &mut Params, name: &str, value: Option<&str>) {
    let value = value.map(str::to_string);
    match params.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
        Some(entry) => entry.1 = value,
        None => params.push((name.to_string(), value)),
    }
}

fn split_host_port(text: &str) -> Result<(String, Option<u16>)> {
    let text = text.trim();
    if let Some(rest) = text.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::Parse(format!("unterminated IPv6 reference: {}", text)))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => Some(
                port.parse::<u16>()
                    .map_err(|_| Error::Parse(format!("bad port in {}", text)))?,
            ),
            None => None,
        };
        return Ok((host.to_string(), port));
    }
    match text.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::Parse(format!("bad port in {}", text)))?;
            Ok((host.to_string(), Some(port)))
        }
        None => Ok((text.to_string(), None)),
    }
}

fn write_host(f: &mut fmt::Formatter<'_>, host: &str, port: Option<u16>) -> fmt::Result {
    if host.contains(':') {
        write!(f, "[{}]", host)?;
    } else {
        write!(f, "{}", host)?;
    }
    if let Some(port) = port {
        write!(f, ":{}", port)?;
    }
    Ok(())
}

/// Returns true for RFC 1918 addresses
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// A parsed `Via` header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    /// Protocol triple such as `SIP/2.0/UDP`
    pub protocol: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
}

impl Via {
    /// Builds a Via for the given transport name, sent-by and branch
    pub fn new(transport: &str, host: impl Into<String>, port: Option<u16>, branch: &str) -> Self {
        Via {
            protocol: format!("SIP/2.0/{}", transport.to_ascii_uppercase()),
            host: host.into(),
            port,
            params: vec![("branch".to_string(), Some(branch.to_string()))],
        }
    }

    /// Transport token of the protocol triple
    pub fn transport(&self) -> &str {
        self.protocol.rsplit('/').next().unwrap_or_default()
    }

    pub fn branch(&self) -> Option<&str> {
        self.param("branch").filter(|b| !b.is_empty())
    }

    /// Value of a parameter; an empty string for flag parameters
    pub fn param(&self, name: &str) -> Option<&str> {
        find_param(&self.params, name).map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    pub fn has_param(&self, name: &str) -> bool {
        find_param(&self.params, name).is_some()
    }

    pub fn set_param(&mut self, name: &str, value: Option<&str>) {
        upsert_param(&mut self.params, name, value);
    }

    /// The `rport` value, when one has been filled in
    pub fn rport(&self) -> Option<u16> {
        self.param("rport").and_then(|v| v.parse().ok())
    }

    pub fn received(&self) -> Option<IpAddr> {
        self.param("received").and_then(|v| v.parse().ok())
    }

    /// Sent-by as a socket address when the host is a literal IP
    pub fn sent_by_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.host.parse().ok()?;
        Some(SocketAddr::new(ip, self.port.unwrap_or(DEFAULT_SIP_PORT)))
    }
}

impl FromStr for Via {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (protocol, rest) = s
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::InvalidHeader { name: names::VIA, value: s.to_string() })?;
        if !protocol.to_ascii_uppercase().starts_with("SIP/") {
            return Err(Error::InvalidHeader { name: names::VIA, value: s.to_string() });
        }
        let rest = rest.trim();
        let (sent_by, params) = match rest.split_once(';') {
            Some((sent_by, params)) => (sent_by, parse_params(params)),
            None => (rest, Vec::new()),
        };
        let (host, port) = split_host_port(sent_by)
            .map_err(|_| Error::InvalidHeader { name: names::VIA, value: s.to_string() })?;
        if host.is_empty() {
            return Err(Error::InvalidHeader { name: names::VIA, value: s.to_string() });
        }
        Ok(Via { protocol: protocol.to_string(), host, port, params })
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.protocol)?;
        write_host(f, &self.host, self.port)?;
        write_params(f, &self.params)
    }
}

/// A parsed `CSeq` header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub number: u32,
    pub method: String,
}

impl CSeq {
    pub fn new(number: u32, method: impl Into<String>) -> Self {
        CSeq { number, method: method.into() }
    }
}

impl FromStr for CSeq {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut tokens = s.split_whitespace();
        let number = tokens
            .next()
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| Error::InvalidHeader { name: names::CSEQ, value: s.to_string() })?;
        let method = tokens
            .next()
            .ok_or_else(|| Error::InvalidHeader { name: names::CSEQ, value: s.to_string() })?;
        Ok(CSeq::new(number, method))
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.number, self.method)
    }
}

/// A SIP or SIPS URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub scheme: String,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
    /// Raw `?`-headers component, without the question mark
    pub headers: Option<String>,
}

impl SipUri {
    pub fn new(user: Option<&str>, host: impl Into<String>, port: Option<u16>) -> Self {
        SipUri {
            scheme: "sip".to_string(),
            user: user.map(str::to_string),
            host: host.into(),
            port,
            params: Vec::new(),
            headers: None,
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        find_param(&self.params, name).map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    pub fn set_param(&mut self, name: &str, value: Option<&str>) {
        upsert_param(&mut self.params, name, value);
    }

    pub fn remove_param(&mut self, name: &str) {
        self.params.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Host parsed as an IP literal
    pub fn host_ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// Host and port as a socket address when the host is an IP literal
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.host_ip()
            .map(|ip| SocketAddr::new(ip, self.port.unwrap_or(DEFAULT_SIP_PORT)))
    }
}

impl FromStr for SipUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidUri(s.to_string()))?;
        let scheme_lower = scheme.to_ascii_lowercase();
        if scheme_lower != "sip" && scheme_lower != "sips" {
            return Err(Error::InvalidUri(s.to_string()));
        }
        let (rest, headers) = match rest.split_once('?') {
            Some((rest, headers)) => (rest, Some(headers.to_string())),
            None => (rest, None),
        };
        let (user, hostpart) = match rest.rsplit_once('@') {
            Some((user, hostpart)) => (Some(user.to_string()), hostpart),
            None => (None, rest),
        };
        let (hostport, params) = match hostpart.split_once(';') {
            Some((hostport, params)) => (hostport, parse_params(params)),
            None => (hostpart, Vec::new()),
        };
        let (host, port) =
            split_host_port(hostport).map_err(|_| Error::InvalidUri(s.to_string()))?;
        if host.is_empty() {
            return Err(Error::InvalidUri(s.to_string()));
        }
        Ok(SipUri { scheme: scheme_lower, user, host, port, params, headers })
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write_host(f, &self.host, self.port)?;
        write_params(f, &self.params)?;
        if let Some(headers) = &self.headers {
            write!(f, "?{}", headers)?;
        }
        Ok(())
    }
}

/// Splits a name-addr or addr-spec value into (uri, trailing header params)
fn split_name_addr(value: &str) -> (&str, &str) {
    let value = value.trim();
    if let Some(open) = value.find('<') {
        if let Some(close) = value[open..].find('>') {
            let close = open + close;
            return (&value[open + 1..close], &value[close + 1..]);
        }
    }
    match value.find(';') {
        Some(idx) => (&value[..idx], &value[idx..]),
        None => (value, ""),
    }
}

/// URI part of a `From`/`To`/`Contact`/`Route` value
pub fn uri_part(value: &str) -> &str {
    split_name_addr(value).0.trim()
}

/// Header parameter (outside the angle brackets) of a name-addr value
pub fn header_param(value: &str, name: &str) -> Option<String> {
    let params = parse_params(split_name_addr(value).1);
    find_param(&params, name).map(|(_, v)| v.clone().unwrap_or_default())
}

/// The dialog `tag` parameter of a `From` or `To` value
pub fn tag(value: &str) -> Option<String> {
    header_param(value, "tag").filter(|t| !t.is_empty())
}

/// Sets a header parameter on a name-addr value, converting addr-spec form to name-addr
pub fn set_header_param(value: &str, name: &str, param_value: &str) -> String {
    let value = value.trim();
    let (display, uri, params) = match value.find('<') {
        Some(open) => {
            let (uri, params) = split_name_addr(value);
            (value[..open].trim_end().to_string(), uri.to_string(), params)
        }
        None => {
            let (uri, params) = split_name_addr(value);
            (String::new(), uri.to_string(), params)
        }
    };
    let mut params = parse_params(params);
    upsert_param(&mut params, name, Some(param_value));
    let mut out = String::new();
    if !display.is_empty() {
        out.push_str(&display);
        out.push(' ');
    }
    out.push('<');
    out.push_str(&uri);
    out.push('>');
    for (n, v) in params {
        match v {
            Some(v) => out.push_str(&format!(";{}={}", n, v)),
            None => out.push_str(&format!(";{}", n)),
        }
    }
    out
}

/// Replaces the URI inside a name-addr value, keeping display name and header params
pub fn replace_uri(value: &str, uri: &str) -> String {
    let value = value.trim();
    match value.find('<') {
        Some(open) => {
            let (_, params) = split_name_addr(value);
            format!("{}<{}>{}", &value[..open], uri, params)
        }
        None => {
            let (_, params) = split_name_addr(value);
            format!("<{}>{}", uri, params)
        }
    }
}

/// Splits a comma separated list of name-addr values such as `Contact`.
///
/// Commas inside angle brackets or a quoted display name do not split.
pub fn split_name_addrs(value: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let (mut start, mut in_quotes, mut in_brackets) = (0, false, false);
    for (i, c) in value.char_indices() {
        match c {
            '"' if !in_brackets => in_quotes = !in_quotes,
            '<' if !in_quotes => in_brackets = true,
            '>' if !in_quotes => in_brackets = false,
            ',' if !in_quotes && !in_brackets => {
                out.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(value[start..].trim());
    out.retain(|v| !v.is_empty());
    out
}

/// Splits a comma separated token list header such as `Allow` or `Supported`
pub fn tokens(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Returns true when a token list contains `token`, case-insensitively
pub fn has_token(value: &str, token: &str) -> bool {
    value.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
}
