//! Transport seam
//!
//! The core never touches sockets. It sends already-built messages through
//! the [`Transport`] trait and receives [`TransportEvent`]s from whatever
//! socket layer is plugged in. A [`TransportTable`] indexes the bound
//! transports by local address so the routing layer can pick an interface and
//! detect loops back into the SBC itself.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::message::SipMessage;

/// SIP transport protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    #[default]
    Udp,
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl TransportType {
    /// Stream transports take care of retransmission themselves
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportType::Udp)
    }

    /// Token used in the Via protocol triple
    pub fn via_token(&self) -> &'static str {
        match self {
            TransportType::Udp => "UDP",
            TransportType::Tcp => "TCP",
            TransportType::Tls => "TLS",
            TransportType::Ws => "WS",
            TransportType::Wss => "WSS",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportType::Udp => "udp",
            TransportType::Tcp => "tcp",
            TransportType::Tls => "tls",
            TransportType::Ws => "ws",
            TransportType::Wss => "wss",
        };
        f.write_str(name)
    }
}

impl FromStr for TransportType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportType::Udp),
            "tcp" => Ok(TransportType::Tcp),
            "tls" => Ok(TransportType::Tls),
            "ws" => Ok(TransportType::Ws),
            "wss" => Ok(TransportType::Wss),
            other => Err(Error::Parse(format!("unknown transport: {}", other))),
        }
    }
}

/// A bound SIP transport
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Local address this transport is bound to
    fn local_addr(&self) -> Result<SocketAddr>;

    fn transport_type(&self) -> TransportType;

    fn is_reliable(&self) -> bool {
        self.transport_type().is_reliable()
    }

    /// Sends a message to the destination
    async fn send_message(&self, message: &SipMessage, destination: SocketAddr) -> Result<()>;

    /// Closes the transport; further sends fail with [`Error::TransportClosed`]
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    fn is_open(&self) -> bool {
        !self.is_closed()
    }
}

/// Events a transport reports to the layer above it
#[derive(Debug, Clone)]
pub enum TransportEvent {
    MessageReceived {
        message: SipMessage,
        source: SocketAddr,
        destination: SocketAddr,
    },
    Error {
        error: String,
    },
    Closed,
}

/// Registry of bound transports keyed by local address
#[derive(Debug, Default)]
pub struct TransportTable {
    transports: RwLock<HashMap<SocketAddr, Arc<dyn Transport>>>,
}

impl TransportTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transport under its local address
    pub fn add(&self, transport: Arc<dyn Transport>) -> Result<SocketAddr> {
        let addr = transport.local_addr()?;
        self.transports.write().insert(addr, transport);
        Ok(addr)
    }

    pub fn remove(&self, addr: &SocketAddr) -> Option<Arc<dyn Transport>> {
        self.transports.write().remove(addr)
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<dyn Transport>> {
        self.transports.read().get(addr).cloned()
    }

    /// Like [`get`](Self::get) but as an error
    pub fn require(&self, addr: &SocketAddr) -> Result<Arc<dyn Transport>> {
        self.get(addr).ok_or(Error::NoTransport(*addr))
    }

    /// True when the address is one of our own listeners
    pub fn is_local(&self, addr: &SocketAddr) -> bool {
        self.transports.read().contains_key(addr)
    }

    /// True when the IP belongs to one of our listeners
    pub fn is_local_ip(&self, ip: &IpAddr) -> bool {
        self.transports.read().keys().any(|addr| addr.ip() == *ip)
    }

    /// First listener of the given transport type, lowest address first
    pub fn default_for(&self, transport: TransportType) -> Option<SocketAddr> {
        let transports = self.transports.read();
        let mut candidates: Vec<SocketAddr> = transports
            .iter()
            .filter(|(_, t)| t.transport_type() == transport)
            .map(|(addr, _)| *addr)
            .collect();
        candidates.sort();
        candidates.into_iter().next()
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = self.transports.read().keys().copied().collect();
        addrs.sort();
        addrs
    }

    pub fn len(&self) -> usize {
        self.transports.read().len()
    }

    /// Sends through the transport bound to `local`
    pub async fn send(&self, local: SocketAddr, message: &SipMessage, destination: SocketAddr) -> Result<()> {
        let transport = self.require(&local)?;
        transport.send_message(message, destination).await
    }

    /// Closes every registered transport
    pub async fn close_all(&self) {
        let transports: Vec<Arc<dyn Transport>> = self.transports.read().values().cloned().collect();
        for transport in transports {
            if let Err(e) = transport.close().await {
                tracing::warn!(error = %e, "Failed to close transport");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTransport;

    #[test]
    fn test_transport_type() {
        assert_eq!("TCP".parse::<TransportType>().unwrap(), TransportType::Tcp);
        assert!("sctp".parse::<TransportType>().is_err());
        assert!(!TransportType::Udp.is_reliable());
        assert!(TransportType::Tls.is_reliable());
        assert_eq!(TransportType::Wss.via_token(), "WSS");
        assert_eq!(TransportType::Udp.to_string(), "udp");
    }

    #[tokio::test]
    async fn test_table_lookup_and_send() {
        let table = TransportTable::new();
        let udp = RecordingTransport::new("10.0.0.1:5060".parse().unwrap(), TransportType::Udp);
        let tcp = RecordingTransport::new("10.0.0.1:5061".parse().unwrap(), TransportType::Tcp);
        table.add(udp.clone()).unwrap();
        table.add(tcp.clone()).unwrap();

        assert!(table.is_local(&"10.0.0.1:5060".parse().unwrap()));
        assert!(!table.is_local(&"10.0.0.1:5070".parse().unwrap()));
        assert!(table.is_local_ip(&"10.0.0.1".parse().unwrap()));
        assert_eq!(table.default_for(TransportType::Tcp), Some("10.0.0.1:5061".parse().unwrap()));
        assert_eq!(table.default_for(TransportType::Tls), None);

        let msg = SipMessage::request("OPTIONS", "sip:x@y");
        table
            .send("10.0.0.1:5060".parse().unwrap(), &msg, "192.0.2.1:5060".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(udp.sent().len(), 1);
        assert!(tcp.sent().is_empty());

        let err = table
            .send("10.0.0.2:5060".parse().unwrap(), &msg, "192.0.2.1:5060".parse().unwrap())
            .await
            .unwrap_err();
        assert!(err.is_transport_error());

        table.close_all().await;
        assert!(udp.is_closed());
        assert!(udp.send_message(&msg, "192.0.2.1:5060".parse().unwrap()).await.is_err());
    }
}
