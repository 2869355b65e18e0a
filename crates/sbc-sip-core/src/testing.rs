//! In-memory transport for tests
//!
//! [`RecordingTransport`] records every message handed to it instead of
//! writing to a socket, and lets tests wait for a message matching a
//! predicate.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::message::SipMessage;
use crate::transport::{Transport, TransportType};

/// A message captured by [`RecordingTransport`]
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub message: SipMessage,
    pub destination: SocketAddr,
}

#[derive(Debug)]
pub struct RecordingTransport {
    local_addr: SocketAddr,
    transport_type: TransportType,
    sent: Mutex<Vec<SentMessage>>,
    notify: Notify,
    closed: AtomicBool,
    fail_sends: AtomicBool,
}

impl RecordingTransport {
    pub fn new(local_addr: SocketAddr, transport_type: TransportType) -> Arc<Self> {
        Arc::new(RecordingTransport {
            local_addr,
            transport_type,
            sent: Mutex::new(Vec::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
        })
    }

    /// Snapshot of everything sent so far
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    /// Sent messages whose start line begins with `prefix`
    pub fn sent_matching(&self, prefix: &str) -> Vec<SentMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|s| s.message.start_line().starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    /// Makes subsequent sends fail with a transport error
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Waits until a sent message satisfies `predicate`
    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> Option<SentMessage>
    where
        F: Fn(&SentMessage) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(found) = self.sent.lock().iter().find(|s| predicate(s)).cloned() {
                return Some(found);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Waits for a sent message whose start line begins with `prefix`
    pub async fn wait_for_start_line(&self, timeout: Duration, prefix: &str) -> Option<SentMessage> {
        self.wait_for(timeout, |s| s.message.start_line().starts_with(prefix))
            .await
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    async fn send_message(&self, message: &SipMessage, destination: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Transport("simulated send failure".to_string()));
        }
        self.sent.lock().push(SentMessage { message: message.clone(), destination });
        self.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
