//! Reliable provisional responses (RFC 3262)
//!
//! A provisional response sent with `Require: 100rel` is retransmitted until a
//! PRACK acknowledges it. One background task drives every queued response
//! off a fixed tick:
//!
//! ```text
//! every tick:  remaining -= tick
//!              remaining <= 0  ->  count += 1, interval *= 2, remaining = interval, resend
//!              count == max    ->  drop the entry
//! ```
//!
//! With the default 500 ms tick an unacknowledged response goes out again at
//! 500 ms, 1.5 s, 3.5 s, ... and is abandoned after the tenth retransmission.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use sbc_sip_core::header::names;
use sbc_sip_core::{SipMessage, props};
use sbc_transaction_core::MessageSender;

#[derive(Debug, Clone)]
struct ReliableEntry {
    response: SipMessage,
    call_id: String,
    rseq: u32,
    local: SocketAddr,
    target: SocketAddr,
    last_duration: Duration,
    time_remaining: Duration,
    retransmit_count: u32,
}

pub struct ReliableResponseEngine {
    queue: Mutex<Vec<ReliableEntry>>,
    sender: Arc<dyn MessageSender>,
    tick: Duration,
    max_retransmits: u32,
    task: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
}

impl ReliableResponseEngine {
    pub fn new(sender: Arc<dyn MessageSender>, tick: Duration, max_retransmits: u32) -> Arc<Self> {
        Arc::new(ReliableResponseEngine {
            queue: Mutex::new(Vec::new()),
            sender,
            tick,
            max_retransmits,
            task: Mutex::new(None),
        })
    }

    /// Queues a reliable provisional for retransmission.
    ///
    /// The response needs its `response-target` and `response-interface`
    /// properties, a Call-ID and an RSeq; otherwise nothing is queued and
    /// `false` is returned. A response already queued under the same
    /// (Call-ID, RSeq) is replaced.
    pub fn queue(&self, response: &SipMessage) -> bool {
        let (Some(target), Some(local)) = (
            response.property_addr(props::RESPONSE_TARGET),
            response.property_addr(props::RESPONSE_INTERFACE),
        ) else {
            debug!("Reliable response lacks a response target");
            return false;
        };
        let Some(call_id) = response.call_id().map(str::to_string) else {
            return false;
        };
        let Some(rseq) = response.header(names::RSEQ).and_then(|v| v.trim().parse::<u32>().ok()) else {
            return false;
        };

        let entry = ReliableEntry {
            response: response.clone(),
            call_id,
            rseq,
            local,
            target,
            last_duration: self.tick,
            time_remaining: self.tick,
            retransmit_count: 0,
        };
        let mut queue = self.queue.lock();
        queue.retain(|e| !(e.call_id == entry.call_id && e.rseq == entry.rseq));
        debug!(call_id = %entry.call_id, rseq, "Queued reliable response");
        queue.push(entry);
        true
    }

    /// Removes the entry acknowledged by a PRACK, or every entry of the call
    /// when `rseq` is `None`. Returns whether anything was removed.
    pub fn remove(&self, call_id: &str, rseq: Option<u32>) -> bool {
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|e| !(e.call_id == call_id && rseq.is_none_or(|r| r == e.rseq)));
        let removed = before != queue.len();
        if removed {
            debug!(call_id, ?rseq, "Removed reliable response");
        }
        removed
    }

    pub fn contains(&self, call_id: &str, rseq: u32) -> bool {
        self.queue.lock().iter().any(|e| e.call_id == call_id && e.rseq == rseq)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Advances every entry by one tick and sends the ones that fell due.
    ///
    /// Returns the number of retransmissions made.
    pub async fn tick(&self) -> usize {
        let due: Vec<ReliableEntry> = {
            let mut queue = self.queue.lock();
            let mut due = Vec::new();
            queue.retain_mut(|entry| {
                entry.time_remaining = entry.time_remaining.saturating_sub(self.tick);
                if entry.time_remaining.is_zero() {
                    entry.retransmit_count += 1;
                    entry.last_duration *= 2;
                    entry.time_remaining = entry.last_duration;
                    due.push(entry.clone());
                }
                if entry.retransmit_count >= self.max_retransmits {
                    info!(call_id = %entry.call_id, rseq = entry.rseq, "Reliable response never acknowledged");
                    return false;
                }
                true
            });
            due
        };

        for entry in &due {
            debug!(
                call_id = %entry.call_id,
                rseq = entry.rseq,
                count = entry.retransmit_count,
                target = %entry.target,
                "Retransmitting reliable response"
            );
            if let Err(e) = self.sender.send_direct(&entry.response, entry.local, entry.target).await {
                warn!(call_id = %entry.call_id, error = %e, "Failed to retransmit reliable response");
            }
        }
        due.len()
    }

    /// Starts the background tick task; a second call is a no-op
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + engine.tick, engine.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        engine.tick().await;
                    }
                }
            }
            debug!("Reliable response engine stopped");
        });
        *task = Some((stop_tx, handle));
    }

    /// Stops the tick task and waits for it; no retransmission happens after return
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some((stop_tx, handle)) = task {
            let _ = stop_tx.send(());
            if let Err(e) = handle.await {
                warn!(error = %e, "Reliable response task failed");
            }
        }
    }
}
