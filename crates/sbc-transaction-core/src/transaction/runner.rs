//! # Transaction Runner
//!
//! Every transaction is driven by one task running [`run_transaction_loop`].
//! The loop owns the [`TransactionLogic`] for the transaction and is the only
//! place its state changes, so all events for one transaction id are
//! serialized without a lock: commands from the user, inbound messages from
//! the dispatcher and timer fires all queue on the same channel.
//!
//! Timers are spawned sleep tasks that post a `Timer` command back into the
//! loop. Each start bumps a generation counter; a fire whose generation no
//! longer matches the armed timer is stale and ignored, so a cancelled timer
//! can never act even if its task already woke up.
//!
//! On TERMINATED the loop cancels its timers, removes the transaction from
//! the pool, releases its event sender and exits. Commands still queued are
//! dropped, which resolves their replies with `AlreadyTerminated`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use sbc_sip_core::{SipMessage, TransportTable, TransportType};

use crate::dispatcher::TransactionUser;
use crate::error::{Result, TransactionError};
use crate::pool::TransactionPool;
use crate::timer::{TimerSettings, TimerType};
use crate::transaction::logic::{Action, TransactionLogic};
use crate::transaction::{
    AtomicTransactionState, ClientEvent, Transaction, TransactionKey, TransactionKind,
    TransactionState,
};

/// Commands processed by the transaction loop
#[derive(Debug)]
pub(crate) enum Command {
    Send {
        message: SipMessage,
        destination: Option<SocketAddr>,
        ack_waiter: Option<oneshot::Sender<Result<SipMessage>>>,
        reply: oneshot::Sender<Result<()>>,
    },
    SendAckFor2xx {
        ack: SipMessage,
        target: SocketAddr,
        reply: oneshot::Sender<Result<()>>,
    },
    Receive {
        message: SipMessage,
        source: SocketAddr,
    },
    Timer {
        timer: TimerType,
        generation: u64,
    },
    Terminate {
        reply: oneshot::Sender<Result<()>>,
    },
    /// A sibling branch of a forked INVITE delivered a final response
    BranchFinal,
}

/// Everything needed to start a transaction
pub(crate) struct TransactionConfig {
    pub key: TransactionKey,
    pub kind: TransactionKind,
    pub parent: Option<TransactionKey>,
    pub request: SipMessage,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub transport_type: TransportType,
    pub settings: TimerSettings,
    pub will_send_ack_for_2xx: bool,
    pub events: Option<mpsc::UnboundedSender<ClientEvent>>,
    pub user: Option<Weak<dyn TransactionUser>>,
}

/// Creates the transaction handle and spawns its loop
pub(crate) fn spawn_transaction(
    config: TransactionConfig,
    transports: Arc<TransportTable>,
    pool: Arc<TransactionPool>,
) -> Arc<Transaction> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let reliable = config.transport_type.is_reliable();

    let (logic, branch) = match &config.parent {
        Some(parent) => {
            let tag = config
                .key
                .as_str()
                .strip_prefix(parent.as_str())
                .map(|t| t.trim_start_matches(':').to_string());
            (
                TransactionLogic::new_child(
                    config.key.clone(),
                    reliable,
                    config.settings.clone(),
                    config.request.clone(),
                    config.will_send_ack_for_2xx,
                ),
                tag,
            )
        }
        None => {
            let mut logic = TransactionLogic::new(
                config.key.clone(),
                config.kind,
                reliable,
                config.settings.clone(),
            );
            logic.set_will_send_ack_for_2xx(config.will_send_ack_for_2xx);
            (logic, None)
        }
    };

    let state = Arc::new(AtomicTransactionState::new(logic.state()));
    let log_id = format!("{}-{}", config.kind, config.key);

    Arc::new_cyclic(|handle: &Weak<Transaction>| {
        let runner = Runner {
            key: config.key.clone(),
            kind: config.kind,
            parent: config.parent.clone(),
            log_id: log_id.clone(),
            logic,
            state: state.clone(),
            handle: handle.clone(),
            transports,
            pool,
            settings: config.settings.clone(),
            local_addr: config.local_addr,
            remote_addr: config.remote_addr,
            response_target: None,
            events: config.events.clone(),
            branch,
            user: config.user,
            ack_waiter: None,
            cmd_tx: cmd_tx.clone(),
            timers: HashMap::new(),
            generation: 0,
            finished: false,
        };
        if config.parent.is_some() {
            // Children start with only their lifetime bound
            let mut runner = runner;
            runner.start_timer(TimerType::MaxLifetime, config.settings.max_lifetime);
            tokio::spawn(run_transaction_loop(runner, cmd_rx));
        } else {
            tokio::spawn(run_transaction_loop(runner, cmd_rx));
        }

        Transaction {
            key: config.key,
            kind: config.kind,
            parent: config.parent,
            log_id,
            request: config.request,
            local_addr: config.local_addr,
            remote_addr: config.remote_addr,
            transport_type: config.transport_type,
            state,
            cmd_tx,
            children: Mutex::new(HashMap::new()),
            remote_tag: Mutex::new(None),
            events: Mutex::new(config.events),
        }
    })
}

struct Runner {
    key: TransactionKey,
    kind: TransactionKind,
    parent: Option<TransactionKey>,
    log_id: String,
    logic: TransactionLogic,
    state: Arc<AtomicTransactionState>,
    handle: Weak<Transaction>,
    transports: Arc<TransportTable>,
    pool: Arc<TransactionPool>,
    settings: TimerSettings,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    response_target: Option<SocketAddr>,
    events: Option<mpsc::UnboundedSender<ClientEvent>>,
    branch: Option<String>,
    user: Option<Weak<dyn TransactionUser>>,
    ack_waiter: Option<oneshot::Sender<Result<SipMessage>>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    timers: HashMap<TimerType, (u64, JoinHandle<()>)>,
    generation: u64,
    finished: bool,
}

/// Main event loop of one transaction
async fn run_transaction_loop(mut runner: Runner, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
    debug!(id = %runner.key, kind = %runner.kind, "Transaction loop started");

    while let Some(command) = cmd_rx.recv().await {
        match command {
            Command::Send { message, destination, ack_waiter, reply } => {
                if let Some(destination) = destination {
                    runner.response_target = Some(destination);
                }
                let result = match runner.logic.on_send(message) {
                    Ok(actions) => {
                        if ack_waiter.is_some() {
                            runner.ack_waiter = ack_waiter;
                        }
                        runner.execute(actions).await
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::SendAckFor2xx { ack, target, reply } => {
                let actions = runner.logic.on_ack_for_2xx(ack, target);
                let result = runner.execute(actions).await;
                let _ = reply.send(result);
            }
            Command::Receive { message, source } => {
                let actions = runner.logic.on_receive(message, source);
                if let Err(e) = runner.execute(actions).await {
                    warn!(id = %runner.key, error = %e, "Failed to process inbound message");
                }
            }
            Command::Timer { timer, generation } => {
                let armed = runner.timers.get(&timer).map(|(g, _)| *g);
                if armed != Some(generation) {
                    trace!(id = %runner.key, timer = %timer, "Ignoring stale timer");
                    continue;
                }
                runner.timers.remove(&timer);
                trace!(id = %runner.key, timer = %timer, state = %runner.logic.state(), "Timer fired");
                let actions = runner.logic.on_timer(timer);
                if let Err(e) = runner.execute(actions).await {
                    warn!(id = %runner.key, timer = %timer, error = %e, "Timer action failed");
                }
            }
            Command::Terminate { reply } => {
                runner.fail_unfinished(TransactionError::Terminated { key: runner.key.clone() });
                runner.finish();
                let _ = reply.send(Ok(()));
            }
            Command::BranchFinal => {
                let actions = runner.logic.on_branch_final();
                if let Err(e) = runner.execute(actions).await {
                    warn!(id = %runner.key, error = %e, "Failed to settle branch");
                }
            }
        }

        runner.state.store(runner.logic.state());
        if runner.finished {
            break;
        }
    }

    debug!(id = %runner.key, log_id = %runner.log_id, "Transaction loop exited");
}

impl Runner {
    async fn execute(&mut self, actions: Vec<Action>) -> Result<()> {
        // Readers see the new state before any side effect of the transition
        self.state.store(self.logic.state());
        let mut outcome = Ok(());
        for action in actions {
            if self.finished {
                break;
            }
            match action {
                Action::Transmit(message) => {
                    let destination = if self.kind.is_client() {
                        self.remote_addr
                    } else {
                        self.response_target.unwrap_or(self.remote_addr)
                    };
                    if let Err(e) = self.transmit(&message, destination).await {
                        outcome = Err(e.clone());
                        self.fail_unfinished(e);
                        self.finish();
                    }
                }
                Action::TransmitTo(message, destination) => {
                    if let Err(e) = self.transmit(&message, destination).await {
                        outcome = Err(e);
                    }
                }
                Action::Deliver(response) => self.deliver(response),
                Action::Timeout => {
                    let error = TransactionError::Timeout { key: self.key.clone() };
                    if self.kind.is_client() {
                        self.fail_unfinished(error);
                    } else if let Some(waiter) = self.ack_waiter.take() {
                        let _ = waiter.send(Err(error));
                    }
                }
                Action::DispatchRequest(request) => self.dispatch_request(request),
                Action::AckReceived(ack) => {
                    if let Some(waiter) = self.ack_waiter.take() {
                        let _ = waiter.send(Ok(ack));
                    }
                }
                Action::StartTimer(timer, duration) => self.start_timer(timer, duration),
                Action::CancelTimer(timer) => self.cancel_timer(timer),
                Action::Terminate => self.finish(),
            }
        }
        outcome
    }

    async fn transmit(&self, message: &SipMessage, destination: SocketAddr) -> Result<()> {
        trace!(id = %self.key, %destination, start_line = %message.start_line(), "Sending");
        self.transports
            .send(self.local_addr, message, destination)
            .await
            .map_err(|e| TransactionError::Transport {
                key: self.key.clone(),
                message: e.to_string(),
            })
    }

    fn deliver(&mut self, response: SipMessage) {
        let is_final = response.is_final_response();
        if is_final && !self.logic.mark_finalized() {
            return;
        }
        if let Some(events) = &self.events {
            let _ = events.send(ClientEvent::Response { response, branch: self.branch.clone() });
        }
        if is_final && self.kind == TransactionKind::InviteClient {
            self.settle_siblings();
        }
    }

    /// Settles every other branch of this INVITE, parent included
    fn settle_siblings(&self) {
        let root_key = self.parent.as_ref().unwrap_or(&self.key);
        let Some(root) = self.pool.find(root_key) else {
            return;
        };
        let siblings = std::iter::once(root_key.clone()).chain(root.branches());
        for key in siblings.filter(|k| *k != self.key) {
            if let Some(sibling) = self.pool.find(&key) {
                trace!(id = %self.key, sibling = %key, "Settling sibling branch");
                sibling.settle_branch();
            }
        }
    }

    /// Reports a failure unless the user already has its terminal event
    fn fail_unfinished(&mut self, error: TransactionError) {
        if !self.kind.is_client() || !self.logic.mark_finalized() {
            return;
        }
        debug!(id = %self.key, error = %error, "Client transaction failed");
        if let Some(events) = &self.events {
            let _ = events.send(ClientEvent::Failed { error, branch: self.branch.clone() });
        }
    }

    fn dispatch_request(&self, request: SipMessage) {
        let user = self.user.as_ref().and_then(Weak::upgrade);
        let handle = self.handle.upgrade();
        match (user, handle) {
            (Some(user), Some(transaction)) => {
                tokio::spawn(async move {
                    user.on_request(request, transaction).await;
                });
            }
            _ => warn!(id = %self.key, "No transaction user for inbound request"),
        }
    }

    fn start_timer(&mut self, timer: TimerType, duration: Duration) {
        self.cancel_timer(timer);
        self.generation += 1;
        let generation = self.generation;
        let cmd_tx = self.cmd_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = cmd_tx.send(Command::Timer { timer, generation });
        });
        self.timers.insert(timer, (generation, task));
    }

    fn cancel_timer(&mut self, timer: TimerType) {
        if let Some((_, task)) = self.timers.remove(&timer) {
            task.abort();
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let _ = self.logic.transition(TransactionState::Terminated);
        self.state.store(TransactionState::Terminated);

        for (_, (_, task)) in self.timers.drain() {
            task.abort();
        }
        self.pool.remove(&self.key);
        if self.kind == TransactionKind::InviteServer {
            self.pool.block(self.key.clone(), self.settings.timer_h());
        }
        if let Some(handle) = self.handle.upgrade() {
            handle.release_event_sender();
        }
        self.events = None;
        self.ack_waiter = None;
        debug!(id = %self.key, kind = %self.kind, "Transaction terminated");
    }
}
