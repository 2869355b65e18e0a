//! Registry of live transactions
//!
//! The pool owns every live [`Transaction`] by id. Creation, lookup and
//! removal go through one coarse lock. Registering an id that is already
//! live is a programming error and panics; the dispatcher uses
//! [`TransactionPool::find_or_insert_with`] so racing retransmissions of the
//! same request resolve to one transaction instead.
//!
//! Terminated INVITE server transactions leave a short-lived block entry so
//! that late retransmissions of the INVITE do not start a second transaction.
//! Expired entries are swept every [`BLOCK_SWEEP_EVERY`] blocks and by
//! [`TransactionPool::purge_blocked`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::transaction::{Transaction, TransactionKey, TransactionState};

/// Block entries between two sweeps of expired ones
pub const BLOCK_SWEEP_EVERY: usize = 256;

#[derive(Debug, Default)]
pub struct TransactionPool {
    transactions: Mutex<HashMap<TransactionKey, Arc<Transaction>>>,
    blocked: DashMap<TransactionKey, Instant>,
}

impl TransactionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transaction.
    ///
    /// # Panics
    ///
    /// Panics if a live transaction already uses the same id.
    pub fn insert(&self, transaction: Arc<Transaction>) {
        let mut transactions = self.transactions.lock();
        let key = transaction.key().clone();
        if transactions.contains_key(&key) {
            panic!("transaction id collision: {}", key);
        }
        transactions.insert(key, transaction);
    }

    /// Returns the live transaction for `key`, creating it with `create` if absent.
    ///
    /// The flag is true when the transaction was created by this call.
    pub fn find_or_insert_with<F>(&self, key: &TransactionKey, create: F) -> (Arc<Transaction>, bool)
    where
        F: FnOnce() -> Arc<Transaction>,
    {
        let mut transactions = self.transactions.lock();
        if let Some(existing) = transactions.get(key) {
            return (existing.clone(), false);
        }
        let transaction = create();
        transactions.insert(key.clone(), transaction.clone());
        (transaction, true)
    }

    pub fn find(&self, key: &TransactionKey) -> Option<Arc<Transaction>> {
        self.transactions.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &TransactionKey) -> Option<Arc<Transaction>> {
        self.transactions.lock().remove(key)
    }

    pub fn contains(&self, key: &TransactionKey) -> bool {
        self.transactions.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.transactions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<TransactionKey> {
        self.transactions.lock().keys().cloned().collect()
    }

    /// Rejects new server transactions for `key` for the given time
    pub fn block(&self, key: TransactionKey, ttl: Duration) {
        self.blocked.insert(key, Instant::now() + ttl);
        if self.blocked.len() % BLOCK_SWEEP_EVERY == 0 {
            self.purge_blocked();
        }
    }

    pub fn is_blocked(&self, key: &TransactionKey) -> bool {
        let expired = match self.blocked.get(key) {
            Some(until) => *until <= Instant::now(),
            None => return false,
        };
        if expired {
            self.blocked.remove(key);
            return false;
        }
        true
    }

    /// Drops block entries that have run out and returns how many went
    pub fn purge_blocked(&self) -> usize {
        let now = Instant::now();
        let before = self.blocked.len();
        self.blocked.retain(|_, until| *until > now);
        let purged = before.saturating_sub(self.blocked.len());
        if purged > 0 {
            trace!(purged, "Purged expired transaction blocks");
        }
        purged
    }

    pub fn blocked_len(&self) -> usize {
        self.blocked.len()
    }

    /// True when the transaction and each of its children have completed.
    /// Children no longer in the pool have terminated and count as completed.
    pub fn all_branches_completed(&self, key: &TransactionKey) -> bool {
        self.all_branches(key, |state| state.is_completed())
    }

    /// True when the transaction and each of its children have terminated
    pub fn all_branches_terminated(&self, key: &TransactionKey) -> bool {
        self.all_branches(key, |state| state == TransactionState::Terminated)
    }

    fn all_branches<F>(&self, key: &TransactionKey, predicate: F) -> bool
    where
        F: Fn(TransactionState) -> bool,
    {
        let Some(parent) = self.find(key) else {
            return true;
        };
        if !predicate(parent.state()) {
            return false;
        }
        parent
            .branches()
            .iter()
            .all(|child| self.find(child).is_none_or(|c| predicate(c.state())))
    }

    /// Terminates every live transaction
    pub async fn terminate_all(&self) {
        let transactions: Vec<Arc<Transaction>> =
            self.transactions.lock().values().cloned().collect();
        debug!(count = transactions.len(), "Terminating all transactions");
        for transaction in transactions {
            let _ = transaction.terminate().await;
        }
        self.transactions.lock().clear();
    }
}
