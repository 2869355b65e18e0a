//! Key-value persistence seam
//!
//! Dialog records are persisted through [`KeyValueStore`], so a disk-backed
//! engine can be plugged in without touching the dialog logic. Filters for
//! [`KeyValueStore::get_keys`] and [`KeyValueStore::get_records`] are glob
//! wildcards (`*` and `?`), not regular expressions.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Result, SbcError};

pub trait KeyValueStore: Send + Sync {
    /// Opens (or reopens) the store at `path`
    fn open(&self, path: &str) -> Result<()>;

    fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    fn put(&self, key: &str, value: &str) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Deletes a key, returning whether it existed
    fn del(&self, key: &str) -> Result<bool>;

    /// Keys matching a glob filter, in key order
    fn get_keys(&self, filter: &str) -> Result<Vec<String>>;

    /// Records matching a glob filter, in key order
    fn get_records(&self, filter: &str) -> Result<Vec<(String, String)>>;
}

/// Volatile store backed by an ordered map
#[derive(Debug)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, String>>,
    open: AtomicBool,
}

impl MemoryStore {
    /// Creates an already opened, empty store
    pub fn new() -> Self {
        MemoryStore {
            records: RwLock::new(BTreeMap::new()),
            open: AtomicBool::new(true),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(SbcError::store("store is closed"))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn open(&self, path: &str) -> Result<()> {
        debug!(path, "Opening memory store");
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_open()?;
        self.records.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_open()?;
        Ok(self.records.read().get(key).cloned())
    }

    fn del(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.records.write().remove(key).is_some())
    }

    fn get_keys(&self, filter: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        Ok(self
            .records
            .read()
            .keys()
            .filter(|k| wildcard_match(filter, k))
            .cloned()
            .collect())
    }

    fn get_records(&self, filter: &str) -> Result<Vec<(String, String)>> {
        self.ensure_open()?;
        Ok(self
            .records
            .read()
            .iter()
            .filter(|(k, _)| wildcard_match(filter, k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Glob match where `*` spans any run of characters and `?` exactly one
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<usize> = None;
    let mut resume = 0;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            resume = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            resume += 1;
            t = resume;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}
