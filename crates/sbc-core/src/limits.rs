//! Concurrent call limits per caller domain and per dialed prefix
//!
//! A call is admitted against the limit of its From domain and the limit of
//! the longest configured prefix of the dialed number. Admission is all or
//! nothing: a refused call counts against neither. Prefix entries may list
//! aliases separated by commas (`"1800,1888"`); they share one counter.

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::config::LimitsConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitViolation {
    #[error("domain {domain} is at its limit of {limit} calls")]
    Domain { domain: String, limit: usize },

    #[error("prefix {prefix} is at its limit of {limit} calls")]
    Prefix { prefix: String, limit: usize },
}

#[derive(Debug, Clone)]
struct Admitted {
    domain: Option<String>,
    prefix: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    domains: HashMap<String, usize>,
    prefixes: HashMap<String, usize>,
    calls: HashMap<String, Admitted>,
}

#[derive(Debug, Default)]
pub struct CallLimits {
    domains: HashMap<String, usize>,
    /// Alias to (counter key, limit)
    prefixes: HashMap<String, (String, usize)>,
    counters: Mutex<Counters>,
}

impl CallLimits {
    pub fn new(config: &LimitsConfig) -> Self {
        let domains = config
            .domains
            .iter()
            .filter(|d| d.enabled)
            .map(|d| (d.domain.to_ascii_lowercase(), d.max_channels))
            .collect();

        let mut prefixes = HashMap::new();
        for entry in config.prefixes.iter().filter(|p| p.enabled) {
            let aliases: Vec<&str> = entry.prefix.split(',').map(str::trim).filter(|a| !a.is_empty()).collect();
            let Some(first) = aliases.first() else {
                continue;
            };
            for alias in &aliases {
                prefixes.insert(alias.to_string(), (first.to_string(), entry.max_channels));
            }
        }

        CallLimits { domains, prefixes, counters: Mutex::new(Counters::default()) }
    }

    /// Counts `session_id` against its domain and prefix limits.
    ///
    /// Admitting a session that is already counted is a no-op.
    pub fn admit(&self, session_id: &str, dial_string: &str, domain: &str) -> Result<(), LimitViolation> {
        let mut counters = self.counters.lock();
        if counters.calls.contains_key(session_id) {
            return Ok(());
        }

        let domain = domain.to_ascii_lowercase();
        let domain_limit = self.domains.get(&domain).copied();
        if let Some(limit) = domain_limit {
            if counters.domains.get(&domain).copied().unwrap_or(0) >= limit {
                return Err(LimitViolation::Domain { domain, limit });
            }
        }

        let prefix = self.longest_prefix(dial_string);
        if let Some((key, limit)) = &prefix {
            if counters.prefixes.get(key).copied().unwrap_or(0) >= *limit {
                return Err(LimitViolation::Prefix { prefix: key.clone(), limit: *limit });
            }
        }

        let admitted = Admitted {
            domain: domain_limit.map(|_| domain),
            prefix: prefix.map(|(key, _)| key),
        };
        if let Some(domain) = &admitted.domain {
            *counters.domains.entry(domain.clone()).or_default() += 1;
        }
        if let Some(prefix) = &admitted.prefix {
            *counters.prefixes.entry(prefix.clone()).or_default() += 1;
        }
        debug!(%session_id, domain = ?admitted.domain, prefix = ?admitted.prefix, "Call admitted");
        counters.calls.insert(session_id.to_string(), admitted);
        Ok(())
    }

    /// Releases the slots held by `session_id`; false if it held none
    pub fn release(&self, session_id: &str) -> bool {
        let mut counters = self.counters.lock();
        let Some(admitted) = counters.calls.remove(session_id) else {
            return false;
        };
        if let Some(domain) = admitted.domain {
            if let Some(count) = counters.domains.get_mut(&domain) {
                *count = count.saturating_sub(1);
            }
        }
        if let Some(prefix) = admitted.prefix {
            if let Some(count) = counters.prefixes.get_mut(&prefix) {
                *count = count.saturating_sub(1);
            }
        }
        true
    }

    pub fn domain_count(&self, domain: &str) -> usize {
        self.counters.lock().domains.get(&domain.to_ascii_lowercase()).copied().unwrap_or(0)
    }

    /// Calls counted against `prefix` or the entry it is an alias of
    pub fn prefix_count(&self, prefix: &str) -> usize {
        let key = self.prefixes.get(prefix).map_or(prefix, |(key, _)| key.as_str());
        self.counters.lock().prefixes.get(key).copied().unwrap_or(0)
    }

    pub fn active_calls(&self) -> usize {
        self.counters.lock().calls.len()
    }

    fn longest_prefix(&self, dial_string: &str) -> Option<(String, usize)> {
        self.prefixes
            .iter()
            .filter(|(alias, _)| dial_string.starts_with(alias.as_str()))
            .max_by_key(|(alias, _)| alias.len())
            .map(|(_, entry)| entry.clone())
    }
}
