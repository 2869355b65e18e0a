//! Delayed disconnect
//!
//! Some endpoints send BYE before media has settled on the far side. When a
//! [`DisconnectPolicy`] is configured, a BYE for a call that has been connected
//! for less than the minimum connect time is held back for the yield time
//! before it is processed.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::DisconnectConfig;

/// Connect times of answered calls, keyed by Call-ID
#[derive(Debug, Default)]
pub struct CallTimers {
    started: DashMap<String, Instant>,
}

impl CallTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the connect time; a later call for the same Call-ID is ignored
    pub fn mark_call_start(&self, call_id: &str) {
        self.started.entry(call_id.to_string()).or_insert_with(Instant::now);
    }

    /// Time since the call connected, zero for unknown calls
    pub fn call_duration(&self, call_id: &str) -> Duration {
        self.started
            .get(call_id)
            .map(|start| start.elapsed())
            .unwrap_or_default()
    }

    pub fn remove_call_start(&self, call_id: &str) -> bool {
        self.started.remove(call_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.started.len()
    }

    pub fn is_empty(&self) -> bool {
        self.started.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectPolicy {
    pub min_connect_time: Duration,
    pub yield_time: Duration,
}

impl DisconnectPolicy {
    pub fn new(min_connect_time: Duration, yield_time: Duration) -> Self {
        DisconnectPolicy { min_connect_time, yield_time }
    }

    /// How long to hold back a BYE for a call connected for `call_duration`
    pub fn delay_for(&self, call_duration: Duration) -> Option<Duration> {
        (call_duration < self.min_connect_time && !self.yield_time.is_zero()).then_some(self.yield_time)
    }
}

impl From<&DisconnectConfig> for DisconnectPolicy {
    fn from(config: &DisconnectConfig) -> Self {
        DisconnectPolicy::new(config.min_connect_time(), config.yield_time())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn duration_counts_from_first_mark() {
        let timers = CallTimers::new();
        assert_eq!(timers.call_duration("c1"), Duration::ZERO);

        timers.mark_call_start("c1");
        tokio::time::advance(Duration::from_secs(3)).await;
        timers.mark_call_start("c1");
        assert_eq!(timers.call_duration("c1"), Duration::from_secs(3));

        assert!(timers.remove_call_start("c1"));
        assert!(!timers.remove_call_start("c1"));
        assert!(timers.is_empty());
    }

    #[test]
    fn short_calls_are_delayed() {
        let policy = DisconnectPolicy::new(Duration::from_secs(5), Duration::from_secs(2));
        assert_eq!(policy.delay_for(Duration::from_secs(1)), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for(Duration::from_secs(5)), None);

        let no_yield = DisconnectPolicy::new(Duration::from_secs(5), Duration::ZERO);
        assert_eq!(no_yield.delay_for(Duration::ZERO), None);
    }
}
