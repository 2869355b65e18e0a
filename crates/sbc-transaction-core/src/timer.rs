//! RFC 3261 transaction timers
//!
//! ## Client Transaction Timers
//! - **Timer A** (INVITE): request retransmission, unreliable transports only
//! - **Timer B** (INVITE): transaction timeout
//! - **Timer D** (INVITE): wait time for response retransmissions
//! - **Timer E** (non-INVITE): request retransmission, unreliable transports only
//! - **Timer F** (non-INVITE): transaction timeout
//! - **Timer K** (non-INVITE): wait time for response retransmissions
//!
//! ## Server Transaction Timers
//! - **Timer G** (INVITE): response retransmission
//! - **Timer H** (INVITE): wait time for ACK
//! - **Timer I** (INVITE): wait time in Confirmed state
//! - **Timer J** (non-INVITE): wait time for request retransmissions
//!
//! Every transaction additionally carries a max-lifetime timer that
//! terminates it no matter what state it is stuck in.

use std::fmt;
use std::time::Duration;

/// Timers driving the transaction state machines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerType {
    A,
    B,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
    MaxLifetime,
}

impl fmt::Display for TimerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimerType::A => "A",
            TimerType::B => "B",
            TimerType::D => "D",
            TimerType::E => "E",
            TimerType::F => "F",
            TimerType::G => "G",
            TimerType::H => "H",
            TimerType::I => "I",
            TimerType::J => "J",
            TimerType::K => "K",
            TimerType::MaxLifetime => "MaxLifetime",
        };
        f.write_str(name)
    }
}

/// Base timer values; the individual timers derive from these
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSettings {
    /// RTT estimate
    pub t1: Duration,
    /// Maximum retransmit interval for non-INVITE requests and INVITE responses
    pub t2: Duration,
    /// Maximum duration a message remains in the network
    pub t4: Duration,
    /// Wait time for response retransmissions on an INVITE client
    pub timer_d: Duration,
    /// Hard upper bound on any transaction's life
    pub max_lifetime: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        TimerSettings {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            timer_d: Duration::from_secs(32),
            max_lifetime: Duration::from_secs(300),
        }
    }
}

impl TimerSettings {
    pub fn timer_a(&self) -> Duration {
        self.t1
    }

    pub fn timer_b(&self) -> Duration {
        self.t1 * 64
    }

    pub fn timer_e(&self) -> Duration {
        self.t1
    }

    pub fn timer_f(&self) -> Duration {
        self.t1 * 64
    }

    pub fn timer_g(&self) -> Duration {
        self.t1
    }

    pub fn timer_h(&self) -> Duration {
        self.t1 * 64
    }

    pub fn timer_i(&self) -> Duration {
        self.t4
    }

    pub fn timer_j(&self) -> Duration {
        self.t1 * 64
    }

    pub fn timer_k(&self) -> Duration {
        self.t4
    }

    /// Retransmit base derived from an overall timeout: the timeout spans 64 base intervals
    pub fn base_from_timeout(timeout: Duration) -> Duration {
        (timeout / 64).max(Duration::from_millis(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc_defaults() {
        let settings = TimerSettings::default();
        assert_eq!(settings.t1, Duration::from_millis(500));
        assert_eq!(settings.timer_b(), Duration::from_secs(32));
        assert_eq!(settings.timer_f(), Duration::from_secs(32));
        assert_eq!(settings.timer_h(), Duration::from_secs(32));
        assert_eq!(settings.timer_i(), Duration::from_secs(5));
        assert_eq!(settings.timer_k(), Duration::from_secs(5));
        assert_eq!(settings.timer_d, Duration::from_secs(32));
        assert_eq!(TimerType::A.to_string(), "A");
    }

    #[test]
    fn test_base_from_timeout() {
        assert_eq!(
            TimerSettings::base_from_timeout(Duration::from_millis(6400)),
            Duration::from_millis(100)
        );
        assert_eq!(
            TimerSettings::base_from_timeout(Duration::from_millis(10)),
            Duration::from_millis(1)
        );
    }
}
