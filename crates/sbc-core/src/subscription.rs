//! Subscription correlation cache
//!
//! Established subscriptions are kept so that refreshes and NOTIFYs can be
//! routed without consulting the route policy again. Entries live in one of
//! five buckets chosen by the negotiated `Expires`:
//!
//! | Expires       | bucket |
//! |---------------|--------|
//! | <= 2h         | 2h     |
//! | <= 4h         | 4h     |
//! | <= 8h         | 8h     |
//! | <= 16h        | 16h    |
//! | otherwise     | 24h    |
//!
//! An entry ages out with its bucket's lifetime. Lookups check every bucket.
//! Registration first deletes the key from all buckets, so a refresh that
//! moves an entry to another bucket never leaves a stale copy behind.

use std::net::SocketAddr;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use sbc_sip_core::SipMessage;

const HOUR: u64 = 3600;

/// Lifetimes of the buckets, shortest first
pub const BUCKET_LIFETIMES: [Duration; 5] = [
    Duration::from_secs(2 * HOUR),
    Duration::from_secs(4 * HOUR),
    Duration::from_secs(8 * HOUR),
    Duration::from_secs(16 * HOUR),
    Duration::from_secs(24 * HOUR),
];

/// An established subscription and the routing state negotiated for it
#[derive(Debug, Clone)]
pub struct Subscription {
    pub event: String,
    pub call_id: String,
    /// The subscriber's SUBSCRIBE as received
    pub request: SipMessage,
    pub expires: u32,
    /// Where refreshes are forwarded
    pub target_address: Option<SocketAddr>,
    /// Interface refreshes leave from
    pub local_interface: Option<SocketAddr>,
    /// Notifier's Contact, the Request-URI of forwarded refreshes
    pub target_uri: Option<String>,
    /// Route set toward the notifier
    pub routes: Vec<String>,
    /// Contact the SBC presented to the subscriber
    pub notify_local_contact: Option<String>,
    /// Interface NOTIFYs to the subscriber leave from
    pub notify_local_address: Option<SocketAddr>,
    /// Packet source of the subscriber
    pub notify_target_address: Option<SocketAddr>,
    /// From of NOTIFYs toward the subscriber (the SUBSCRIBE's To with tag)
    pub notify_from_uri: Option<String>,
}

impl Subscription {
    pub fn key(&self) -> String {
        subscription_key(&self.event, &self.call_id)
    }
}

#[derive(Debug, Clone)]
struct CachedSubscription {
    subscription: Subscription,
    inserted_at: Instant,
}

/// Cache key for an (event, Call-ID) pair
pub fn subscription_key(event: &str, call_id: &str) -> String {
    let event = event.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    format!("{}{}", event, call_id)
}

/// Index of the bucket for an Expires value in seconds
pub fn bucket_for(expires: u32) -> usize {
    let expires = Duration::from_secs(u64::from(expires));
    BUCKET_LIFETIMES
        .iter()
        .position(|lifetime| expires <= *lifetime)
        .unwrap_or(BUCKET_LIFETIMES.len() - 1)
}

pub struct SubscriptionCache {
    buckets: Vec<DashMap<String, CachedSubscription>>,
}

impl SubscriptionCache {
    pub fn new() -> Self {
        SubscriptionCache {
            buckets: BUCKET_LIFETIMES.iter().map(|_| DashMap::new()).collect(),
        }
    }

    /// Inserts or refreshes a subscription, returning the bucket it landed in.
    ///
    /// `Expires: 0` removes the subscription instead and returns `None`.
    pub fn register(&self, subscription: Subscription) -> Option<usize> {
        let key = subscription.key();
        self.expire(&key);
        if subscription.expires == 0 {
            return None;
        }
        let bucket = bucket_for(subscription.expires);
        debug!(%key, bucket, expires = subscription.expires, "Registered subscription");
        self.buckets[bucket].insert(
            key,
            CachedSubscription { subscription, inserted_at: Instant::now() },
        );
        Some(bucket)
    }

    /// Looks the key up in every bucket, dropping it if it has aged out
    pub fn find(&self, key: &str) -> Option<Subscription> {
        for (index, bucket) in self.buckets.iter().enumerate() {
            let Some(entry) = bucket.get(key) else {
                continue;
            };
            if entry.inserted_at.elapsed() < BUCKET_LIFETIMES[index] {
                return Some(entry.subscription.clone());
            }
            drop(entry);
            bucket.remove(key);
            debug!(%key, bucket = index, "Subscription aged out");
        }
        None
    }

    pub fn find_by(&self, event: &str, call_id: &str) -> Option<Subscription> {
        self.find(&subscription_key(event, call_id))
    }

    /// Removes the key from every bucket; returns whether it was present
    pub fn expire(&self, key: &str) -> bool {
        let mut removed = false;
        for bucket in &self.buckets {
            removed |= bucket.remove(key).is_some();
        }
        removed
    }

    /// Bucket currently holding the key
    pub fn bucket_of(&self, key: &str) -> Option<usize> {
        self.buckets.iter().position(|b| b.contains_key(key))
    }

    /// Drops every aged-out entry
    pub fn purge_expired(&self) -> usize {
        let mut purged = 0;
        for (index, bucket) in self.buckets.iter().enumerate() {
            let before = bucket.len();
            bucket.retain(|_, e| e.inserted_at.elapsed() < BUCKET_LIFETIMES[index]);
            purged += before - bucket.len();
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(DashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SubscriptionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(call_id: &str, expires: u32) -> Subscription {
        Subscription {
            event: "presence".into(),
            call_id: call_id.into(),
            request: SipMessage::request("SUBSCRIBE", "sip:bob@example.com"),
            expires,
            target_address: None,
            local_interface: None,
            target_uri: None,
            routes: Vec::new(),
            notify_local_contact: None,
            notify_local_address: None,
            notify_target_address: None,
            notify_from_uri: None,
        }
    }

    #[test]
    fn bucket_thresholds() {
        assert_eq!(bucket_for(3600), 0);
        assert_eq!(bucket_for(7200), 0);
        assert_eq!(bucket_for(7201), 1);
        assert_eq!(bucket_for(30000), 3);
        assert_eq!(bucket_for(86400), 4);
        assert_eq!(bucket_for(200000), 4);
    }

    #[test]
    fn event_parameters_do_not_change_the_key() {
        assert_eq!(subscription_key("Presence;id=1", "abc"), subscription_key("presence", "abc"));
    }

    #[tokio::test]
    async fn expires_zero_removes_the_subscription() {
        let cache = SubscriptionCache::new();
        assert_eq!(cache.register(subscription("c1", 3600)), Some(0));
        assert!(cache.find_by("presence", "c1").is_some());

        assert_eq!(cache.register(subscription("c1", 0)), None);
        assert!(cache.find_by("presence", "c1").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn refresh_moves_between_buckets() {
        let cache = SubscriptionCache::new();
        let key = subscription_key("presence", "c1");
        cache.register(subscription("c1", 3600));
        cache.register(subscription("c1", 30000));
        assert_eq!(cache.bucket_of(&key), Some(3));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_age_out_with_their_bucket() {
        let cache = SubscriptionCache::new();
        cache.register(subscription("short", 60));
        cache.register(subscription("long", 50000));

        tokio::time::advance(Duration::from_secs(2 * HOUR + 1)).await;
        assert!(cache.find_by("presence", "short").is_none());
        assert!(cache.find_by("presence", "long").is_some());
        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(cache.len(), 1);
    }
}
