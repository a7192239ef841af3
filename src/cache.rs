use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Display};
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::channel::CommandRunner;

pub trait Liveness {
    fn is_live(&self) -> bool;
}

impl Liveness for bool {
    fn is_live(&self) -> bool {
        *self
    }
}

#[async_trait]
pub trait LivenessProbe<K: Sync>: Send {
    type Observation: Liveness + Send;

    async fn observe(&mut self, key: &K, runner: &dyn CommandRunner) -> Self::Observation;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Refresh<V> {
    Fresh(V),
    Cached(V),
    /// The fetch failed and the previous good value is served instead.
    Fallback(V),
    Failed,
    /// Inactive with nothing cached; no fetch was attempted.
    NotChecked,
}

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

pub struct ResourceCache<K, V, P> {
    ttl: Duration,
    entries: HashMap<K, Entry<V>>,
    seen: HashSet<K>,
    probe: P,
}

impl<K, V, P> ResourceCache<K, V, P>
where
    K: Eq + Hash + Clone + Debug + Sync,
    V: Clone,
    P: LivenessProbe<K>,
{
    pub fn new(ttl: Duration, probe: P) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            seen: HashSet::new(),
            probe,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn stored_at(&self, key: &K) -> Option<Instant> {
        self.entries.get(key).map(|e| e.stored_at)
    }

    pub fn put(&mut self, key: K, value: V, now: Instant) {
        self.entries.insert(
            key,
            Entry {
                value,
                stored_at: now,
            },
        );
    }

    pub fn is_expired(&self, key: &K, now: Instant, ttl: Duration) -> bool {
        self.entries
            .get(key)
            .map(|e| now.saturating_duration_since(e.stored_at) >= ttl)
            .unwrap_or(true)
    }

    /// Drops expired entries, except those `pinned` reports as belonging to an
    /// inactive resource. Returns the number of entries removed.
    pub fn evict_expired(&mut self, now: Instant, pinned: impl Fn(&K) -> bool) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            let expired = now.saturating_duration_since(entry.stored_at) >= ttl;
            if expired && pinned(key) {
                debug!(key = ?key, "keeping expired entry for inactive resource");
            }
            !expired || pinned(key)
        });
        before - self.entries.len()
    }

    pub fn is_first_observation(&self, key: &K) -> bool {
        !self.seen.contains(key)
    }

    pub fn mark_observed(&mut self, key: &K) {
        self.seen.insert(key.clone());
    }

    pub async fn observe_resource(&mut self, key: &K, runner: &dyn CommandRunner) -> P::Observation {
        self.probe.observe(key, runner).await
    }

    pub async fn is_resource_live(&mut self, key: &K, runner: &dyn CommandRunner) -> bool {
        self.observe_resource(key, runner).await.is_live()
    }

    /// Applies the refresh policy for one key: fetch on first observation or
    /// when live, otherwise serve whatever is cached without fetching.
    pub async fn refresh<F, Fut, E>(&mut self, key: &K, live: bool, now: Instant, fetch: F) -> Refresh<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Display,
    {
        let first = self.is_first_observation(key);
        if !first && !live {
            return match self.get(key) {
                Some(value) => Refresh::Cached(value.clone()),
                None => Refresh::NotChecked,
            };
        }

        self.mark_observed(key);
        match fetch().await {
            Ok(value) => {
                self.put(key.clone(), value.clone(), now);
                Refresh::Fresh(value)
            }
            Err(err) => {
                warn!(key = ?key, first, error = %err, "resource fetch failed");
                match self.get(key) {
                    Some(value) => Refresh::Fallback(value.clone()),
                    None => Refresh::Failed,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedRunner;

    #[derive(Default)]
    struct Switch {
        live: HashMap<String, bool>,
        calls: usize,
    }

    #[async_trait]
    impl LivenessProbe<String> for Switch {
        type Observation = bool;

        async fn observe(&mut self, key: &String, _runner: &dyn CommandRunner) -> bool {
            self.calls += 1;
            self.live.get(key).copied().unwrap_or(true)
        }
    }

    fn cache() -> ResourceCache<String, u32, Switch> {
        ResourceCache::new(Duration::from_secs(60), Switch::default())
    }

    async fn ok(v: u32) -> Result<u32, String> {
        Ok(v)
    }

    async fn fail() -> Result<u32, String> {
        Err("boom".to_string())
    }

    #[tokio::test]
    async fn first_observation_fetches_even_when_inactive() {
        let mut cache = cache();
        let key = "sda".to_string();
        let now = Instant::now();
        assert!(cache.is_first_observation(&key));
        assert_eq!(cache.refresh(&key, false, now, || ok(7)).await, Refresh::Fresh(7));
        assert!(!cache.is_first_observation(&key));
        assert_eq!(cache.get(&key), Some(&7));
        assert_eq!(cache.stored_at(&key), Some(now));
    }

    #[tokio::test]
    async fn inactive_resource_serves_cache_without_fetching() {
        let mut cache = cache();
        let key = "sda".to_string();
        let now = Instant::now();
        cache.refresh(&key, true, now, || ok(1)).await;

        let mut fetched = false;
        let later = now + Duration::from_secs(600);
        let out = cache
            .refresh(&key, false, later, || {
                fetched = true;
                ok(2)
            })
            .await;
        assert_eq!(out, Refresh::Cached(1));
        assert!(!fetched);
        assert!(cache.is_expired(&key, later, cache.ttl()));
    }

    #[tokio::test]
    async fn failed_fetch_falls_back_to_previous_value() {
        let mut cache = cache();
        let key = "sdb".to_string();
        let now = Instant::now();
        assert_eq!(cache.refresh(&key, true, now, fail).await, Refresh::Failed);
        cache.refresh(&key, true, now, || ok(5)).await;
        assert_eq!(cache.refresh(&key, true, now, fail).await, Refresh::Fallback(5));
        assert_eq!(cache.stored_at(&key), Some(now));
    }

    #[tokio::test]
    async fn inactive_without_cache_is_not_checked() {
        let mut cache = cache();
        let key = "sdc".to_string();
        cache.mark_observed(&key);
        assert_eq!(
            cache.refresh(&key, false, Instant::now(), || ok(1)).await,
            Refresh::NotChecked
        );
    }

    #[test]
    fn eviction_keeps_pinned_entries() {
        let mut cache = cache();
        let now = Instant::now();
        cache.put("sda".to_string(), 1, now);
        cache.put("sdb".to_string(), 2, now);
        cache.put("sdc".to_string(), 3, now + Duration::from_secs(100));

        let removed = cache.evict_expired(now + Duration::from_secs(120), |k| k == "sdb");
        assert_eq!(removed, 1);
        assert!(cache.get(&"sda".to_string()).is_none());
        assert_eq!(cache.get(&"sdb".to_string()), Some(&2));
        assert_eq!(cache.get(&"sdc".to_string()), Some(&3));
    }

    #[test]
    fn missing_key_is_expired() {
        let cache = cache();
        assert!(cache.is_expired(&"nope".to_string(), Instant::now(), Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn liveness_delegates_to_probe() {
        let mut probe = Switch::default();
        probe.live.insert("sda".to_string(), false);
        let mut cache: ResourceCache<String, u32, Switch> =
            ResourceCache::new(Duration::from_secs(60), probe);
        let runner = ScriptedRunner::new();
        assert!(!cache.is_resource_live(&"sda".to_string(), &runner).await);
        assert!(cache.is_resource_live(&"sdb".to_string(), &runner).await);
        assert_eq!(cache.probe.calls, 2);
    }
}
