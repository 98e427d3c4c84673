//! Shared pool of currently trusted proxies

use crate::proxy::models::ProxyEndpoint;
use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Flat set of usable proxies shared by fetch workers and the refresher.
///
/// Membership only shrinks through [`ProxyPool::evict`] and only grows or
/// resets through [`ProxyPool::replace`]. All three operations take the same
/// lock, so every caller observes either the old or the new membership.
/// The eviction that empties the pool signals [`ProxyPool::drained`] so a
/// refresh can start right away.
#[derive(Debug, Default)]
pub struct ProxyPool {
    members: Mutex<Vec<ProxyEndpoint>>,
    filled: Notify,
    drained: Notify,
}

impl ProxyPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool with an initial membership
    pub fn with_members(members: Vec<ProxyEndpoint>) -> Self {
        let pool = Self::new();
        pool.replace(members);
        pool
    }

    /// Pick one endpoint uniformly at random, or `None` if the pool is empty
    pub fn pick(&self) -> Option<ProxyEndpoint> {
        let members = self.members.lock();
        members.choose(&mut rand::rng()).cloned()
    }

    /// Remove `proxy` if present. Returns whether it was a member.
    pub fn evict(&self, proxy: &ProxyEndpoint) -> bool {
        let mut members = self.members.lock();
        match members.iter().position(|member| member == proxy) {
            Some(index) => {
                members.swap_remove(index);
                debug!(proxy = %proxy, remaining = members.len(), "evicted proxy");
                if members.is_empty() {
                    // Stored as a permit if nobody is waiting yet.
                    self.drained.notify_one();
                }
                true
            }
            None => false,
        }
    }

    /// Swap the whole membership for `new_members`, dropping duplicate addresses.
    /// Returns the size of the new membership.
    pub fn replace(&self, new_members: Vec<ProxyEndpoint>) -> usize {
        let mut seen = HashSet::with_capacity(new_members.len());
        let deduped: Vec<ProxyEndpoint> = new_members
            .into_iter()
            .filter(|member| seen.insert(member.clone()))
            .collect();
        let len = deduped.len();

        *self.members.lock() = deduped;

        if len > 0 {
            self.filled.notify_waiters();
        }
        len
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    pub fn contains(&self, proxy: &ProxyEndpoint) -> bool {
        self.members.lock().contains(proxy)
    }

    /// Copy of the current membership
    pub fn snapshot(&self) -> Vec<ProxyEndpoint> {
        self.members.lock().clone()
    }

    /// Wait until the pool has at least one member, up to `timeout`.
    /// Returns `false` if the pool is still empty when the timeout elapses.
    pub async fn wait_non_empty(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.filled.notified();
                tokio::pin!(notified);
                // Register before checking so a replace between the check
                // and the await is not missed.
                notified.as_mut().enable();
                if !self.is_empty() {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Resolve once an eviction has emptied the pool. A drain that happened
    /// while nobody was waiting is reported to the next caller, so check
    /// [`ProxyPool::is_empty`] before acting on it.
    pub async fn drained(&self) {
        self.drained.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::models::ProxyScheme;
    use std::sync::Arc;

    fn endpoint(last_octet: u8) -> ProxyEndpoint {
        ProxyEndpoint::new(format!("10.0.0.{last_octet}"), 8080, ProxyScheme::Http)
    }

    #[test]
    fn test_pick_on_empty_pool() {
        let pool = ProxyPool::new();
        assert!(pool.pick().is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_pick_returns_member() {
        let pool = ProxyPool::with_members(vec![endpoint(1), endpoint(2), endpoint(3)]);
        for _ in 0..50 {
            let picked = pool.pick().unwrap();
            assert!(pool.contains(&picked));
        }
    }

    #[test]
    fn test_pick_reaches_every_member() {
        let pool = ProxyPool::with_members(vec![endpoint(1), endpoint(2)]);
        let seen: HashSet<_> = (0..200).filter_map(|_| pool.pick()).collect();
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_evict_is_idempotent() {
        let pool = ProxyPool::with_members(vec![endpoint(1), endpoint(2)]);
        assert!(pool.evict(&endpoint(1)));
        assert!(!pool.evict(&endpoint(1)));
        assert_eq!(pool.len(), 1);
        assert!(!pool.contains(&endpoint(1)));
    }

    #[test]
    fn test_evicted_endpoint_never_picked_until_replaced() {
        let pool = ProxyPool::with_members(vec![endpoint(1), endpoint(2), endpoint(3)]);
        pool.evict(&endpoint(2));
        for _ in 0..200 {
            assert_ne!(pool.pick(), Some(endpoint(2)));
        }

        pool.replace(vec![endpoint(2)]);
        assert_eq!(pool.pick(), Some(endpoint(2)));
    }

    #[test]
    fn test_replace_deduplicates() {
        let pool = ProxyPool::new();
        let len = pool.replace(vec![endpoint(1), endpoint(1), endpoint(2)]);
        assert_eq!(len, 2);
        assert_eq!(pool.snapshot(), vec![endpoint(1), endpoint(2)]);
    }

    #[test]
    fn test_concurrent_readers_see_whole_generations() {
        let old: Vec<_> = (1..=20).map(endpoint).collect();
        let new: Vec<_> = (101..=120).map(endpoint).collect();
        let pool = Arc::new(ProxyPool::with_members(old.clone()));

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let (old, new) = (old.clone(), new.clone());
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        let snapshot = pool.snapshot();
                        let all_old = snapshot.iter().all(|p| old.contains(p));
                        let all_new = snapshot.iter().all(|p| new.contains(p));
                        assert!(all_old || all_new, "observed a mixed generation");
                        if let Some(picked) = pool.pick() {
                            pool.evict(&picked);
                        }
                    }
                })
            })
            .collect();

        let writer = {
            let pool = Arc::clone(&pool);
            let (old, new) = (old.clone(), new.clone());
            std::thread::spawn(move || {
                for round in 0..500 {
                    let generation = if round % 2 == 0 { new.clone() } else { old.clone() };
                    pool.replace(generation);
                }
            })
        };

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[tokio::test]
    async fn test_wait_non_empty_wakes_on_replace() {
        let pool = Arc::new(ProxyPool::new());
        let filler = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                pool.replace(vec![endpoint(1)]);
            })
        };

        assert!(pool.wait_non_empty(Duration::from_secs(5)).await);
        filler.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_non_empty_times_out() {
        let pool = ProxyPool::new();
        pool.replace(Vec::new());
        assert!(!pool.wait_non_empty(Duration::from_millis(30)).await);
    }

    #[tokio::test]
    async fn test_last_eviction_signals_drained() {
        let pool = ProxyPool::with_members(vec![endpoint(1), endpoint(2)]);

        pool.evict(&endpoint(1));
        let early = tokio::time::timeout(Duration::from_millis(20), pool.drained()).await;
        assert!(early.is_err(), "pool still has a member");

        pool.evict(&endpoint(2));
        tokio::time::timeout(Duration::from_secs(1), pool.drained())
            .await
            .expect("drain was not signalled");
    }

    #[tokio::test]
    async fn test_eviction_of_non_member_does_not_signal() {
        let pool = ProxyPool::new();
        assert!(!pool.evict(&endpoint(9)));
        let signalled = tokio::time::timeout(Duration::from_millis(20), pool.drained()).await;
        assert!(signalled.is_err());
    }
}
