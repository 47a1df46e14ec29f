//! TTL cache for discovered routes
//!
//! Read-mostly: lookups take a shard read lock; writes go through the shard
//! write lock for the `(source, destination)` key. Readers may observe an
//! entry up to `ttl` old; stale entries trigger rediscovery in the router.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use super::domain_types::Route;
use crate::domain_types::AgentId;
use crate::time_provider::TimeProvider;

struct CachedRoutes {
    routes: Vec<Route>,
    cached_at: SystemTime,
}

/// Per `(source, destination)` route cache with TTL
pub struct RouteCache {
    entries: DashMap<(AgentId, AgentId), CachedRoutes>,
    ttl: Duration,
    time: Arc<dyn TimeProvider>,
}

impl std::fmt::Debug for RouteCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteCache")
            .field("entries", &self.entries.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl RouteCache {
    /// Creates a cache with the given TTL
    #[must_use]
    pub fn new(ttl: Duration, time: Arc<dyn TimeProvider>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            time,
        }
    }

    /// Returns cached routes if the entry is within TTL
    #[must_use]
    pub fn get(&self, source: &AgentId, destination: &AgentId) -> Option<Vec<Route>> {
        let key = (source.clone(), destination.clone());
        let entry = self.entries.get(&key)?;
        let age = self.time.now().duration_since(entry.cached_at).ok()?;
        if age > self.ttl {
            return None;
        }
        Some(entry.routes.clone())
    }

    /// Replaces the cached routes for a tuple
    pub fn put(&self, source: AgentId, destination: AgentId, routes: Vec<Route>) {
        self.entries.insert(
            (source, destination),
            CachedRoutes {
                routes,
                cached_at: self.time.now(),
            },
        );
    }

    /// Drops the entry for a tuple, forcing rediscovery
    pub fn invalidate(&self, source: &AgentId, destination: &AgentId) {
        self.entries.remove(&(source.clone(), destination.clone()));
    }

    /// Removes every entry older than TTL; returns how many were evicted
    pub fn evict_stale(&self) -> usize {
        let now = self.time.now();
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            now.duration_since(entry.cached_at)
                .map(|age| age <= ttl)
                .unwrap_or(false)
        });
        before - self.entries.len()
    }

    /// Flattened copy of every cached route, for snapshot persistence
    #[must_use]
    pub fn snapshot(&self) -> Vec<Route> {
        self.entries
            .iter()
            .flat_map(|entry| entry.value().routes.clone())
            .collect()
    }

    /// Number of cached tuples
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
