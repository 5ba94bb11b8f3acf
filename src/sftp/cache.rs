//! Short-lived directory listing cache
//!
//! Entries expire after the configured TTL and are dropped by any mutation
//! that touches the directory. A zero TTL disables caching.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::trace;

use super::path::RemotePath;
use super::types::RemoteEntry;
use crate::config::ConnectionId;

struct CachedListing {
    entries: Vec<RemoteEntry>,
    fetched_at: Instant,
}

pub struct ListingCache {
    ttl: Duration,
    listings: DashMap<(ConnectionId, RemotePath), CachedListing>,
}

impl ListingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            listings: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    pub fn get(&self, connection: ConnectionId, dir: &RemotePath) -> Option<Vec<RemoteEntry>> {
        if !self.is_enabled() {
            return None;
        }
        let key = (connection, dir.clone());
        let fresh = {
            let cached = self.listings.get(&key)?;
            (cached.fetched_at.elapsed() < self.ttl).then(|| cached.entries.clone())
        };
        if fresh.is_none() {
            self.listings.remove(&key);
        } else {
            trace!("Listing cache hit for {}", dir);
        }
        fresh
    }

    pub fn put(&self, connection: ConnectionId, dir: &RemotePath, entries: &[RemoteEntry]) {
        if !self.is_enabled() {
            return;
        }
        self.listings.insert(
            (connection, dir.clone()),
            CachedListing {
                entries: entries.to_vec(),
                fetched_at: Instant::now(),
            },
        );
    }

    /// Drop the listing of `path` itself, its parent and everything beneath it
    pub fn invalidate(&self, connection: ConnectionId, path: &RemotePath) {
        let parent = path.parent();
        self.listings.retain(|(conn, dir), _| {
            *conn != connection || !(dir == &parent || dir.starts_with(path))
        });
    }

    pub fn invalidate_connection(&self, connection: ConnectionId) {
        self.listings.retain(|(conn, _), _| *conn != connection);
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }
}
