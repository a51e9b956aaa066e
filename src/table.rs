//! In-memory service table and local service set.
//!
//! The table maps service names to the edge sites known to run them. It is
//! read on every request and mutated only in bulk: the push endpoint swaps
//! whole entries (or the whole table) under a write lock, so readers observe
//! either the full pre-state or the full post-state of a replacement.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use crate::geo::Point;
use crate::metrics;

/// One edge site known to run a service. Identified by IP for set membership.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Site {
    /// Public IP of the edge site.
    pub ip: IpAddr,
    /// Geographic point of the edge site.
    pub coords: Point,
}

/// Plain-map form of the table, as exchanged with the push endpoint.
pub type SiteMap = HashMap<String, Vec<Site>>;

/// Thread-safe mapping from service name to the set of sites running it.
///
/// Service names are normalized on every operation: lower-cased, trailing
/// dot stripped. Within an entry each site appears at most once, keyed by IP.
#[derive(Debug, Clone, Default)]
pub struct ServiceTable {
    inner: Arc<RwLock<HashMap<String, HashMap<IpAddr, Site>>>>,
}

impl ServiceTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the sites for a service. Absent keys yield an empty vec and
    /// `false`.
    pub fn lookup(&self, name: &str) -> (Vec<Site>, bool) {
        let key = normalize(name);
        let inner = self.inner.read();
        match inner.get(&key) {
            Some(sites) => (sites.values().copied().collect(), true),
            None => (Vec::new(), false),
        }
    }

    /// Atomically replace the entry for one service. An empty site list
    /// deletes the key.
    pub fn replace(&self, name: &str, sites: Vec<Site>) {
        let key = normalize(name);
        let mut inner = self.inner.write();
        if sites.is_empty() {
            if inner.remove(&key).is_some() {
                debug!(service = %key, "removed service entry");
            }
        } else {
            let entry = dedup_by_ip(sites);
            debug!(service = %key, sites = entry.len(), "replaced service entry");
            inner.insert(key, entry);
        }
    }

    /// Atomically replace the entire table.
    pub fn bulk_replace(&self, map: SiteMap) {
        let next: HashMap<String, HashMap<IpAddr, Site>> = map
            .into_iter()
            .filter(|(_, sites)| !sites.is_empty())
            .map(|(name, sites)| (normalize(&name), dedup_by_ip(sites)))
            .collect();
        let services = next.len();
        *self.inner.write() = next;
        debug!(services, "replaced service table");
    }

    /// A consistent read-only copy of the table.
    pub fn snapshot(&self) -> SiteMap {
        let inner = self.inner.read();
        inner
            .iter()
            .map(|(name, sites)| (name.clone(), sites.values().copied().collect()))
            .collect()
    }

    /// Number of services in the table.
    pub fn services_count(&self) -> usize {
        self.inner.read().len()
    }

    /// Total number of site entries across all services.
    pub fn sites_count(&self) -> usize {
        self.inner.read().values().map(|s| s.len()).sum()
    }

    /// Emit current table gauges.
    pub fn emit_metrics(&self) {
        let inner = self.inner.read();
        let sites = inner.values().map(|s| s.len()).sum();
        metrics::record_table_counts(inner.len(), sites);
    }
}

/// The set of service names running at this cluster, fed by the external
/// watcher. Membership tests are O(1) and safe under concurrent reads.
#[derive(Debug, Clone, Default)]
pub struct LocalServices {
    inner: Arc<RwLock<HashSet<String>>>,
}

impl LocalServices {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service name.
    pub fn add(&self, name: &str) {
        self.inner.write().insert(normalize(name));
    }

    /// Remove a service name.
    pub fn remove(&self, name: &str) {
        self.inner.write().remove(&normalize(name));
    }

    /// Replace the whole set.
    pub fn replace(&self, names: impl IntoIterator<Item = String>) {
        let next: HashSet<String> = names.into_iter().map(|n| normalize(&n)).collect();
        *self.inner.write() = next;
    }

    /// Membership test.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().contains(&normalize(name))
    }

    /// Number of local services.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// True when no services are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

fn dedup_by_ip(sites: Vec<Site>) -> HashMap<IpAddr, Site> {
    sites.into_iter().map(|s| (s.ip, s)).collect()
}
