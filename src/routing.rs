use std::{
    array,
    collections::HashMap,
    sync::{Arc, RwLock},
};

use chrono::Utc;
use log::info;

use crate::{error::ServerError, upstream::UpstreamEntry};

pub(crate) const ROUTE_SHARDS: usize = 256;

#[derive(Default)]
struct Shard {
    entries: RwLock<HashMap<String, Arc<UpstreamEntry>>>,
}

// Hostname -> upstream map split across independently locked shards, so
// that route installs and removals from SSH sessions don't serialize the
// HTTP hot path.
pub(crate) struct RoutingTable {
    shards: [Shard; ROUTE_SHARDS],
    log_routes: bool,
}

// FNV-like multiply-xor over the hostname bytes; the low bits pick the
// shard. Stable across runs, so a host always lands in the same shard.
pub(crate) fn shard_index(host: &str) -> usize {
    let mut hash: u32 = 0;
    for &byte in host.as_bytes() {
        hash = hash.wrapping_mul(16_777_619) ^ u32::from(byte);
    }
    hash as usize % ROUTE_SHARDS
}

impl RoutingTable {
    pub(crate) fn new(log_routes: bool) -> Self {
        RoutingTable {
            shards: array::from_fn(|_| Shard::default()),
            log_routes,
        }
    }

    // Register host -> target, replacing any existing entry. The replaced
    // entry's connection pool drains as outstanding requests finish.
    pub(crate) fn install(&self, host: &str, target: &str) -> Result<(), ServerError> {
        let entry = Arc::new(UpstreamEntry::new(target, self.log_routes)?);
        if self.log_routes {
            info!("route add: {} -> {}", host, entry.target());
        }
        let shard = &self.shards[shard_index(host)];
        shard
            .entries
            .write()
            .expect("not poisoned")
            .insert(host.to_owned(), entry);
        Ok(())
    }

    pub(crate) fn remove(&self, host: &str) {
        let shard = &self.shards[shard_index(host)];
        let removed = shard.entries.write().expect("not poisoned").remove(host);
        if let Some(entry) = removed {
            if self.log_routes {
                let lifetime = Utc::now().signed_duration_since(entry.created_at());
                info!("route remove: {} (live for {}s)", host, lifetime.num_seconds());
            }
        }
    }

    // Hot path for request forwarding. Cloning the entry's Arc is the only
    // work done under the shard's read lock.
    pub(crate) fn lookup(&self, host: &str) -> Option<Arc<UpstreamEntry>> {
        let shard = &self.shards[shard_index(host)];
        let entries = shard.entries.read().expect("not poisoned");
        entries.get(host).cloned()
    }

    // Walk every shard under its own read lock. Entries added or removed
    // mid-walk may be included or missed; callers get per-shard consistency
    // only.
    pub(crate) fn snapshot(&self) -> Vec<(String, String)> {
        let mut routes = Vec::new();
        for shard in &self.shards {
            let entries = shard.entries.read().expect("not poisoned");
            routes.extend(
                entries
                    .iter()
                    .map(|(host, entry)| (host.clone(), entry.target().to_string())),
            );
        }
        routes
    }

    #[cfg(test)]
    fn shard_len(&self, index: usize) -> usize {
        self.shards[index].entries.read().unwrap().len()
    }
}
