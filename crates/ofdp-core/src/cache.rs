//! Per-worker flow cache: fingerprint → last-matched flow reference.
//!
//! Invalidation is generation-based. Mutating the flow database bumps the
//! bridge generation, so a cached reference from an older generation is
//! simply ignored on lookup; nothing walks the caches, and workers need no
//! cross-thread synchronization to stay coherent.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::flow::FlowEntry;

/// Cache backend selection (`--kvstype`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KvsType {
    /// Plain per-worker map, no locking. Default.
    #[default]
    HashmapNolock,
    /// RwLock-wrapped map, shareable across lookup threads.
    Hashmap,
    /// Hardware-accelerated table; degrades to `HashmapNolock` when the
    /// high-speed driver is absent.
    RteHash,
}

impl KvsType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hashmap_nolock" => Some(KvsType::HashmapNolock),
            "hashmap" => Some(KvsType::Hashmap),
            "rte_hash" => Some(KvsType::RteHash),
            _ => None,
        }
    }
}

impl std::fmt::Display for KvsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KvsType::HashmapNolock => write!(f, "hashmap_nolock"),
            KvsType::Hashmap => write!(f, "hashmap"),
            KvsType::RteHash => write!(f, "rte_hash"),
        }
    }
}

/// Entries kept before the cache is wiped and refilled.
const CACHE_MAX_ENTRIES: usize = 65_536;

#[derive(Clone)]
struct CacheEntry {
    flow: Arc<FlowEntry>,
    generation: u64,
}

enum Backend {
    Nolock(HashMap<u64, CacheEntry>),
    Locked(RwLock<HashMap<u64, CacheEntry>>),
}

/// One worker's flow cache.
pub struct FlowCache {
    backend: Backend,
    hits: u64,
    misses: u64,
}

impl FlowCache {
    pub fn new(kvs: KvsType) -> FlowCache {
        let backend = match kvs {
            // rte_hash degradation is decided (and logged) at config
            // resolution; by here it is a plain map.
            KvsType::HashmapNolock | KvsType::RteHash => Backend::Nolock(HashMap::new()),
            KvsType::Hashmap => Backend::Locked(RwLock::new(HashMap::new())),
        };
        FlowCache { backend, hits: 0, misses: 0 }
    }

    /// Look up a fingerprint. A hit from an older generation counts as a
    /// miss; the entry is left in place for the insert that follows.
    pub fn lookup(&mut self, fingerprint: u64, generation: u64) -> Option<Arc<FlowEntry>> {
        let entry = match &self.backend {
            Backend::Nolock(map) => map.get(&fingerprint).cloned(),
            Backend::Locked(map) => map.read().get(&fingerprint).cloned(),
        };
        match entry {
            Some(e) if e.generation == generation => {
                self.hits += 1;
                Some(e.flow)
            }
            _ => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, fingerprint: u64, flow: Arc<FlowEntry>, generation: u64) {
        let entry = CacheEntry { flow, generation };
        match &mut self.backend {
            Backend::Nolock(map) => {
                if map.len() >= CACHE_MAX_ENTRIES {
                    map.clear();
                }
                map.insert(fingerprint, entry);
            }
            Backend::Locked(map) => {
                let mut map = map.write();
                if map.len() >= CACHE_MAX_ENTRIES {
                    map.clear();
                }
                map.insert(fingerprint, entry);
            }
        }
    }

    pub fn clear(&mut self) {
        match &mut self.backend {
            Backend::Nolock(map) => map.clear(),
            Backend::Locked(map) => map.write().clear(),
        }
    }

    pub fn len(&self) -> usize {
        match &self.backend {
            Backend::Nolock(map) => map.len(),
            Backend::Locked(map) => map.read().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses) since creation.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}
