//! Consistent-hash ring mapping symbols onto workers.
//!
//! Each worker contributes a fixed number of virtual nodes; routing walks
//! clockwise from the key's hash to the next virtual node. Worker ids are
//! stable across crashes, so membership (and therefore routing) only changes
//! when workers are added or removed; a respawn disturbs nothing.

use std::collections::{BTreeMap, BTreeSet};

/// Virtual nodes per worker. 100-200 keeps the key distribution even for
/// small pools without bloating the ring.
pub const DEFAULT_VNODES_PER_WORKER: usize = 160;

/// FNV-1a, 64-bit. Deterministic across processes and runs, unlike the
/// std hasher.
#[inline]
pub fn fnv1a64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[derive(Debug, Clone)]
pub struct ConsistentHashRing {
    vnodes_per_worker: usize,
    ring: BTreeMap<u64, usize>,
    members: BTreeSet<usize>,
}

impl ConsistentHashRing {
    pub fn new(vnodes_per_worker: usize) -> Self {
        Self {
            vnodes_per_worker: vnodes_per_worker.max(1),
            ring: BTreeMap::new(),
            members: BTreeSet::new(),
        }
    }

    pub fn add_worker(&mut self, worker_id: usize) {
        if !self.members.insert(worker_id) {
            return;
        }
        for vnode in 0..self.vnodes_per_worker {
            let point = fnv1a64(format!("worker-{worker_id}:vnode-{vnode}").as_bytes());
            self.ring.insert(point, worker_id);
        }
    }

    pub fn remove_worker(&mut self, worker_id: usize) {
        if !self.members.remove(&worker_id) {
            return;
        }
        self.ring.retain(|_, id| *id != worker_id);
    }

    /// Deterministic worker for a key, given the current membership.
    pub fn route(&self, key: &str) -> Option<usize> {
        if self.ring.is_empty() {
            return None;
        }
        let point = fnv1a64(key.as_bytes());
        self.ring
            .range(point..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, id)| *id)
    }

    pub fn members(&self) -> Vec<usize> {
        self.members.iter().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
