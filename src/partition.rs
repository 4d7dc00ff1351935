/// Key placement and cluster membership.
///
/// The partition table maps keys onto shards and shards onto replica sets,
/// all derived from the current view. Placement is FNV-1a over the key
/// bytes and must stay bit-exact: a reconfiguration only moves the keys
/// whose shard assignment actually changed.
///
/// The table is read on every request and written only by view changes, so
/// it sits behind its own `RwLock`, separate from the store's scheduler
/// lock. The lock is never held across an await point.
use crate::types::View;
use rand::Rng;
use std::collections::HashSet;
use std::sync::RwLock;

/// FNV-1a 32-bit hash of a byte string.
///
/// Offset basis 0x811c9dc5, prime 0x01000193. This is the canonical
/// placement function for both the shard of a key and the primary replica
/// within the shard.
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    bytes
        .iter()
        .fold(OFFSET_BASIS, |hash, byte| (hash ^ u32::from(*byte)).wrapping_mul(PRIME))
}

/// 1-based shard index of a key in a layout of `shard_count` shards.
pub(crate) fn shard_index(key: &str, shard_count: usize) -> usize {
    (fnv1a_32(key.as_bytes()) as usize % shard_count) + 1
}

/// The node's view of key placement: member list, replication factor, and
/// the derived shard layout.
#[derive(Debug)]
pub struct PartitionTable {
    inner: RwLock<View>,
}

impl PartitionTable {
    pub fn new(view: View) -> Self {
        Self {
            inner: RwLock::new(view),
        }
    }

    /// Atomically install a new view.
    ///
    /// Returns true iff the membership changed set-wise or the replication
    /// factor changed; an identical view (even with members in a different
    /// order) is left in place and reported as unchanged. This is the
    /// duplicate-suppression primitive for view changes.
    pub fn test_and_set(&self, view: &View) -> bool {
        let mut inner = self.inner.write().expect("partition table lock poisoned");

        let old: HashSet<&String> = inner.members.iter().collect();
        let new: HashSet<&String> = view.members.iter().collect();
        if old == new && inner.repl_factor == view.repl_factor {
            return false;
        }

        *inner = view.clone();
        true
    }

    /// Snapshot of the current view.
    pub fn view(&self) -> View {
        self.inner.read().expect("partition table lock poisoned").clone()
    }

    pub fn replication_factor(&self) -> usize {
        self.inner.read().expect("partition table lock poisoned").repl_factor
    }

    pub fn members(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("partition table lock poisoned")
            .members
            .clone()
    }

    /// Number of shards in the current view.
    pub fn shard_count(&self) -> usize {
        self.inner
            .read()
            .expect("partition table lock poisoned")
            .shard_count()
    }

    /// 1-based shard id owning a key.
    pub fn shard_of(&self, key: &str) -> usize {
        shard_index(key, self.shard_count().max(1))
    }

    /// Replica list of a 1-based shard id.
    pub fn replicas(&self, shard_id: usize) -> Vec<String> {
        let inner = self.inner.read().expect("partition table lock poisoned");
        let r = inner.repl_factor;
        let start = (shard_id - 1) * r;
        inner
            .members
            .iter()
            .skip(start)
            .take(r)
            .cloned()
            .collect()
    }

    /// The writing replica for a key: index `fnv1a_32(key) % R` within the
    /// owning shard.
    pub fn primary_for(&self, key: &str) -> Option<String> {
        let replicas = self.replicas(self.shard_of(key));
        if replicas.is_empty() {
            return None;
        }
        let idx = fnv1a_32(key.as_bytes()) as usize % replicas.len();
        Some(replicas[idx].clone())
    }

    /// Any replica of the owning shard, chosen uniformly (read routing).
    pub fn any_for(&self, key: &str) -> Option<String> {
        let replicas = self.replicas(self.shard_of(key));
        if replicas.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..replicas.len());
        Some(replicas[idx].clone())
    }

    /// 1-based shard id containing a member, or `shard_count() + 1` when
    /// the address is not in the view (or sits in a trailing group smaller
    /// than the replication factor).
    pub fn shard_of_member(&self, addr: &str) -> usize {
        let inner = self.inner.read().expect("partition table lock poisoned");
        let shards = inner.shard_count();
        match inner.members.iter().position(|m| m == addr) {
            Some(pos) if inner.repl_factor > 0 && pos / inner.repl_factor < shards => {
                pos / inner.repl_factor + 1
            }
            _ => shards + 1,
        }
    }

    /// Replica lists of every shard, in shard order.
    pub fn members_by_shard(&self) -> Vec<Vec<String>> {
        let inner = self.inner.read().expect("partition table lock poisoned");
        let shards = inner.shard_count();
        (0..shards)
            .map(|s| {
                inner
                    .members
                    .iter()
                    .skip(s * inner.repl_factor)
                    .take(inner.repl_factor)
                    .cloned()
                    .collect()
            })
            .collect()
    }

    /// True iff this address is a replica of some shard in the view.
    pub fn contains(&self, addr: &str) -> bool {
        self.shard_of_member(addr) <= self.shard_count()
    }
}
