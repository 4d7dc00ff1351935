/// Common wire and data types.
use crate::clock::VectorClock;
use serde::{Deserialize, Serialize};

/// Monotonic per-origin identifier for a committed event.
///
/// Versions only detect identical entries across replicas; they carry no
/// global order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// Address of the node that committed the event.
    pub origin: String,
    /// Commit sequence number at the origin.
    pub seq: u64,
}

/// A stored value with its commit clock, tombstone flag, and origin version.
///
/// `deleted == true` marks a tombstone: the entry persists (it still
/// participates in causal ordering and gossip) but reads treat the key as
/// missing and it contributes nothing to key counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: String,
    pub deleted: bool,
    /// Vector clock snapshot at commit time.
    pub clock: VectorClock,
    pub version: Version,
}

/// Cluster view: ordered member list plus replication factor.
///
/// Members are laid out as contiguous groups of `repl_factor`, producing
/// `members.len() / repl_factor` shards numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pub members: Vec<String>,
    #[serde(rename = "repl-factor")]
    pub repl_factor: usize,
}

impl View {
    pub fn new(members: Vec<String>, repl_factor: usize) -> Self {
        Self {
            members,
            repl_factor,
        }
    }

    /// Number of shards this view produces.
    pub fn shard_count(&self) -> usize {
        if self.repl_factor == 0 {
            return 0;
        }
        self.members.len() / self.repl_factor
    }

    /// Replica list of a 1-based shard id.
    pub fn replicas(&self, shard_id: usize) -> Vec<String> {
        self.members
            .iter()
            .skip((shard_id - 1) * self.repl_factor)
            .take(self.repl_factor)
            .cloned()
            .collect()
    }

    /// Replica list of the shard containing `addr`; empty when the address
    /// is not part of any shard.
    pub fn replicas_of_member(&self, addr: &str) -> Vec<String> {
        match self.members.iter().position(|m| m == addr) {
            Some(pos) if self.repl_factor > 0 && pos / self.repl_factor < self.shard_count() => {
                self.replicas(pos / self.repl_factor + 1)
            }
            _ => Vec::new(),
        }
    }
}
