/// One cluster node as a single owned value.
///
/// A `Node` is constructed once at startup and owns its store, partition
/// table, gossip engine, and HTTP client; there are no globals. Identity
/// and view are only mutated by view changes; everything else is
/// per-request state.
use crate::error::{KvError, KvResult};
use crate::gossip::Gossiper;
use crate::partition::PartitionTable;
use crate::store::Store;
use crate::types::View;
use std::sync::Arc;
use tracing::info;

#[derive(Debug)]
pub struct Node {
    address: String,
    pub(crate) store: Arc<Store>,
    pub(crate) partition: Arc<PartitionTable>,
    pub(crate) client: reqwest::Client,
    gossip: Gossiper,
}

impl Node {
    /// Build a node from its own address and the initial view.
    ///
    /// Spawns the gossip engine, so this must run inside a tokio runtime.
    pub fn new(address: String, view: View) -> KvResult<Arc<Node>> {
        if view.members.is_empty() {
            return Err(KvError::Config("view has no members".to_string()));
        }
        if view.repl_factor == 0 || view.members.len() < view.repl_factor {
            return Err(KvError::Config(format!(
                "replication factor {} needs at least that many members, have {}",
                view.repl_factor,
                view.members.len()
            )));
        }

        let partition = Arc::new(PartitionTable::new(view));
        let replicas = shard_replicas_of(&partition, &address);
        let (store, journal) = Store::new(address.clone(), replicas);
        let client = reqwest::Client::new();
        let gossip = Gossiper::spawn(
            store.clone(),
            partition.clone(),
            client.clone(),
            address.clone(),
            journal,
        );

        info!(%address, "node initialized");
        Ok(Arc::new(Node {
            address,
            store,
            partition,
            client,
            gossip,
        }))
    }

    /// This node's stable address, as listed in views.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Install a view if it differs from the current one.
    ///
    /// Returns whether anything rotated. On rotation the store's replica
    /// set is refreshed, which re-evaluates every blocked operation.
    pub async fn apply_view(&self, view: &View) -> bool {
        let changed = self.partition.test_and_set(view);
        if changed {
            let replicas = shard_replicas_of(&self.partition, &self.address);
            self.store.set_replicas(replicas).await;
            info!(members = ?view.members, repl_factor = view.repl_factor, "installed new view");
        }
        changed
    }

    /// True iff this node is a replica of the shard owning `key`.
    pub fn owns(&self, key: &str) -> bool {
        self.partition
            .replicas(self.partition.shard_of(key))
            .iter()
            .any(|r| r == &self.address)
    }

    /// Stop the gossip engine and its in-flight retries.
    pub fn shutdown(&self) {
        self.gossip.shutdown();
    }
}

/// Replica set of the shard containing `addr`, or just `addr` itself when
/// the node is not part of the view (its state is about to be replaced
/// anyway, and a one-member projection keeps admission well-defined).
fn shard_replicas_of(partition: &PartitionTable, addr: &str) -> Vec<String> {
    let shard = partition.shard_of_member(addr);
    if shard <= partition.shard_count() {
        partition.replicas(shard)
    } else {
        vec![addr.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(members: &[&str], r: usize) -> View {
        View::new(members.iter().map(|m| m.to_string()).collect(), r)
    }

    #[tokio::test]
    async fn test_rejects_degenerate_views() {
        assert!(matches!(
            Node::new("a".into(), view(&[], 1)),
            Err(KvError::Config(_))
        ));
        assert!(matches!(
            Node::new("a".into(), view(&["a"], 0)),
            Err(KvError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_ownership_follows_view() {
        let node = Node::new("a".into(), view(&["a", "b", "c", "d"], 2)).unwrap();
        // "k" hashes to shard 1 = {a, b}; "x" to shard 2 = {c, d}.
        assert!(node.owns("k"));
        assert!(!node.owns("x"));

        // Shrinking to one shard makes every key local.
        assert!(node.apply_view(&view(&["a", "b"], 2)).await);
        assert!(node.owns("x"));

        // Re-applying the same view is acknowledged but changes nothing.
        assert!(!node.apply_view(&view(&["b", "a"], 2)).await);
        node.shutdown();
    }
}
