/// Background replication of committed entries.
///
/// The gossip engine consumes the store's journal and pushes every
/// client-origin commit to each co-replica of this node's shard. Delivery
/// is at-least-once: transport failures and non-2xx answers retry forever
/// with exponential backoff, bounded only by process shutdown. Ordering
/// across entries is not needed (the receiving store's admission predicate
/// copes with out-of-order delivery), but per key a retry always re-sends
/// the latest journaled entry, never an older one.
///
/// When a peer acknowledges with `imported = true`, the sender's clock for
/// that peer is bumped; that is the only way `vc[peer]` grows here. An
/// `imported = false` answer means the peer converged via another path and
/// delivery stops.
use crate::error::{KvError, KvResult};
use crate::partition::PartitionTable;
use crate::store::Store;
use crate::types::Entry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

const RETRY_BASE: Duration = Duration::from_millis(10);
const RETRY_MAX: Duration = Duration::from_secs(1);
const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Wire acknowledgment for `PUT /kv-store/gossip`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GossipAck {
    pub imported: bool,
}

/// Handle to the running gossip engine.
///
/// Dropping the handle does not stop the engine; call [`Gossiper::shutdown`]
/// to cancel the dispatch loop and every in-flight retry.
#[derive(Debug)]
pub struct Gossiper {
    shutdown: broadcast::Sender<()>,
}

impl Gossiper {
    /// Start the dispatch loop over the store's journal.
    pub fn spawn(
        store: Arc<Store>,
        partition: Arc<PartitionTable>,
        client: reqwest::Client,
        origin: String,
        journal: mpsc::UnboundedReceiver<Entry>,
    ) -> Gossiper {
        let (shutdown, _) = broadcast::channel(1);
        let engine = Engine {
            store,
            partition,
            client,
            origin,
            latest: Arc::new(Mutex::new(HashMap::new())),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(engine.dispatch(journal));
        Gossiper { shutdown }
    }

    /// Cancel the dispatch loop and all outstanding retries.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

#[derive(Clone)]
struct Engine {
    store: Arc<Store>,
    partition: Arc<PartitionTable>,
    client: reqwest::Client,
    origin: String,
    /// Latest journaled entry per key, consulted on retry.
    latest: Arc<Mutex<HashMap<String, Entry>>>,
    shutdown: broadcast::Sender<()>,
}

impl Engine {
    async fn dispatch(self, mut journal: mpsc::UnboundedReceiver<Entry>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                entry = journal.recv() => {
                    let Some(entry) = entry else { break };
                    self.latest
                        .lock()
                        .expect("latest-entry map lock poisoned")
                        .insert(entry.key.clone(), entry.clone());

                    // Peer list is re-read per entry so a view change takes
                    // effect on the next dispatch.
                    let shard = self.partition.shard_of_member(&self.origin);
                    for peer in self.partition.replicas(shard) {
                        if peer == self.origin {
                            continue;
                        }
                        let engine = self.clone();
                        let entry = entry.clone();
                        tokio::spawn(async move { engine.deliver(entry, peer).await });
                    }
                }
            }
        }
        info!("gossip dispatch stopped");
    }

    /// Deliver one journal event to one peer, retrying until it is
    /// acknowledged or the engine shuts down.
    async fn deliver(self, entry: Entry, peer: String) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut backoff = RETRY_BASE;
        let mut current = entry;

        loop {
            match self.send(&current, &peer).await {
                Ok(ack) => {
                    if ack.imported {
                        self.store.bump_clock_for_node(&peer).await;
                    } else {
                        debug!(key = %current.key, peer = %peer, "peer declined gossip entry");
                    }
                    return;
                }
                Err(err) => {
                    warn!(key = %current.key, peer = %peer, %err, "gossip send failed, retrying");
                }
            }

            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RETRY_MAX);

            // Never re-send an entry older than what the journal has seen
            // for this key since.
            let newest = self
                .latest
                .lock()
                .expect("latest-entry map lock poisoned")
                .get(&current.key)
                .cloned();
            if let Some(newest) = newest {
                current = newest;
            }
        }
    }

    async fn send(&self, entry: &Entry, peer: &str) -> KvResult<GossipAck> {
        let url = format!("http://{peer}/kv-store/gossip");
        let response = self
            .client
            .put(&url)
            .timeout(SEND_TIMEOUT)
            .json(entry)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(KvError::PeerStatus {
                endpoint: url,
                status: response.status().as_u16(),
            });
        }
        Ok(response.json().await?)
    }
}
