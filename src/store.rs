/// The replicated store and its causal scheduler.
///
/// All state lives behind a single mutex; every operation acquires it and
/// may then wait until the caller's causal context is satisfied. Waiting is
/// a broadcast-on-mutation pattern: each mutation notifies all waiters and
/// each waiter re-checks its admission predicate. This is the condition
/// variable of the design rendered with `tokio::sync::Notify`.
///
/// Admission projects clocks onto the shard's replica set, so contexts
/// carrying events from other shards never block operations here.
///
/// Waits are unbounded by design; callers that need a deadline (the HTTP
/// edge, the view-change collect) wrap operations in `tokio::time::timeout`.
/// Dropping the future mid-wait is safe.
use crate::clock::VectorClock;
use crate::types::{Entry, Version};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::debug;

/// In-memory replicated store for one node.
///
/// Client-origin commits are pushed into the journal; the gossip engine
/// consumes it and propagates each entry to the co-replicas of this shard.
#[derive(Debug)]
pub struct Store {
    inner: Mutex<Inner>,
    /// Broadcast on every mutation so waiters re-check their predicates.
    changed: Notify,
    journal: mpsc::UnboundedSender<Entry>,
}

#[derive(Debug)]
struct Inner {
    /// This node's stable address; also the origin stamped on versions.
    origin: String,
    /// Current replica set of this node's shard (self included).
    replicas: Vec<String>,
    data: HashMap<String, Entry>,
    vc: VectorClock,
    /// Commit sequence for versions minted here.
    seq: u64,
}

impl Inner {
    /// Client admission: the context, projected onto this shard, must not
    /// be ahead of the local clock.
    fn admits_client(&self, ctx: &VectorClock) -> bool {
        let wanted = ctx.project(&self.replicas);
        let local = self.vc.project(&self.replicas);
        wanted.compare(&local) != Some(Ordering::Greater)
    }

    /// Commit a client-origin event and hand it to the journal.
    fn commit(&mut self, key: &str, value: String, deleted: bool) -> Entry {
        self.seq += 1;
        let origin = self.origin.clone();
        self.vc.increment(&origin);
        let entry = Entry {
            key: key.to_string(),
            value,
            deleted,
            clock: self.vc.clone(),
            version: Version {
                origin,
                seq: self.seq,
            },
        };
        self.data.insert(key.to_string(), entry.clone());
        entry
    }

    fn live(&self, key: &str) -> Option<&Entry> {
        self.data.get(key).filter(|e| !e.deleted)
    }

    /// The context to hand back for an operation that commits no event.
    ///
    /// Admission only covers this shard's projection of `ctx`, so the local
    /// clock alone may lack dependencies the caller carried from other
    /// shards. Folding `ctx` back in keeps a client's context monotonic
    /// across shards; the committing paths get the same effect by merging
    /// `ctx` into the clock itself.
    fn refreshed_context(&self, ctx: &VectorClock) -> VectorClock {
        let mut snapshot = self.vc.clone();
        snapshot.merge(ctx);
        snapshot
    }
}

/// Outcome of a gossip import attempt, before it collapses to the wire's
/// single `imported` boolean.
enum Import {
    Applied,
    Duplicate,
    Rejected,
}

impl Store {
    /// Create a store for `origin` replicating with `replicas`.
    ///
    /// Returns the store and the receiving end of its journal, which the
    /// gossip engine consumes.
    pub fn new(origin: String, replicas: Vec<String>) -> (Arc<Store>, mpsc::UnboundedReceiver<Entry>) {
        let (journal, journal_rx) = mpsc::unbounded_channel();
        let store = Arc::new(Store {
            inner: Mutex::new(Inner {
                origin,
                replicas,
                data: HashMap::new(),
                vc: VectorClock::new(),
                seq: 0,
            }),
            changed: Notify::new(),
            journal,
        });
        (store, journal_rx)
    }

    /// Run `attempt` under the lock, retrying on every store mutation until
    /// it produces a value.
    ///
    /// The notified future is armed before the predicate check, so a
    /// mutation between dropping the lock and awaiting cannot be missed.
    async fn admitted<T>(&self, mut attempt: impl FnMut(&mut Inner) -> Option<T>) -> T {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().await;
                if let Some(out) = attempt(&mut inner) {
                    return out;
                }
            }
            notified.await;
        }
    }

    /// Commit a write whose dependency clock is `ctx`.
    ///
    /// Returns whether a live entry was replaced, and a snapshot of the
    /// clock after the commit (the refreshed causal context).
    pub async fn write(&self, ctx: &VectorClock, key: &str, value: &str) -> (bool, VectorClock) {
        let result = self
            .admitted(|inner| {
                if !inner.admits_client(ctx) {
                    return None;
                }
                inner.vc.merge(ctx);
                let replaced = inner.live(key).is_some();
                let entry = inner.commit(key, value.to_string(), false);
                let snapshot = inner.vc.clone();
                let _ = self.journal.send(entry);
                Some((replaced, snapshot))
            })
            .await;
        self.changed.notify_waiters();
        debug!(key, replaced = result.0, "committed write");
        result
    }

    /// Tombstone a key.
    ///
    /// A delete only commits a new event when a live entry exists; deleting
    /// a tombstone or a missing key is a no-op, so delete storms cannot
    /// grow the clock.
    pub async fn delete(&self, ctx: &VectorClock, key: &str) -> (bool, VectorClock) {
        let (existed, snapshot, mutated) = self
            .admitted(|inner| {
                if !inner.admits_client(ctx) {
                    return None;
                }
                if inner.live(key).is_none() {
                    return Some((false, inner.refreshed_context(ctx), false));
                }
                inner.vc.merge(ctx);
                let entry = inner.commit(key, String::new(), true);
                let snapshot = inner.vc.clone();
                let _ = self.journal.send(entry);
                Some((true, snapshot, true))
            })
            .await;
        if mutated {
            self.changed.notify_waiters();
            debug!(key, "committed delete");
        }
        (existed, snapshot)
    }

    /// Read a key. Missing keys and tombstones both read as absent.
    pub async fn read(&self, ctx: &VectorClock, key: &str) -> (Option<Entry>, VectorClock) {
        self.admitted(|inner| {
            if !inner.admits_client(ctx) {
                return None;
            }
            Some((inner.live(key).cloned(), inner.refreshed_context(ctx)))
        })
        .await
    }

    /// Count of live (non-tombstoned) keys.
    pub async fn num_keys(&self, ctx: &VectorClock) -> (usize, VectorClock) {
        self.admitted(|inner| {
            if !inner.admits_client(ctx) {
                return None;
            }
            let count = inner.data.values().filter(|e| !e.deleted).count();
            Some((count, inner.refreshed_context(ctx)))
        })
        .await
    }

    /// Block until the given context is satisfied on this shard.
    pub async fn wait_until_current(&self, ctx: &VectorClock) {
        self.admitted(|inner| inner.admits_client(ctx).then_some(())).await;
    }

    /// Block until every event `ctx` records for `nodes` has been applied,
    /// regardless of the store's current replica set.
    ///
    /// The view-change collect waits on the *old* shard's members with
    /// this; the coordinator's own table may already have rotated, which
    /// would otherwise project the old co-replicas out of the predicate.
    pub async fn wait_until_current_on(&self, ctx: &VectorClock, nodes: &[String]) {
        let wanted = ctx.project(nodes);
        self.admitted(|inner| {
            let local = inner.vc.project(nodes);
            (wanted.compare(&local) != Some(Ordering::Greater)).then_some(())
        })
        .await;
    }

    /// Apply a gossiped entry from a co-replica.
    ///
    /// Idempotent: an entry whose version is already present reports
    /// `true` without mutating. Stale entries (clock strictly behind the
    /// shard clock while a non-older local entry exists) report `false`;
    /// the sender stops retrying. Anything not yet applicable waits for
    /// the events it depends on.
    pub async fn import_entry(&self, entry: &Entry) -> bool {
        let outcome = self
            .admitted(|inner| {
                if let Some(current) = inner.data.get(&entry.key) {
                    if current.version == entry.version {
                        return Some(Import::Duplicate);
                    }
                }

                let local = inner.vc.project(&inner.replicas);
                let incoming = entry.clock.project(&inner.replicas);
                match incoming.compare(&local) {
                    Some(Ordering::Less) => {
                        if let Some(current) = inner.data.get(&entry.key) {
                            let ours = current.clock.project(&inner.replicas);
                            if ours.compare(&incoming) != Some(Ordering::Less) {
                                return Some(Import::Rejected);
                            }
                        }
                    }
                    Some(Ordering::Equal) => {}
                    _ => {
                        // Not yet covered by the local clock: only the next
                        // event of exactly one peer may apply immediately.
                        incoming.one_up_except(&inner.origin, &local)?;
                    }
                }

                inner.vc.merge(&entry.clock);
                inner.data.insert(entry.key.clone(), entry.clone());
                Some(Import::Applied)
            })
            .await;

        match outcome {
            Import::Applied => {
                self.changed.notify_waiters();
                debug!(key = %entry.key, origin = %entry.version.origin, "imported gossip entry");
                true
            }
            Import::Duplicate => true,
            Import::Rejected => {
                debug!(key = %entry.key, "rejected stale gossip entry");
                false
            }
        }
    }

    /// Record that `node` acknowledged applying one event from here.
    ///
    /// This is the only way the sender's counter for a peer grows; it is
    /// never called with this node's own address.
    pub async fn bump_clock_for_node(&self, node: &str) {
        {
            let mut inner = self.inner.lock().await;
            inner.vc.increment(node);
        }
        self.changed.notify_waiters();
    }

    /// Every entry in the store, tombstones included.
    pub async fn all_entries(&self) -> Vec<Entry> {
        let inner = self.inner.lock().await;
        inner.data.values().cloned().collect()
    }

    /// Replace the whole store with `entries` (view change, phase 2).
    ///
    /// The clock resets to the pointwise maximum of the incoming entries'
    /// clocks; an empty replacement purges every key.
    pub async fn replace_entries(&self, entries: Vec<Entry>) {
        {
            let mut inner = self.inner.lock().await;
            let mut vc = VectorClock::new();
            for entry in &entries {
                vc.merge(&entry.clock);
            }
            inner.vc = vc;
            inner.data = entries.into_iter().map(|e| (e.key.clone(), e)).collect();
        }
        self.changed.notify_waiters();
    }

    /// Install the shard's replica set after a view change.
    pub async fn set_replicas(&self, replicas: Vec<String>) {
        {
            let mut inner = self.inner.lock().await;
            inner.replicas = replicas;
        }
        // Projections changed, so waiters must re-evaluate.
        self.changed.notify_waiters();
    }

    /// Snapshot of the current vector clock.
    pub async fn clock(&self) -> VectorClock {
        self.inner.lock().await.vc.clone()
    }
}
