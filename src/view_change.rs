/// Coordinated view changes: two-phase collect/replace.
///
/// Any node that receives `PUT /kv-store/view-change` becomes the
/// coordinator for that request. Phase 1 collects the full state of every
/// shard of the *old* view (first reachable replica wins, shards in
/// parallel); phase 2 reindexes all collected entries under the new view
/// and pushes each new shard's state to its first replica, which fans it
/// out to its co-replicas.
///
/// Failure policy is deliberately soft: a shard with no reachable replica
/// contributes an empty state (its keys are dropped rather than blocking
/// the reconfiguration), and an unreachable replacement primary is reported
/// with a zero key count. The response always reflects the reachable state.
use crate::clock::VectorClock;
use crate::error::{KvError, KvResult};
use crate::node::Node;
use crate::partition::shard_index;
use crate::types::{Entry, View};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

/// How long a collect primary waits for its co-replicas' events to land.
const COLLECT_WAIT: Duration = Duration::from_secs(5);
/// Per-request deadline for internal view-change calls; must exceed
/// `COLLECT_WAIT` so a waiting primary is not cut off mid-collect.
const PEER_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of `GET /kv-store/view-change/primary-collect`.
///
/// `replicas` is the old shard's replica list, captured by the coordinator
/// before its own table rotated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryCollectRequest {
    pub view: View,
    pub replicas: Vec<String>,
}

/// Body of `GET /kv-store/view-change/secondary-collect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondaryCollectRequest {
    pub view: View,
}

/// A collect primary's answer: the shard's full state, tombstones included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectResponse {
    pub state: Vec<Entry>,
    #[serde(rename = "causal-context")]
    pub causal_context: VectorClock,
}

/// A collect secondary's answer: its current clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockResponse {
    #[serde(rename = "causal-context")]
    pub causal_context: VectorClock,
}

/// Body of the `primary-replace` and `secondary-replace` endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaceRequest {
    pub view: View,
    pub state: Vec<Entry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaceResponse {
    #[serde(rename = "key-count")]
    pub key_count: usize,
}

/// One line of the coordinator's response: a new shard, its replicas, and
/// the number of live keys handed to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardReport {
    #[serde(rename = "shard-id")]
    pub shard_id: usize,
    pub replicas: Vec<String>,
    #[serde(rename = "key-count")]
    pub key_count: usize,
}

#[derive(Debug, Deserialize)]
struct KeyCountAck {
    #[serde(rename = "key-count")]
    key_count: usize,
}

/// Group entries by their owning shard under a layout of `shard_count`
/// shards. Index 0 holds shard 1's state.
pub(crate) fn reindex(entries: Vec<Entry>, shard_count: usize) -> Vec<Vec<Entry>> {
    let mut groups: Vec<Vec<Entry>> = vec![Vec::new(); shard_count];
    for entry in entries {
        let idx = shard_index(&entry.key, shard_count) - 1;
        groups[idx].push(entry);
    }
    groups
}

impl Node {
    /// Coordinate a view change towards `view`.
    ///
    /// A view identical to the current one is acknowledged with the current
    /// layout and key counts; collect/replace only fire on a real rotation.
    pub async fn coordinate_view_change(&self, view: View) -> Vec<ShardReport> {
        let old_shards = self.partition.members_by_shard();
        if !self.apply_view(&view).await {
            info!("view unchanged, acknowledging without redistribution");
            return self.report_current_view().await;
        }

        info!(shards = view.shard_count(), "view change: collecting old shards");
        let collected: Vec<Entry> = join_all(
            old_shards
                .into_iter()
                .map(|replicas| self.collect_shard(replicas, &view)),
        )
        .await
        .into_iter()
        .flatten()
        .collect();

        info!(entries = collected.len(), "view change: replacing new shards");
        let groups = reindex(collected, view.shard_count());
        join_all(
            groups
                .into_iter()
                .enumerate()
                .map(|(idx, state)| self.replace_shard(idx + 1, state, &view)),
        )
        .await
    }

    /// Phase 1 for one old shard: ask its replicas in order, first full
    /// state wins.
    async fn collect_shard(&self, replicas: Vec<String>, view: &View) -> Vec<Entry> {
        let request = PrimaryCollectRequest {
            view: view.clone(),
            replicas: replicas.clone(),
        };
        for replica in &replicas {
            if replica == self.address() {
                match self.run_primary_collect(&request).await {
                    Ok(response) => return response.state,
                    Err(err) => warn!(%replica, %err, "local collect failed, trying next replica"),
                }
                continue;
            }
            match self.send_primary_collect(replica, &request).await {
                Ok(state) => return state,
                Err(err) => warn!(%replica, %err, "collect failed, trying next replica"),
            }
        }
        warn!(?replicas, "no replica of old shard reachable, dropping its keys");
        Vec::new()
    }

    /// Phase 2 for one new shard: hand its state to the first replica.
    async fn replace_shard(&self, shard_id: usize, state: Vec<Entry>, view: &View) -> ShardReport {
        let replicas = view.replicas(shard_id);
        let request = ReplaceRequest {
            view: view.clone(),
            state,
        };

        let key_count = match replicas.first() {
            Some(primary) if primary == self.address() => {
                self.run_primary_replace(&request).await.key_count
            }
            Some(primary) => match self.send_primary_replace(primary, &request).await {
                Ok(count) => count,
                Err(err) => {
                    warn!(%primary, shard_id, %err, "replace failed, reporting empty shard");
                    0
                }
            },
            None => 0,
        };

        ShardReport {
            shard_id,
            replicas,
            key_count,
        }
    }

    /// Serve a `primary-collect` request.
    ///
    /// Gathers the clocks of the old co-replicas (each rotates to the new
    /// view as a side effect), waits until every event those clocks cover
    /// has been applied locally, and only then rotates and returns the full
    /// shard state. The wait is bounded: a timeout fails the collect so the
    /// coordinator can try the next replica.
    pub async fn run_primary_collect(
        &self,
        request: &PrimaryCollectRequest,
    ) -> KvResult<CollectResponse> {
        let mut waiting = self.store.clock().await;
        let peers: Vec<&String> = request
            .replicas
            .iter()
            .filter(|r| r.as_str() != self.address())
            .collect();
        for result in join_all(
            peers
                .iter()
                .map(|peer| self.send_secondary_collect(peer, &request.view)),
        )
        .await
        {
            match result {
                Ok(clock) => waiting.merge(&clock),
                Err(err) => warn!(%err, "secondary collect failed, proceeding without it"),
            }
        }

        // Wait on the old shard's members explicitly: when the coordinator
        // collects its own shard, its replica set has already rotated and a
        // plain wait_until_current would project the old co-replicas away.
        let waiting = waiting.project(&request.replicas);
        timeout(
            COLLECT_WAIT,
            self.store.wait_until_current_on(&waiting, &request.replicas),
        )
        .await
        .map_err(|_| KvError::Unavailable)?;

        let state = self.store.all_entries().await;
        self.apply_view(&request.view).await;
        Ok(CollectResponse {
            state,
            causal_context: self.store.clock().await,
        })
    }

    /// Serve a `secondary-collect` request: rotate and report the clock.
    pub async fn run_secondary_collect(&self, view: &View) -> ClockResponse {
        self.apply_view(view).await;
        ClockResponse {
            causal_context: self.store.clock().await,
        }
    }

    /// Serve a `primary-replace` request: install the shard state and fan
    /// it out to the co-replicas of this node's new shard.
    pub async fn run_primary_replace(&self, request: &ReplaceRequest) -> ReplaceResponse {
        self.apply_view(&request.view).await;
        self.store.replace_entries(request.state.clone()).await;

        let co_replicas: Vec<String> = request
            .view
            .replicas_of_member(self.address())
            .into_iter()
            .filter(|r| r != self.address())
            .collect();
        for result in join_all(
            co_replicas
                .iter()
                .map(|peer| self.send_secondary_replace(peer, request)),
        )
        .await
        {
            if let Err(err) = result {
                warn!(%err, "secondary replace failed");
            }
        }

        ReplaceResponse {
            key_count: request.state.iter().filter(|e| !e.deleted).count(),
        }
    }

    /// Serve a `secondary-replace` request.
    pub async fn run_secondary_replace(&self, request: &ReplaceRequest) {
        self.apply_view(&request.view).await;
        self.store.replace_entries(request.state.clone()).await;
    }

    /// Layout answer for a duplicate view change: the current shards with
    /// their live key counts.
    async fn report_current_view(&self) -> Vec<ShardReport> {
        join_all(
            self.partition
                .members_by_shard()
                .into_iter()
                .enumerate()
                .map(|(idx, replicas)| async move {
                    let shard_id = idx + 1;
                    let key_count = if replicas.iter().any(|r| r == self.address()) {
                        self.store.num_keys(&VectorClock::new()).await.0
                    } else {
                        self.fetch_key_count(&replicas).await
                    };
                    ShardReport {
                        shard_id,
                        replicas,
                        key_count,
                    }
                }),
        )
        .await
    }

    async fn fetch_key_count(&self, replicas: &[String]) -> usize {
        for replica in replicas {
            let url = format!("http://{replica}/kv-store/key-count");
            let result: Result<usize, reqwest::Error> = async {
                let response = self
                    .client
                    .get(&url)
                    .timeout(PEER_TIMEOUT)
                    .json(&serde_json::json!({ "causal-context": {} }))
                    .send()
                    .await?;
                response
                    .error_for_status()?
                    .json::<KeyCountAck>()
                    .await
                    .map(|ack| ack.key_count)
            }
            .await;
            match result {
                Ok(count) => return count,
                Err(err) => warn!(%replica, %err, "key count probe failed"),
            }
        }
        0
    }

    async fn send_primary_collect(
        &self,
        replica: &str,
        request: &PrimaryCollectRequest,
    ) -> KvResult<Vec<Entry>> {
        let url = format!("http://{replica}/kv-store/view-change/primary-collect");
        let response = self
            .client
            .get(&url)
            .timeout(PEER_TIMEOUT)
            .json(request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(KvError::PeerStatus {
                endpoint: url,
                status: response.status().as_u16(),
            });
        }
        Ok(response.json::<CollectResponse>().await?.state)
    }

    async fn send_secondary_collect(&self, replica: &str, view: &View) -> KvResult<VectorClock> {
        let url = format!("http://{replica}/kv-store/view-change/secondary-collect");
        let response = self
            .client
            .get(&url)
            .timeout(PEER_TIMEOUT)
            .json(&SecondaryCollectRequest { view: view.clone() })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(KvError::PeerStatus {
                endpoint: url,
                status: response.status().as_u16(),
            });
        }
        Ok(response.json::<ClockResponse>().await?.causal_context)
    }

    async fn send_primary_replace(
        &self,
        replica: &str,
        request: &ReplaceRequest,
    ) -> KvResult<usize> {
        let url = format!("http://{replica}/kv-store/view-change/primary-replace");
        let response = self
            .client
            .put(&url)
            .timeout(PEER_TIMEOUT)
            .json(request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(KvError::PeerStatus {
                endpoint: url,
                status: response.status().as_u16(),
            });
        }
        Ok(response.json::<ReplaceResponse>().await?.key_count)
    }

    async fn send_secondary_replace(&self, replica: &str, request: &ReplaceRequest) -> KvResult<()> {
        let url = format!("http://{replica}/kv-store/view-change/secondary-replace");
        let response = self
            .client
            .put(&url)
            .timeout(PEER_TIMEOUT)
            .json(request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(KvError::PeerStatus {
                endpoint: url,
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::fnv1a_32;
    use crate::types::Version;

    fn entry(key: &str) -> Entry {
        Entry {
            key: key.to_string(),
            value: "v".to_string(),
            deleted: false,
            clock: VectorClock::new(),
            version: Version {
                origin: "a".to_string(),
                seq: 1,
            },
        }
    }

    #[test]
    fn test_reindex_groups_by_hash() {
        let entries = vec![entry("k"), entry("x"), entry("y"), entry("mykey")];
        let groups = reindex(entries, 2);

        assert_eq!(groups.len(), 2);
        for (idx, group) in groups.iter().enumerate() {
            for e in group {
                assert_eq!(fnv1a_32(e.key.as_bytes()) as usize % 2, idx);
            }
        }
        let total: usize = groups.iter().map(Vec::len).sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn test_reindex_single_shard_takes_everything() {
        let groups = reindex(vec![entry("a"), entry("b")], 1);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }
}
