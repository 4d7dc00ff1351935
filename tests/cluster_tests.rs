//! Integration tests for multi-node clusters: gossip between replicas,
//! cross-shard forwarding, and coordinated view changes.

use serde_json::{json, Value};
use shardkv::partition::fnv1a_32;
use shardkv::{http, Node, View};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Bind `n` ephemeral listeners first so every node knows the full member
/// list before any of them starts serving.
async fn start_cluster(n: usize, repl_factor: usize) -> (Vec<Arc<Node>>, Vec<String>) {
    let mut listeners = Vec::new();
    let mut addrs = Vec::new();
    for _ in 0..n {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        addrs.push(listener.local_addr().unwrap().to_string());
        listeners.push(listener);
    }

    let view = View::new(addrs.clone(), repl_factor);
    let mut nodes = Vec::new();
    for (listener, addr) in listeners.into_iter().zip(&addrs) {
        let node = Node::new(addr.clone(), view.clone()).unwrap();
        tokio::spawn(http::serve(node.clone(), listener));
        nodes.push(node);
    }
    (nodes, addrs)
}

fn keys_url(addr: &str, key: &str) -> String {
    format!("http://{addr}/kv-store/keys/{key}")
}

async fn body(response: reqwest::Response) -> Value {
    response.json().await.unwrap()
}

/// A key that hashes onto the given 0-based shard index.
fn key_for_shard(shard_idx: usize, shard_count: usize) -> String {
    (0..)
        .map(|i| format!("q{i}"))
        .find(|key| fnv1a_32(key.as_bytes()) as usize % shard_count == shard_idx)
        .unwrap()
}

#[tokio::test]
async fn test_causal_read_across_replicas() {
    let (_nodes, addrs) = start_cluster(2, 2).await;
    let client = reqwest::Client::new();

    // Write at the first replica.
    let response = client
        .put(keys_url(&addrs[0], "x"))
        .json(&json!({"value": "1", "causal-context": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let ctx = body(response).await["causal-context"].clone();
    assert_eq!(ctx[&addrs[0]], 1);

    // Read at the second replica carrying the write's context. The store
    // holds the request until gossip delivers the write, so this cannot
    // return stale data no matter who wins the race.
    let response = client
        .get(keys_url(&addrs[1], "x"))
        .json(&json!({"causal-context": ctx}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let get = body(response).await;
    assert_eq!(get["value"], "1");
    let ctx = get["causal-context"].clone();

    // Delete at the second replica; its own reads reflect the tombstone
    // immediately.
    let response = client
        .delete(keys_url(&addrs[1], "x"))
        .json(&json!({"causal-context": ctx}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(body(response).await["doesExist"], true);

    let response = client
        .get(keys_url(&addrs[1], "x"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // The tombstone converges to the first replica through gossip.
    let mut converged = false;
    for _ in 0..50 {
        let response = client.get(keys_url(&addrs[0], "x")).send().await.unwrap();
        if response.status() == 404 {
            converged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(converged, "tombstone never reached the other replica");
}

#[tokio::test]
async fn test_unsatisfiable_context_is_unavailable() {
    let (_nodes, addrs) = start_cluster(2, 2).await;
    let client = reqwest::Client::new();

    // A context referencing events that will never arrive times out at the
    // edge.
    let mut never = serde_json::Map::new();
    never.insert(addrs[0].clone(), json!(42));
    let response = client
        .get(keys_url(&addrs[1], "x"))
        .json(&json!({"causal-context": never}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let refused = body(response).await;
    assert_eq!(refused["message"], "Error in GET");
    assert_eq!(refused["error"], "Unable to satisfy request");
}

#[tokio::test]
async fn test_forwarding_across_shards() {
    // Two members, replication factor 1: two single-replica shards.
    let (nodes, addrs) = start_cluster(2, 1).await;
    let client = reqwest::Client::new();

    // A key owned by the second shard, written through the first node.
    let key = key_for_shard(1, 2);
    assert!(!nodes[0].owns(&key));
    assert!(nodes[1].owns(&key));

    let response = client
        .put(keys_url(&addrs[0], &key))
        .json(&json!({"value": "42", "causal-context": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let put = body(response).await;
    assert_eq!(put["message"], "Added successfully");
    // The relayed response carries the forwarding node's address.
    assert_eq!(put["address"], addrs[0]);

    // The owner serves it directly...
    let response = client
        .get(keys_url(&addrs[1], &key))
        .json(&json!({"causal-context": put["causal-context"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(body(response).await["value"], "42");

    // ...and the non-owner forwards reads too.
    let response = client
        .get(keys_url(&addrs[0], &key))
        .json(&json!({"causal-context": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let get = body(response).await;
    assert_eq!(get["value"], "42");
    assert_eq!(get["address"], addrs[0]);
}

#[tokio::test]
async fn test_view_change_redistributes_keys() {
    let (_nodes, addrs) = start_cluster(3, 1).await;
    let client = reqwest::Client::new();

    // 60 distinct keys, all written through the first node; forwarding
    // scatters them across the three shards.
    for i in 0..60 {
        let response = client
            .put(keys_url(&addrs[0], &format!("key{i}")))
            .json(&json!({"value": i.to_string(), "causal-context": {}}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201, "put key{i}");
    }

    // An identical view is acknowledged without redistribution, but still
    // reports the real layout.
    let response = client
        .put(format!("http://{}/kv-store/view-change", addrs[0]))
        .json(&json!({"view": addrs, "repl-factor": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let unchanged = body(response).await;
    assert_eq!(unchanged["message"], "View change successful");
    let shards = unchanged["shards"].as_array().unwrap();
    assert_eq!(shards.len(), 3);
    let mut total = 0;
    for shard in shards {
        let count = shard["key-count"].as_u64().unwrap();
        assert!((16..=24).contains(&count), "unbalanced shard: {count}");
        total += count;
    }
    assert_eq!(total, 60);

    // Shrink to two members, coordinated by the node being removed.
    let response = client
        .put(format!("http://{}/kv-store/view-change", addrs[2]))
        .json(&json!({"view": [addrs[0], addrs[1]], "repl-factor": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let rotated = body(response).await;
    let shards = rotated["shards"].as_array().unwrap();
    assert_eq!(shards.len(), 2);
    let counts: Vec<u64> = shards
        .iter()
        .map(|s| s["key-count"].as_u64().unwrap())
        .collect();
    assert_eq!(counts.iter().sum::<u64>(), 60);
    for count in counts {
        assert!((24..=36).contains(&count), "unbalanced shard: {count}");
    }

    // Every key is still reachable through the surviving members.
    for i in [0, 17, 42, 59] {
        let response = client
            .get(keys_url(&addrs[0], &format!("key{i}")))
            .json(&json!({"causal-context": {}}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200, "key{i} lost in view change");
        assert_eq!(body(response).await["value"], i.to_string());
    }
}

#[tokio::test]
async fn test_view_change_rejects_bad_input() {
    let (_nodes, addrs) = start_cluster(1, 1).await;
    let client = reqwest::Client::new();

    let response = client
        .put(format!("http://{}/kv-store/view-change", addrs[0]))
        .json(&json!({"view": [], "repl-factor": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert_eq!(body(response).await["error"], "Failed to parse request body");

    let response = client
        .put(format!("http://{}/kv-store/view-change", addrs[0]))
        .json(&json!({"view": addrs, "repl-factor": 0}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_growing_replication_factor_replicates_everywhere() {
    let (_nodes, addrs) = start_cluster(2, 1).await;
    let client = reqwest::Client::new();

    // Seed both shards.
    for key in ["k", "x", "mykey", "hello"] {
        let response = client
            .put(keys_url(&addrs[0], key))
            .json(&json!({"value": "v", "causal-context": {}}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
    }

    // Collapse to a single shard replicated on both nodes.
    let response = client
        .put(format!("http://{}/kv-store/view-change", addrs[0]))
        .json(&json!({"view": addrs, "repl-factor": 2}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let rotated = body(response).await;
    let shards = rotated["shards"].as_array().unwrap();
    assert_eq!(shards.len(), 1);
    assert_eq!(shards[0]["key-count"], 4);
    assert_eq!(
        shards[0]["replicas"].as_array().unwrap().len(),
        2,
        "single shard should span both members"
    );

    // Both replicas now hold every key locally.
    for addr in &addrs {
        let response = client
            .get(format!("http://{addr}/kv-store/key-count"))
            .json(&json!({"causal-context": {}}))
            .send()
            .await
            .unwrap();
        assert_eq!(body(response).await["key-count"], 4);
    }
}
