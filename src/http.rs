/// HTTP edge: request dispatch, forwarding, and the response envelope.
///
/// Every client message is JSON. The envelope follows the service contract:
/// `message` is always set on success, `error` rides every 4xx/5xx together
/// with `message = "Error in <METHOD>"`, and `causal-context` is the store
/// clock snapshot the client must carry into its next request.
///
/// Requests for keys this node does not own are forwarded to a replica of
/// the owning shard (the deterministic primary for writes, any replica for
/// reads) and the upstream response is relayed verbatim with this node's
/// address added for diagnostics.
use crate::clock::VectorClock;
use crate::error::KvError;
use crate::gossip::GossipAck;
use crate::node::Node;
use crate::types::{Entry, View};
use crate::view_change::{
    PrimaryCollectRequest, ReplaceRequest, SecondaryCollectRequest, ShardReport,
};
use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{info, warn};

/// Deadline for local store operations; a miss is 503.
const OP_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for forwarded client requests.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(2);

pub const PUT_SUCCESS: &str = "Added successfully";
pub const UPDATE_SUCCESS: &str = "Updated successfully";
pub const GET_SUCCESS: &str = "Retrieved successfully";
pub const DELETE_SUCCESS: &str = "Deleted successfully";
pub const KEY_COUNT_SUCCESS: &str = "Key count retrieved successfully";
pub const SHARDS_SUCCESS: &str = "Shard membership retrieved successfully";
pub const SHARD_INFO_SUCCESS: &str = "Shard information retrieved successfully";
pub const VIEW_CHANGE_SUCCESS: &str = "View change successful";

/// Build the router for one node.
pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route(
            "/kv-store/keys/:key",
            put(put_key).get(get_key).delete(delete_key),
        )
        .route("/kv-store/key-count", get(key_count))
        .route("/kv-store/shards", get(list_shards))
        .route("/kv-store/shards/:id", get(shard_info))
        .route("/kv-store/view-change", put(view_change))
        .route("/kv-store/gossip", put(receive_gossip))
        .route("/kv-store/view-change/primary-collect", get(primary_collect))
        .route(
            "/kv-store/view-change/secondary-collect",
            get(secondary_collect),
        )
        .route("/kv-store/view-change/primary-replace", put(primary_replace))
        .route(
            "/kv-store/view-change/secondary-replace",
            put(secondary_replace),
        )
        .layer(middleware::from_fn(log_requests))
        .with_state(node)
}

/// Serve the node's API on an already-bound listener until the connection
/// is dropped or the process exits. The binary wires its own graceful
/// shutdown around the router instead.
pub async fn serve(node: Arc<Node>, listener: TcpListener) -> std::io::Result<()> {
    axum::serve(listener, router(node)).await
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let response = next.run(request).await;
    info!(%method, %uri, status = response.status().as_u16(), "handled request");
    response
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The client-facing response envelope for key operations. Fields that do
/// not apply to an endpoint are omitted from the JSON entirely.
#[derive(Debug, Default, Serialize)]
struct ApiResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(rename = "doesExist", skip_serializing_if = "Option::is_none")]
    does_exist: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    replaced: Option<bool>,
    #[serde(rename = "causal-context", skip_serializing_if = "Option::is_none")]
    causal_context: Option<VectorClock>,
}

#[derive(Debug, Serialize)]
struct KeyCountResponse {
    message: &'static str,
    #[serde(rename = "key-count")]
    key_count: usize,
    #[serde(rename = "causal-context")]
    causal_context: VectorClock,
}

#[derive(Debug, Serialize)]
struct ShardListResponse {
    message: &'static str,
    shards: Vec<usize>,
    #[serde(rename = "causal-context")]
    causal_context: VectorClock,
}

#[derive(Debug, Serialize)]
struct ShardInfoResponse {
    message: &'static str,
    #[serde(rename = "shard-id")]
    shard_id: usize,
    #[serde(rename = "key-count")]
    key_count: usize,
    replicas: Vec<String>,
    #[serde(rename = "causal-context")]
    causal_context: VectorClock,
}

#[derive(Debug, Serialize)]
struct ViewChangeResponse {
    message: &'static str,
    shards: Vec<ShardReport>,
}

/// Body of the key endpoints: `{value?, causal-context?}`. An absent body
/// is a request with no value and no dependencies.
#[derive(Debug, Default, Deserialize)]
struct KeyRequest {
    #[serde(default)]
    value: Option<String>,
    #[serde(default, rename = "causal-context")]
    causal_context: VectorClock,
}

/// Client body of `PUT /kv-store/view-change`.
#[derive(Debug, Deserialize)]
struct ViewChangeRequest {
    #[serde(default)]
    view: Vec<String>,
    #[serde(default, rename = "repl-factor")]
    repl_factor: usize,
}

fn parse_lenient<T: Default + DeserializeOwned>(bytes: &Bytes) -> Result<T, KvError> {
    if bytes.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(bytes).map_err(|_| KvError::FailedToParse)
}

fn parse_required<T: DeserializeOwned>(bytes: &Bytes) -> Result<T, KvError> {
    serde_json::from_slice(bytes).map_err(|_| KvError::FailedToParse)
}

fn validate_key(key: &str) -> Result<(), KvError> {
    if key.is_empty() {
        Err(KvError::KeyMissing)
    } else if key.len() > 50 {
        Err(KvError::KeyTooLong)
    } else {
        Ok(())
    }
}

fn error_response(status: StatusCode, method: &str, err: &KvError) -> Response {
    (
        status,
        Json(ApiResponse {
            message: Some(format!("Error in {method}")),
            error: Some(err.to_string()),
            ..Default::default()
        }),
    )
        .into_response()
}

fn unavailable(method: &str) -> Response {
    error_response(StatusCode::SERVICE_UNAVAILABLE, method, &KvError::Unavailable)
}

fn missing_key(method: &str, clock: VectorClock) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse {
            message: Some(format!("Error in {method}")),
            error: Some(KvError::KeyDoesNotExist.to_string()),
            does_exist: Some(false),
            causal_context: Some(clock),
            ..Default::default()
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Key operations
// ---------------------------------------------------------------------------

async fn put_key(State(node): State<Arc<Node>>, Path(key): Path<String>, body: Bytes) -> Response {
    if let Err(err) = validate_key(&key) {
        return error_response(StatusCode::BAD_REQUEST, "PUT", &err);
    }
    if !node.owns(&key) {
        return forward(&node, "PUT", &key, body).await;
    }

    let input: KeyRequest = match parse_lenient(&body) {
        Ok(input) => input,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, "PUT", &err),
    };
    let value = match input.value.filter(|v| !v.is_empty()) {
        Some(value) => value,
        None => return error_response(StatusCode::BAD_REQUEST, "PUT", &KvError::ValueMissing),
    };

    match timeout(OP_TIMEOUT, node.store.write(&input.causal_context, &key, &value)).await {
        Ok((replaced, clock)) => {
            let (status, message) = if replaced {
                (StatusCode::OK, UPDATE_SUCCESS)
            } else {
                (StatusCode::CREATED, PUT_SUCCESS)
            };
            (
                status,
                Json(ApiResponse {
                    message: Some(message.to_string()),
                    replaced: Some(replaced),
                    causal_context: Some(clock),
                    ..Default::default()
                }),
            )
                .into_response()
        }
        Err(_) => unavailable("PUT"),
    }
}

async fn get_key(State(node): State<Arc<Node>>, Path(key): Path<String>, body: Bytes) -> Response {
    if let Err(err) = validate_key(&key) {
        return error_response(StatusCode::BAD_REQUEST, "GET", &err);
    }
    if !node.owns(&key) {
        return forward(&node, "GET", &key, body).await;
    }

    let input: KeyRequest = match parse_lenient(&body) {
        Ok(input) => input,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, "GET", &err),
    };

    match timeout(OP_TIMEOUT, node.store.read(&input.causal_context, &key)).await {
        Ok((Some(entry), clock)) => (
            StatusCode::OK,
            Json(ApiResponse {
                message: Some(GET_SUCCESS.to_string()),
                value: Some(entry.value),
                does_exist: Some(true),
                causal_context: Some(clock),
                ..Default::default()
            }),
        )
            .into_response(),
        Ok((None, clock)) => missing_key("GET", clock),
        Err(_) => unavailable("GET"),
    }
}

async fn delete_key(
    State(node): State<Arc<Node>>,
    Path(key): Path<String>,
    body: Bytes,
) -> Response {
    if let Err(err) = validate_key(&key) {
        return error_response(StatusCode::BAD_REQUEST, "DELETE", &err);
    }
    if !node.owns(&key) {
        return forward(&node, "DELETE", &key, body).await;
    }

    let input: KeyRequest = match parse_lenient(&body) {
        Ok(input) => input,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, "DELETE", &err),
    };

    match timeout(OP_TIMEOUT, node.store.delete(&input.causal_context, &key)).await {
        Ok((true, clock)) => (
            StatusCode::OK,
            Json(ApiResponse {
                message: Some(DELETE_SUCCESS.to_string()),
                does_exist: Some(true),
                causal_context: Some(clock),
                ..Default::default()
            }),
        )
            .into_response(),
        Ok((false, clock)) => missing_key("DELETE", clock),
        Err(_) => unavailable("DELETE"),
    }
}

/// Relay a key request to a replica of the owning shard: the deterministic
/// primary for writes, any replica for reads.
async fn forward(node: &Node, method: &str, key: &str, body: Bytes) -> Response {
    let target = if method == "GET" {
        node.partition.any_for(key)
    } else {
        node.partition.primary_for(key)
    };
    let Some(target) = target else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            method,
            &KvError::BadForwarding { addr: key.to_string() },
        );
    };

    let url = format!("http://{target}/kv-store/keys/{key}");
    let request = match method {
        "PUT" => node.client.put(&url),
        "DELETE" => node.client.delete(&url),
        _ => node.client.get(&url),
    };

    match request
        .timeout(FORWARD_TIMEOUT)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
    {
        Ok(upstream) => {
            let status =
                StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let bytes = upstream.bytes().await.unwrap_or_default();
            relay(status, bytes.to_vec(), node.address())
        }
        Err(err) => {
            warn!(%target, %err, "forwarding failed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, method, &KvError::UpstreamDown)
        }
    }
}

/// Pass an upstream response through, tagging it with the forwarding
/// node's address.
fn relay(status: StatusCode, bytes: Vec<u8>, forwarder: &str) -> Response {
    let body = match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(mut value) => {
            if let Some(object) = value.as_object_mut() {
                object.insert(
                    "address".to_string(),
                    serde_json::Value::String(forwarder.to_string()),
                );
            }
            serde_json::to_vec(&value).unwrap_or(bytes)
        }
        Err(_) => bytes,
    };
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Counts and shard metadata
// ---------------------------------------------------------------------------

async fn key_count(State(node): State<Arc<Node>>, body: Bytes) -> Response {
    let input: KeyRequest = match parse_lenient(&body) {
        Ok(input) => input,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, "GET", &err),
    };

    match timeout(OP_TIMEOUT, node.store.num_keys(&input.causal_context)).await {
        Ok((count, clock)) => Json(KeyCountResponse {
            message: KEY_COUNT_SUCCESS,
            key_count: count,
            causal_context: clock,
        })
        .into_response(),
        Err(_) => unavailable("GET"),
    }
}

async fn list_shards(State(node): State<Arc<Node>>) -> Response {
    let shards: Vec<usize> = (1..=node.partition.shard_count()).collect();
    Json(ShardListResponse {
        message: SHARDS_SUCCESS,
        shards,
        causal_context: node.store.clock().await,
    })
    .into_response()
}

async fn shard_info(State(node): State<Arc<Node>>, Path(id): Path<usize>) -> Response {
    if id == 0 || id > node.partition.shard_count() {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse {
                message: Some("Error in GET".to_string()),
                error: Some("Shard does not exist".to_string()),
                ..Default::default()
            }),
        )
            .into_response();
    }

    let replicas = node.partition.replicas(id);
    if replicas.iter().any(|r| r == node.address()) {
        let (count, clock) = node.store.num_keys(&VectorClock::new()).await;
        return Json(ShardInfoResponse {
            message: SHARD_INFO_SUCCESS,
            shard_id: id,
            key_count: count,
            replicas,
            causal_context: clock,
        })
        .into_response();
    }

    // Not a member of that shard: relay the question to one of its replicas.
    for replica in &replicas {
        let url = format!("http://{replica}/kv-store/shards/{id}");
        match node.client.get(&url).timeout(FORWARD_TIMEOUT).send().await {
            Ok(upstream) if upstream.status().is_success() => {
                let status = StatusCode::from_u16(upstream.status().as_u16())
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                let bytes = upstream.bytes().await.unwrap_or_default();
                return relay(status, bytes.to_vec(), node.address());
            }
            Ok(upstream) => {
                warn!(%replica, status = upstream.status().as_u16(), "shard info relay refused")
            }
            Err(err) => warn!(%replica, %err, "shard info relay failed"),
        }
    }
    error_response(StatusCode::SERVICE_UNAVAILABLE, "GET", &KvError::UpstreamDown)
}

// ---------------------------------------------------------------------------
// View change
// ---------------------------------------------------------------------------

async fn view_change(State(node): State<Arc<Node>>, body: Bytes) -> Response {
    let request: ViewChangeRequest = match parse_required(&body) {
        Ok(request) => request,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, "PUT", &err),
    };
    if request.view.is_empty()
        || request.repl_factor == 0
        || request.view.len() < request.repl_factor
    {
        return error_response(StatusCode::BAD_REQUEST, "PUT", &KvError::FailedToParse);
    }

    let view = View::new(request.view, request.repl_factor);
    let shards = node.coordinate_view_change(view).await;
    Json(ViewChangeResponse {
        message: VIEW_CHANGE_SUCCESS,
        shards,
    })
    .into_response()
}

// ---------------------------------------------------------------------------
// Internal endpoints
// ---------------------------------------------------------------------------

async fn receive_gossip(State(node): State<Arc<Node>>, body: Bytes) -> Response {
    let entry: Entry = match serde_json::from_slice(&body) {
        Ok(entry) => entry,
        Err(err) => {
            warn!(%err, "received malformed gossip");
            return Json(GossipAck { imported: false }).into_response();
        }
    };

    match timeout(OP_TIMEOUT, node.store.import_entry(&entry)).await {
        Ok(imported) => Json(GossipAck { imported }).into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(GossipAck { imported: false }),
        )
            .into_response(),
    }
}

async fn primary_collect(State(node): State<Arc<Node>>, body: Bytes) -> Response {
    let request: PrimaryCollectRequest = match parse_required(&body) {
        Ok(request) => request,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, "GET", &err),
    };
    match node.run_primary_collect(&request).await {
        Ok(response) => Json(response).into_response(),
        Err(_) => unavailable("GET"),
    }
}

async fn secondary_collect(State(node): State<Arc<Node>>, body: Bytes) -> Response {
    let request: SecondaryCollectRequest = match parse_required(&body) {
        Ok(request) => request,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, "GET", &err),
    };
    Json(node.run_secondary_collect(&request.view).await).into_response()
}

async fn primary_replace(State(node): State<Arc<Node>>, body: Bytes) -> Response {
    let request: ReplaceRequest = match parse_required(&body) {
        Ok(request) => request,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, "PUT", &err),
    };
    Json(node.run_primary_replace(&request).await).into_response()
}

async fn secondary_replace(State(node): State<Arc<Node>>, body: Bytes) -> Response {
    let request: ReplaceRequest = match parse_required(&body) {
        Ok(request) => request,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, "PUT", &err),
    };
    node.run_secondary_replace(&request).await;
    Json(serde_json::json!({})).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_omits_unset_fields() {
        let body = ApiResponse {
            message: Some(PUT_SUCCESS.to_string()),
            replaced: Some(false),
            causal_context: Some(VectorClock::new()),
            ..Default::default()
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "message": "Added successfully",
                "replaced": false,
                "causal-context": {},
            })
        );
    }

    #[test]
    fn test_key_request_parses_leniently() {
        let empty = Bytes::new();
        let parsed: KeyRequest = parse_lenient(&empty).unwrap();
        assert!(parsed.value.is_none());
        assert!(parsed.causal_context.is_empty());

        let body = Bytes::from(r#"{"value":"1","causal-context":{"a:80":2}}"#);
        let parsed: KeyRequest = parse_lenient(&body).unwrap();
        assert_eq!(parsed.value.as_deref(), Some("1"));
        assert_eq!(parsed.causal_context.get("a:80"), 2);

        let garbage = Bytes::from("{not json");
        assert!(parse_lenient::<KeyRequest>(&garbage).is_err());
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("x").is_ok());
        assert!(matches!(validate_key(""), Err(KvError::KeyMissing)));
        let long = "k".repeat(51);
        assert!(matches!(validate_key(&long), Err(KvError::KeyTooLong)));
        assert!(validate_key(&"k".repeat(50)).is_ok());
    }

    #[test]
    fn test_relay_tags_forwarder_address() {
        let upstream = serde_json::to_vec(&serde_json::json!({"message": "Added successfully"})).unwrap();
        let response = relay(StatusCode::CREATED, upstream, "10.10.0.2:13800");
        assert_eq!(response.status(), StatusCode::CREATED);
    }
}
