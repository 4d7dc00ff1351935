/// Error types for shardkv operations.
///
/// Every failure a handler can surface to a client maps onto one of these
/// variants; the HTTP layer owns the status-code mapping. The store itself
/// never fails; admission deadlines are enforced at the edge and reported
/// as `Unavailable`.
use thiserror::Error;

/// The main error type for shardkv operations.
#[derive(Error, Debug)]
pub enum KvError {
    /// Request body was present but not valid JSON for the endpoint.
    #[error("Failed to parse request body")]
    FailedToParse,

    /// The key path segment was empty.
    #[error("Key is missing")]
    KeyMissing,

    /// Keys are limited to 50 bytes.
    #[error("Key is too long")]
    KeyTooLong,

    /// PUT without a value.
    #[error("Value is missing")]
    ValueMissing,

    /// Read or delete of a key with no live entry.
    #[error("Key does not exist")]
    KeyDoesNotExist,

    /// The store could not admit the operation before the deadline.
    #[error("Unable to satisfy request")]
    Unavailable,

    /// A forwarded request could not reach any replica of the owning shard.
    #[error("Main instance is down")]
    UpstreamDown,

    /// The owning shard has no usable replica address.
    #[error("Bad forwarding address {addr:?}")]
    BadForwarding {
        /// The address that could not be used
        addr: String,
    },

    /// Transport-level failure talking to a peer.
    #[error("Peer request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// A peer answered with an unexpected status.
    #[error("Peer answered {status} for {endpoint}")]
    PeerStatus {
        /// Endpoint that was called
        endpoint: String,
        /// Status code the peer returned
        status: u16,
    },

    /// Invalid startup configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type alias for shardkv operations.
pub type KvResult<T> = Result<T, KvError>;
