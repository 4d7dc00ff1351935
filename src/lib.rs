//! # shardkv
//!
//! A sharded, replicated, in-memory key-value store with causal
//! consistency. Clients carry an opaque causal context (a vector clock)
//! on every request; the service guarantees that any response reflecting
//! an operation also reflects everything that operation depended on,
//! under arbitrary interleaving, node crashes, partitions, and view
//! changes.
//!
//! ## Architecture
//!
//! - **Store** ([`store::Store`]): one mutex, one broadcast-on-mutation
//!   scheduler. Operations wait until their causal context is covered by
//!   the local clock, then commit and journal the event.
//! - **Gossip** ([`gossip::Gossiper`]): consumes the journal and pushes
//!   each commit to the shard's co-replicas with unbounded retry.
//! - **Partition table** ([`partition::PartitionTable`]): FNV-1a placement
//!   of keys onto shards of R replicas each.
//! - **View change** ([`view_change`]): two-phase collect/replace
//!   redistribution when membership or the replication factor changes.
//! - **HTTP edge** ([`http`]): axum router that validates, routes to the
//!   owning shard (forwarding when necessary), and speaks the JSON
//!   envelope contract.
//!
//! A node is one [`node::Node`] value built at startup from its
//! [`config::Config`]; there is no global state.

pub mod clock;
pub mod config;
pub mod error;
pub mod gossip;
pub mod http;
pub mod node;
pub mod partition;
pub mod store;
pub mod types;
pub mod view_change;

pub use clock::VectorClock;
pub use error::{KvError, KvResult};
pub use node::Node;
pub use types::{Entry, Version, View};

/// Initialize the logging system.
///
/// Call once at startup. The level is controlled through `RUST_LOG`
/// (default `info`).
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
