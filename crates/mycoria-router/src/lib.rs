//! # mycoria-router
//!
//! The routing table: a single sorted vector of peer, gossip and discovered
//! routes with geographically bucketed capacity limits, binary-search
//! lookups and XOR-distance nearest matching.
//!
//! ## Modules
//!
//! - [`prefix`] — routable-prefix set derived from the local address
//! - [`table`] — the route store and its lookup/insert/clean semantics

pub mod prefix;
pub mod table;

pub use prefix::{build_routable_prefixes, RoutablePrefix};
pub use table::{RouteEntry, RouteSource, RoutingTable};

/// Error types for routing operations.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// No configured routable prefix covers the destination.
    #[error("route unroutable: {0}")]
    RouteUnroutable(std::net::Ipv6Addr),

    /// The entry violates a table invariant.
    #[error("invalid route: {0}")]
    InvalidRoute(String),

    /// The destination's prefix bucket is over its gossip capacity.
    #[error("prefix bucket full for {0}")]
    BucketFull(std::net::Ipv6Addr),
}

pub type Result<T> = std::result::Result<T, RouterError>;
