use std::time::Duration;

use crate::kuid::Kuid;

/// Immutable per-node configuration, handed by reference to every
/// component at construction.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Local node id. Generated when `None`; set it to keep an
    /// identity across restarts.
    pub local_id: Option<Kuid>,

    /// Bucket capacity and lookup result-set size.
    pub k: usize,

    /// Lookup parallelism: RPCs issued per round.
    pub alpha: usize,

    /// Bound on each bucket's replacement cache.
    pub bucket_cache_size: usize,

    /// Consecutive timeouts before a contact is marked failed and
    /// evicted.
    pub max_failures: u8,

    /// Per-RPC response timeout.
    pub request_timeout: Duration,

    /// Maximum lookup rounds before giving up on further progress.
    pub lookup_hop_limit: usize,

    /// Wall-clock budget for a whole lookup.
    pub lookup_timeout: Duration,

    /// Bound on simultaneously outstanding requests.
    pub max_pending: usize,

    /// Base interval between republications of locally owned values.
    pub republish_interval: Duration,

    /// Floor under the replica-scaled republish interval.
    pub min_republish_interval: Duration,

    /// Base TTL for remotely stored values, shortened the further the
    /// local node sits from the key.
    pub value_expiration: Duration,

    /// How often store-token secrets rotate.
    pub token_rotation: Duration,

    /// Buckets not touched by a lookup for this long get a refresh
    /// lookup aimed into their range.
    pub bucket_refresh_interval: Duration,

    /// Cadence of the republish/expiry sweep.
    pub sweep_interval: Duration,

    pub max_value_size: usize,
    pub max_values_per_key: usize,
    pub max_values: usize,

    /// Accept loopback/private/link-local peer addresses. Off in
    /// production, on in local test networks.
    pub allow_private_addresses: bool,

    pub vendor: u32,
    pub version: u32,

    /// Bumped by the caller on every restart so peers can tell a
    /// rebind from an address forgery.
    pub instance_id: u8,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            local_id: None,
            k: 20,
            alpha: 3,
            bucket_cache_size: 16,
            max_failures: 3,
            request_timeout: Duration::from_secs(4),
            lookup_hop_limit: 10,
            lookup_timeout: Duration::from_secs(45),
            max_pending: 512,
            republish_interval: Duration::from_secs(60 * 60),
            min_republish_interval: Duration::from_secs(5 * 60),
            value_expiration: Duration::from_secs(60 * 60),
            token_rotation: Duration::from_secs(5 * 60),
            bucket_refresh_interval: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(60),
            max_value_size: 8 * 1024,
            max_values_per_key: 8,
            max_values: 16_384,
            allow_private_addresses: false,
            vendor: u32::from_be_bytes(*b"RKAD"),
            version: 1,
            instance_id: 0,
        }
    }
}
