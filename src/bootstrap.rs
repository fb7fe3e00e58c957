use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::DhtError;
use crate::node::DhtNode;

/// Bootstrap succeeded; `failed_seeds` lists the candidates that
/// never answered.
#[derive(Debug, Clone)]
pub struct BootstrapResult {
    pub failed_seeds: Vec<SocketAddr>,
}

/// A table with fewer live contacts than this fraction of k after the
/// self-lookup gets one more self-lookup pass; a mostly-stale table
/// undermines lookup correctness.
const POOR_RATIO: usize = 4;

/// Seed the routing table and discover the local neighborhood.
///
/// Every seed is pinged in parallel; one success is enough to proceed
/// to a self-lookup that fills the buckets near the local id. With an
/// empty seed list, contacts from a restored routing table stand in
/// as seeds. Contacts that failed along the way are purged before
/// reporting.
pub(crate) async fn bootstrap(
    node: &Arc<DhtNode>,
    seeds: &[SocketAddr],
) -> Result<BootstrapResult, DhtError> {
    for seed in seeds {
        node.check_addr(*seed)?;
    }

    let candidates: Vec<SocketAddr> = if seeds.is_empty() {
        let table = node.table.lock();
        table
            .get_closest(node.local_id(), node.config.k)
            .into_iter()
            .map(|c| c.addr)
            .collect()
    } else {
        seeds.to_vec()
    };

    if candidates.is_empty() {
        return Err(DhtError::BootstrapFailed);
    }

    info!(seeds = candidates.len(), "bootstrap starting");

    let pings = join_all(candidates.iter().map(|&addr| async move {
        let result = node.ping(addr).await;
        (addr, result)
    }))
    .await;

    let mut failed_seeds = Vec::new();
    let mut any_alive = false;
    for (addr, result) in pings {
        match result {
            Ok(contact) => {
                debug!(%addr, id = %contact.id, "seed answered");
                any_alive = true;
            }
            Err(DhtError::CollisionDetected) => return Err(DhtError::CollisionDetected),
            Err(e) => {
                debug!(%addr, "seed unreachable: {e}");
                failed_seeds.push(addr);
            }
        }
    }

    if !any_alive {
        warn!("bootstrap failed: every seed unreachable");
        return Err(DhtError::BootstrapFailed);
    }

    self_lookup(node).await?;

    // With barely any live neighbors the first pass likely hit stale
    // contacts; try once more against what it just learned.
    if node.table.lock().alive_count() < node.config.k / POOR_RATIO {
        debug!("poor contact ratio after self-lookup, retrying");
        self_lookup(node).await?;
    }

    let purged = node.table.lock().purge_failed();
    if purged > 0 {
        debug!(purged, "stale contacts dropped during bootstrap");
    }

    node.set_ready();
    info!(
        contacts = node.table.lock().len(),
        failed = failed_seeds.len(),
        "bootstrap complete"
    );
    Ok(BootstrapResult { failed_seeds })
}

async fn self_lookup(node: &Arc<DhtNode>) -> Result<(), DhtError> {
    match crate::lookup::find_node(node, *node.local_id()).await {
        Ok(_) => Ok(()),
        Err(DhtError::CollisionDetected) => Err(DhtError::CollisionDetected),
        // A sparse network can time the lookup out; whatever contacts
        // it did find are already in the table.
        Err(e) => {
            debug!("self-lookup incomplete: {e}");
            Ok(())
        }
    }
}
