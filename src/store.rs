use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{debug, info};

use crate::error::DhtError;
use crate::contact::Contact;
use crate::kuid::Kuid;
use crate::message::{Body, DhtValue, StoreStatus};
use crate::node::DhtNode;

/// One locally held value. Created by an accepted STORE, refreshed by
/// republication, removed by the expiry sweep.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub value: DhtValue,
    pub published: Instant,
    pub local_origin: bool,
    /// Nodes that accepted the last publish; scales the republish
    /// interval.
    pub replicas: usize,
}

/// Bounded local value store. Values under one key are distinguished
/// by originator, so several publishers can share a key.
pub(crate) struct Database {
    entries: HashMap<Kuid, Vec<Entry>>,
    value_count: usize,
    max_value_size: usize,
    max_values_per_key: usize,
    max_values: usize,
}

impl Database {
    pub fn new(max_value_size: usize, max_values_per_key: usize, max_values: usize) -> Self {
        Self {
            entries: HashMap::new(),
            value_count: 0,
            max_value_size,
            max_values_per_key,
            max_values,
        }
    }

    pub fn insert(&mut self, value: DhtValue, local_origin: bool) -> StoreStatus {
        if value.value.is_empty() || value.value.len() > self.max_value_size {
            return StoreStatus::Rejected;
        }

        let slot = self.entries.entry(value.key).or_default();

        if let Some(existing) = slot
            .iter_mut()
            .find(|e| e.value.originator.id == value.originator.id)
        {
            existing.value = value;
            existing.published = Instant::now();
            existing.local_origin |= local_origin;
            return StoreStatus::Accepted;
        }

        if slot.len() >= self.max_values_per_key || self.value_count >= self.max_values {
            return StoreStatus::Rejected;
        }

        slot.push(Entry {
            value,
            published: Instant::now(),
            local_origin,
            replicas: 0,
        });
        self.value_count += 1;
        StoreStatus::Accepted
    }

    pub fn get(&self, key: &Kuid) -> Vec<DhtValue> {
        self.entries
            .get(key)
            .map(|slot| slot.iter().map(|e| e.value.clone()).collect())
            .unwrap_or_default()
    }

    pub fn keys(&self) -> Vec<Kuid> {
        self.entries.keys().copied().collect()
    }

    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub fn value_count(&self) -> usize {
        self.value_count
    }

    /// Drop remotely originated entries older than their key's TTL.
    /// Locally published values never expire here; they live until
    /// the application withdraws them.
    pub fn expire(&mut self, ttl_per_key: &HashMap<Kuid, Duration>) -> usize {
        let mut removed = 0;
        self.entries.retain(|key, slot| {
            if let Some(&ttl) = ttl_per_key.get(key) {
                let before = slot.len();
                slot.retain(|e| e.local_origin || e.published.elapsed() < ttl);
                removed += before - slot.len();
            }
            !slot.is_empty()
        });
        self.value_count -= removed;
        removed
    }

    /// Locally originated values whose republish deadline has passed.
    /// A value replicated onto fewer nodes comes due sooner; the
    /// interval is floored so nothing republishes in a tight loop.
    pub fn due_for_republish(&self, base: Duration, min: Duration, k: usize) -> Vec<DhtValue> {
        self.entries
            .values()
            .flatten()
            .filter(|e| e.local_origin)
            .filter(|e| {
                let scaled = base.mul_f64(e.replicas as f64 / k.max(1) as f64);
                let due = scaled.clamp(min.min(base), base);
                e.published.elapsed() >= due
            })
            .map(|e| e.value.clone())
            .collect()
    }

    pub fn mark_published(&mut self, key: &Kuid, originator: &Kuid, replicas: usize) {
        if let Some(entry) = self
            .entries
            .get_mut(key)
            .and_then(|slot| slot.iter_mut().find(|e| &e.value.originator.id == originator))
        {
            entry.published = Instant::now();
            entry.replicas = replicas;
        }
    }
}

/// Outcome of a `put`: which nodes accepted the value and which
/// declined. Partial acceptance is still a success.
#[derive(Debug, Clone, Default)]
pub struct StoreResult {
    pub accepted: Vec<Contact>,
    pub rejected: Vec<Contact>,
}

/// Locate the k closest nodes to the value's key and push it to each
/// with the token that node issued during the lookup. Tokens are not
/// interchangeable across nodes.
pub(crate) async fn store_value(
    node: &Arc<DhtNode>,
    value: DhtValue,
) -> Result<StoreResult, DhtError> {
    let found = crate::lookup::find_node(node, value.key).await?;

    if found.is_empty() {
        debug!(key = %value.key, "no nodes reachable to store to");
        return Err(DhtError::StoreRejected);
    }

    let attempts = join_all(found.into_iter().map(|(contact, token)| {
        let value = value.clone();
        async move {
            let msg = node.new_message(Body::Store {
                token,
                values: vec![value],
            });
            let result = node
                .rpc
                .request(contact.addr, msg, node.config.request_timeout)
                .await;
            (contact, result)
        }
    }))
    .await;

    let mut result = StoreResult::default();
    for (contact, outcome) in attempts {
        match outcome {
            Ok(response) => {
                node.offer_alive(&response.sender, contact.addr);
                let accepted = match response.body {
                    Body::StoreAck { statuses } => statuses
                        .iter()
                        .any(|(k, s)| *k == value.key && *s == StoreStatus::Accepted),
                    _ => false,
                };
                if accepted {
                    result.accepted.push(contact);
                } else {
                    debug!(key = %value.key, node = %contact.id, "store rejected");
                    result.rejected.push(contact);
                }
            }
            Err(_) => {
                node.note_failure(&contact.id);
                result.rejected.push(contact);
            }
        }
    }

    if result.accepted.is_empty() {
        return Err(DhtError::StoreRejected);
    }

    info!(key = %value.key, replicas = result.accepted.len(), "value stored");
    Ok(result)
}

/// One republish cycle: re-store every due local value. The caller
/// guarantees at most one cycle runs at a time; the cycle checks for
/// shutdown between values so close() takes effect promptly.
pub(crate) async fn republish(node: &Arc<DhtNode>) {
    let due = {
        let db = node.db.lock();
        db.due_for_republish(
            node.config.republish_interval,
            node.config.min_republish_interval,
            node.config.k,
        )
    };

    if due.is_empty() {
        return;
    }
    debug!(count = due.len(), "republishing due values");

    for value in due {
        if node.is_closed() {
            return;
        }
        let key = value.key;
        let originator = value.originator.id;
        match store_value(node, value).await {
            Ok(result) => {
                node.db
                    .lock()
                    .mark_published(&key, &originator, result.accepted.len());
            }
            Err(e) => debug!(%key, "republish failed: {e}"),
        }
    }
}
