use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, trace};

use crate::contact::Contact;
use crate::error::DhtError;
use crate::kuid::{Kuid, KUID_LENGTH};
use crate::message::{Body, DhtValue};
use crate::node::DhtNode;

/// A shortlist candidate and what we know about it so far.
struct Candidate {
    contact: Contact,
    dist: [u8; KUID_LENGTH],
    queried: bool,
    responded: bool,
    token: Bytes,
}

/// Working set of an iterative lookup, kept sorted by distance to the
/// target and deduplicated by node id.
struct Shortlist {
    target: Kuid,
    entries: Vec<Candidate>,
}

impl Shortlist {
    fn new(target: Kuid, seeds: Vec<Contact>) -> Self {
        let mut list = Self {
            target,
            entries: Vec::new(),
        };
        for seed in seeds {
            list.merge(seed);
        }
        list
    }

    /// Insert in distance order; returns false for duplicates.
    fn merge(&mut self, contact: Contact) -> bool {
        if self.entries.iter().any(|c| c.contact.id == contact.id) {
            return false;
        }
        let dist = contact.id.distance(&self.target);
        let pos = self
            .entries
            .partition_point(|c| c.dist < dist);
        self.entries.insert(
            pos,
            Candidate {
                contact,
                dist,
                queried: false,
                responded: false,
                token: Bytes::new(),
            },
        );
        true
    }

    /// Distance of the closest candidate currently known.
    fn best_dist(&self) -> Option<[u8; KUID_LENGTH]> {
        self.entries.first().map(|c| c.dist)
    }

    /// The up-to-alpha closest not-yet-queried candidates, marked
    /// queried.
    fn next_batch(&mut self, alpha: usize) -> Vec<Contact> {
        let mut batch = Vec::new();
        for candidate in self.entries.iter_mut() {
            if batch.len() >= alpha {
                break;
            }
            if !candidate.queried {
                candidate.queried = true;
                batch.push(candidate.contact.clone());
            }
        }
        batch
    }

    fn record_response(&mut self, id: &Kuid, token: Bytes) {
        if let Some(c) = self.entries.iter_mut().find(|c| &c.contact.id == id) {
            c.responded = true;
            c.token = token;
        }
    }

    /// Whether every one of the k closest candidates has been asked.
    fn closest_all_queried(&self, k: usize) -> bool {
        self.entries.iter().take(k).all(|c| c.queried)
    }

    /// The k closest candidates that actually answered, with the
    /// token each one issued.
    fn closest_responded(&self, k: usize) -> Vec<(Contact, Bytes)> {
        self.entries
            .iter()
            .filter(|c| c.responded)
            .take(k)
            .map(|c| (c.contact.clone(), c.token.clone()))
            .collect()
    }
}

pub(crate) enum ValueOutcome {
    Found {
        values: Vec<DhtValue>,
        /// Responders that did not hold the value, closest first.
        lacked: Vec<(Contact, Bytes)>,
    },
    NotFound {
        closest: Vec<(Contact, Bytes)>,
    },
}

enum Outcome {
    Nodes(Vec<(Contact, Bytes)>),
    Value(ValueOutcome),
}

/// Iterative FIND_NODE: converges on the k closest live nodes to
/// `target`, each paired with its store token.
pub(crate) async fn find_node(
    node: &Arc<DhtNode>,
    target: Kuid,
) -> Result<Vec<(Contact, Bytes)>, DhtError> {
    match run(node, target, false).await? {
        Outcome::Nodes(contacts) => Ok(contacts),
        Outcome::Value(_) => unreachable!("node lookup produced a value"),
    }
}

/// Iterative FIND_VALUE: short-circuits as soon as any responder
/// returns the value.
pub(crate) async fn find_value(
    node: &Arc<DhtNode>,
    key: Kuid,
) -> Result<ValueOutcome, DhtError> {
    match run(node, key, true).await? {
        Outcome::Value(outcome) => Ok(outcome),
        Outcome::Nodes(closest) => Ok(ValueOutcome::NotFound { closest }),
    }
}

/// The round loop. Issues alpha parallel RPCs per round and never
/// starts round n+1 before round n fully resolves; a timed-out
/// contact is recorded against the routing table but does not abort
/// the lookup. Terminates when a round yields nothing closer and the
/// k closest are all queried, the shortlist is exhausted, or the
/// hop/time budget runs out.
async fn run(node: &Arc<DhtNode>, target: Kuid, want_value: bool) -> Result<Outcome, DhtError> {
    let config = &node.config;
    let seeds = node.table.lock().get_closest(&target, config.k);
    let mut shortlist = Shortlist::new(target, seeds);
    let deadline = Instant::now() + config.lookup_timeout;
    let mut hops = 0;

    loop {
        if hops >= config.lookup_hop_limit || Instant::now() >= deadline {
            debug!(%target, hops, "lookup budget exhausted");
            break;
        }

        let batch = shortlist.next_batch(config.alpha);
        if batch.is_empty() {
            break;
        }
        let best_before = shortlist.best_dist();

        let responses = join_all(batch.into_iter().map(|contact| async move {
            let body = if want_value {
                Body::FindValue { key: target }
            } else {
                Body::FindNode { target }
            };
            let msg = node.new_message(body);
            let result = node
                .rpc
                .request(contact.addr, msg, config.request_timeout)
                .await;
            (contact, result)
        }))
        .await;

        let mut progressed = false;
        for (contact, result) in responses {
            let msg = match result {
                Ok(msg) => msg,
                Err(e) => {
                    trace!(node = %contact.id, "lookup query failed: {e}");
                    node.note_failure(&contact.id);
                    continue;
                }
            };

            if msg.sender.id == *node.local_id() {
                node.flag_collision(&contact.addr);
                return Err(DhtError::CollisionDetected);
            }
            node.offer_alive(&msg.sender, contact.addr);

            let (token, contacts, values) = match msg.body {
                Body::FindNodeAck { token, contacts } => (token, contacts, Vec::new()),
                Body::FindValueAck {
                    token,
                    contacts,
                    values,
                } => (token, contacts, values),
                _ => continue,
            };
            if want_value && !values.is_empty() {
                // Responders seen so far minus the holder itself.
                let lacked = shortlist.closest_responded(config.k);
                cache_along_path(node, &values, &lacked);
                return Ok(Outcome::Value(ValueOutcome::Found { values, lacked }));
            }
            shortlist.record_response(&contact.id, token);

            for found in contacts {
                if found.id == *node.local_id() {
                    continue;
                }
                if let Err(e) = node.check_addr(found.addr) {
                    trace!(node = %found.id, "discarding contact: {e}");
                    continue;
                }
                node.offer_contact(found.clone());
                let closer = best_before.map_or(true, |best| found.id.distance(&target) < best);
                if shortlist.merge(found) && closer {
                    progressed = true;
                }
            }
        }

        hops += 1;
        if !progressed && shortlist.closest_all_queried(config.k) {
            break;
        }
    }

    Ok(Outcome::Nodes(shortlist.closest_responded(config.k)))
}

/// After a successful value lookup, store the value onto the closest
/// responder that did not have it, so repeat lookups terminate one
/// hop earlier. Best effort.
fn cache_along_path(node: &Arc<DhtNode>, values: &[DhtValue], lacked: &[(Contact, Bytes)]) {
    let Some((contact, token)) = lacked.first().cloned() else {
        return;
    };
    let msg = node.new_message(Body::Store {
        token,
        values: values.to_vec(),
    });
    let node = Arc::clone(node);
    tokio::spawn(async move {
        let _ = node
            .rpc
            .request(contact.addr, msg, node.config.request_timeout)
            .await;
    });
}
