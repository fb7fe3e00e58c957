use std::collections::VecDeque;
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};

use crate::contact::{Contact, ContactState};
use crate::error::DhtError;
use crate::kuid::{Kuid, KUID_BITS, KUID_LENGTH};
use crate::message::{put_contact, Reader};

const SNAPSHOT_VERSION: u8 = 1;

/// One k-bucket. Owns the range of ids whose first `depth` bits equal
/// `prefix`; contacts are kept least-recently-seen at the front.
#[derive(Debug)]
pub struct Bucket {
    prefix: Kuid,
    depth: usize,
    contacts: VecDeque<Contact>,
    cache: VecDeque<Contact>,
    last_refreshed: Instant,
}

impl Bucket {
    fn new(prefix: Kuid, depth: usize) -> Self {
        Self {
            prefix,
            depth,
            contacts: VecDeque::new(),
            cache: VecDeque::new(),
            last_refreshed: Instant::now(),
        }
    }

    pub fn prefix(&self) -> &Kuid {
        &self.prefix
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    /// Whether `id` falls in this bucket's range: its first `depth`
    /// bits match the prefix.
    pub fn contains(&self, id: &Kuid) -> bool {
        let full_bytes = self.depth / 8;
        if id.as_bytes()[..full_bytes] != self.prefix.as_bytes()[..full_bytes] {
            return false;
        }
        let rem = self.depth % 8;
        if rem == 0 {
            return true;
        }
        let mask = 0xFFu8 << (8 - rem);
        (id.as_bytes()[full_bytes] & mask) == (self.prefix.as_bytes()[full_bytes] & mask)
    }

    fn cache_insert(&mut self, contact: Contact, cache_size: usize) {
        if let Some(pos) = self.cache.iter().position(|c| c.id == contact.id) {
            self.cache.remove(pos);
        }
        self.cache.push_back(contact);
        while self.cache.len() > cache_size {
            self.cache.pop_front();
        }
    }
}

/// The set of buckets partitioning KUID space, plus the local id.
/// Buckets live in a vec and are addressed by index; splits replace
/// one slot and append, so there are no parent/child pointers. All
/// mutation goes through these methods; the caller serializes access
/// with a single lock.
pub struct RouteTable {
    local_id: Kuid,
    k: usize,
    cache_size: usize,
    max_failures: u8,
    buckets: Vec<Bucket>,
}

impl RouteTable {
    pub fn new(local_id: Kuid, k: usize, cache_size: usize, max_failures: u8) -> Self {
        Self {
            local_id,
            k,
            cache_size,
            max_failures,
            buckets: vec![Bucket::new(Kuid([0u8; KUID_LENGTH]), 0)],
        }
    }

    pub fn local_id(&self) -> &Kuid {
        &self.local_id
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn buckets(&self) -> impl Iterator<Item = &Bucket> {
        self.buckets.iter()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.contacts.is_empty())
    }

    fn bucket_of(&self, id: &Kuid) -> usize {
        // The buckets partition the id space, so exactly one matches.
        self.buckets
            .iter()
            .position(|b| b.contains(id))
            .unwrap_or(0)
    }

    /// Offer a contact to the table. An existing entry with the same
    /// id is updated in place and moved to the most-recently-seen
    /// position. A full bucket covering the local node's range splits;
    /// any other full bucket sends the contact to its replacement
    /// cache, replacing the least-recently-seen entry only if that
    /// entry is already past the failure threshold. Returns whether
    /// the contact landed among the live entries.
    pub fn add(&mut self, contact: Contact) -> bool {
        if contact.id == self.local_id {
            return false;
        }

        loop {
            let idx = self.bucket_of(&contact.id);
            let bucket = &mut self.buckets[idx];

            if let Some(pos) = bucket.contacts.iter().position(|c| c.id == contact.id) {
                let mut existing = match bucket.contacts.remove(pos) {
                    Some(c) => c,
                    None => return false,
                };
                existing.merge(&contact);
                if contact.is_alive() {
                    existing.touch();
                }
                bucket.contacts.push_back(existing);
                return true;
            }

            if bucket.contacts.len() < self.k {
                bucket.contacts.push_back(contact);
                return true;
            }

            if bucket.contains(&self.local_id) && bucket.depth < KUID_BITS - 1 {
                self.split(idx);
                continue;
            }

            let evict = bucket
                .contacts
                .front()
                .is_some_and(|c| c.is_dead(self.max_failures));
            if evict {
                bucket.contacts.pop_front();
                bucket.contacts.push_back(contact);
                return true;
            }

            let cache_size = self.cache_size;
            bucket.cache_insert(contact, cache_size);
            return false;
        }
    }

    /// Split bucket `idx` into two children one bit deeper,
    /// redistributing its contacts and cache by the next bit.
    fn split(&mut self, idx: usize) {
        let bucket = &mut self.buckets[idx];
        let depth = bucket.depth;

        let zero_prefix = bucket.prefix;
        let mut one_prefix = bucket.prefix;
        one_prefix.0[depth / 8] |= 0x80 >> (depth % 8);

        let mut zero = Bucket::new(zero_prefix, depth + 1);
        let mut one = Bucket::new(one_prefix, depth + 1);

        for contact in bucket.contacts.drain(..) {
            if contact.id.bit(depth) {
                one.contacts.push_back(contact);
            } else {
                zero.contacts.push_back(contact);
            }
        }
        for contact in bucket.cache.drain(..) {
            if contact.id.bit(depth) {
                one.cache.push_back(contact);
            } else {
                zero.cache.push_back(contact);
            }
        }

        self.buckets[idx] = zero;
        self.buckets.push(one);
    }

    pub fn contact(&self, id: &Kuid) -> Option<&Contact> {
        let idx = self.bucket_of(id);
        self.buckets[idx].contacts.iter().find(|c| &c.id == id)
    }

    /// Record a failed RPC against a contact. Past the threshold the
    /// contact is marked failed and evicted, with a replacement-cache
    /// entry promoted in its place.
    pub fn handle_failure(&mut self, id: &Kuid) {
        let max_failures = self.max_failures;
        let idx = self.bucket_of(id);
        let bucket = &mut self.buckets[idx];

        let Some(pos) = bucket.contacts.iter().position(|c| &c.id == id) else {
            return;
        };

        let contact = &mut bucket.contacts[pos];
        contact.fail();
        if contact.is_dead(max_failures) {
            contact.state = ContactState::Failed;
            bucket.contacts.remove(pos);
            if let Some(replacement) = bucket.cache.pop_front() {
                bucket.contacts.push_back(replacement);
            }
        }
    }

    /// Up to `n` non-failed contacts ordered by ascending XOR
    /// distance to `key`, drawn from the whole table. Correct even
    /// while buckets are unevenly populated.
    pub fn get_closest(&self, key: &Kuid, n: usize) -> Vec<Contact> {
        let mut contacts: Vec<(Contact, [u8; KUID_LENGTH])> = Vec::new();

        for bucket in &self.buckets {
            for contact in &bucket.contacts {
                if contact.state != ContactState::Failed {
                    let dist = contact.id.distance(key);
                    contacts.push((contact.clone(), dist));
                }
            }
        }

        contacts.sort_by(|a, b| a.1.cmp(&b.1));
        contacts.truncate(n);
        contacts.into_iter().map(|(c, _)| c).collect()
    }

    /// How many known contacts sit closer to `key` than the local
    /// node does. Drives the value-expiration heuristic.
    pub fn closer_count(&self, key: &Kuid) -> usize {
        let own_dist = self.local_id.distance(key);
        self.buckets
            .iter()
            .flat_map(|b| b.contacts.iter())
            .filter(|c| c.id.distance(key) < own_dist)
            .count()
            .min(self.k)
    }

    /// Drop every contact that has failed at least once, refilling
    /// from the replacement caches. Used after bootstrap to shed
    /// stale entries from a warm-started table.
    pub fn purge_failed(&mut self) -> usize {
        let mut removed = 0;
        for bucket in &mut self.buckets {
            let before = bucket.contacts.len();
            bucket.contacts.retain(|c| c.failures == 0);
            removed += before - bucket.contacts.len();

            while bucket.contacts.len() < self.k {
                match bucket.cache.pop_front() {
                    Some(replacement) => bucket.contacts.push_back(replacement),
                    None => break,
                }
            }
        }
        removed
    }

    /// Random targets inside buckets that have not been refreshed for
    /// `interval`. The buckets are stamped as refreshed so a lookup
    /// failure does not make them fire again immediately.
    pub fn refresh_targets(&mut self, interval: std::time::Duration) -> Vec<Kuid> {
        let now = Instant::now();
        let mut targets = Vec::new();
        for bucket in &mut self.buckets {
            if now.duration_since(bucket.last_refreshed) >= interval {
                bucket.last_refreshed = now;
                targets.push(Kuid::random_within(&bucket.prefix, bucket.depth));
            }
        }
        targets
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|b| b.contacts.iter().cloned())
            .collect()
    }

    pub fn alive_count(&self) -> usize {
        self.buckets
            .iter()
            .flat_map(|b| b.contacts.iter())
            .filter(|c| c.is_alive())
            .count()
    }

    /// Serialize identity, bucket structure and contact metadata.
    /// Liveness state and timers are deliberately not carried; every
    /// restored contact starts out unknown.
    pub fn snapshot(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(SNAPSHOT_VERSION);
        buf.put_slice(self.local_id.as_bytes());
        buf.put_u16(self.buckets.len().min(u16::MAX as usize) as u16);

        for bucket in self.buckets.iter().take(u16::MAX as usize) {
            buf.put_u8(bucket.depth.min(u8::MAX as usize) as u8);
            buf.put_slice(bucket.prefix.as_bytes());
            buf.put_u8(bucket.contacts.len().min(u8::MAX as usize) as u8);
            for contact in bucket.contacts.iter().take(u8::MAX as usize) {
                put_contact(&mut buf, contact);
            }
        }

        buf.freeze()
    }

    /// Rebuild a table from a snapshot. The restored table keeps the
    /// snapshot's local id, so a node can resume its identity across
    /// restarts.
    pub fn restore(
        data: &[u8],
        k: usize,
        cache_size: usize,
        max_failures: u8,
    ) -> Result<Self, DhtError> {
        let mut r = Reader::new(data);

        let version = r.u8("snapshot version")?;
        if version != SNAPSHOT_VERSION {
            return Err(DhtError::Malformed(format!(
                "unsupported snapshot version: {version}"
            )));
        }

        let local_id = r.kuid("local id")?;
        let bucket_count = r.u16("bucket count")?;

        let mut buckets = Vec::with_capacity(bucket_count as usize);
        for _ in 0..bucket_count {
            let depth = r.u8("bucket depth")? as usize;
            if depth >= KUID_BITS {
                return Err(DhtError::Malformed(format!("bad bucket depth: {depth}")));
            }
            let prefix = r.kuid("bucket prefix")?;
            let mut bucket = Bucket::new(prefix, depth);

            let count = r.u8("contact count")?;
            for _ in 0..count {
                let contact = r.contact()?;
                if bucket.contacts.len() < k && bucket.contains(&contact.id) {
                    bucket.contacts.push_back(contact);
                }
            }
            buckets.push(bucket);
        }

        if buckets.is_empty() {
            return Err(DhtError::Malformed("snapshot has no buckets".into()));
        }

        Ok(Self {
            local_id,
            k,
            cache_size,
            max_failures,
            buckets,
        })
    }
}
