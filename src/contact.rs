use std::net::SocketAddr;
use std::time::Instant;

use crate::kuid::Kuid;

/// Liveness of a remote peer. Unknown until it answers something,
/// Alive on any valid response, Failed past the failure threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactState {
    Unknown,
    Alive,
    Failed,
}

/// A remote peer as seen by the routing table. Two contacts with the
/// same id are the same logical peer; the address may change across
/// sessions.
#[derive(Debug, Clone)]
pub struct Contact {
    pub id: Kuid,
    pub addr: SocketAddr,
    pub vendor: u32,
    pub version: u32,
    pub instance_id: u8,
    pub state: ContactState,
    pub last_seen: Instant,
    pub failures: u8,
}

impl Contact {
    pub fn new(id: Kuid, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            vendor: 0,
            version: 0,
            instance_id: 0,
            state: ContactState::Unknown,
            last_seen: Instant::now(),
            failures: 0,
        }
    }

    pub fn touch(&mut self) {
        self.state = ContactState::Alive;
        self.last_seen = Instant::now();
        self.failures = 0;
    }

    pub fn fail(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn is_alive(&self) -> bool {
        self.state == ContactState::Alive
    }

    pub fn is_dead(&self, max_failures: u8) -> bool {
        self.failures >= max_failures
    }

    /// Fold a fresher sighting of the same peer into this record.
    /// The id never changes; address, vendor bits and instance id do.
    /// A higher instance id means the peer restarted, so its previous
    /// address is stale even if the new one looks older.
    pub fn merge(&mut self, other: &Contact) {
        debug_assert_eq!(self.id, other.id);
        if other.instance_id >= self.instance_id {
            self.addr = other.addr;
            self.instance_id = other.instance_id;
        }
        self.vendor = other.vendor;
        self.version = other.version;
    }
}
