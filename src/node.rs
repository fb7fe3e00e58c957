use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::bootstrap::{self, BootstrapResult};
use crate::config::NodeConfig;
use crate::contact::Contact;
use crate::error::DhtError;
use crate::kuid::Kuid;
use crate::lookup::{self, ValueOutcome};
use crate::message::{
    Body, DhtValue, Message, Reader, StatsKind, StoreStatus, MAX_WIRE_VALUE_SIZE,
};
use crate::routing::RouteTable;
use crate::rpc::Rpc;
use crate::store::{self, Database, StoreResult};
use crate::token::TokenManager;

const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// A DHT node: one UDP socket, a routing table, a local value store
/// and the machinery to keep them fresh.
///
/// # Examples
///
/// ```no_run
/// use rkad::{DhtNode, NodeConfig};
///
/// # async fn example() -> Result<(), rkad::DhtError> {
/// let node = DhtNode::bind("0.0.0.0:7878".parse().unwrap(), NodeConfig::default()).await?;
/// tokio::spawn(node.clone().run());
///
/// let seeds = vec!["203.0.113.7:7878".parse().unwrap()];
/// let result = node.bootstrap(&seeds).await?;
/// println!("joined, {} seeds were dead", result.failed_seeds.len());
/// # Ok(())
/// # }
/// ```
pub struct DhtNode {
    pub(crate) config: NodeConfig,
    local_id: Kuid,
    local_addr: SocketAddr,
    external: RwLock<Option<SocketAddr>>,
    socket: Arc<UdpSocket>,
    pub(crate) rpc: Rpc,
    pub(crate) table: Mutex<RouteTable>,
    pub(crate) db: Mutex<Database>,
    tokens: TokenManager,
    ready: AtomicBool,
    collision: AtomicBool,
    closed: AtomicBool,
    publishing: AtomicBool,
    refreshing: AtomicBool,
    shutdown: Notify,
}

impl DhtNode {
    pub async fn bind(bind_addr: SocketAddr, config: NodeConfig) -> Result<Arc<Self>, DhtError> {
        // A value longer than the wire's length prefix would round-trip
        // lossily, so the configured bound never exceeds it.
        let mut config = config;
        config.max_value_size = config.max_value_size.min(MAX_WIRE_VALUE_SIZE);

        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let local_addr = socket.local_addr()?;
        let local_id = config.local_id.unwrap_or_else(Kuid::random);

        info!(%local_addr, id = %local_id, "dht node bound");

        Ok(Arc::new(Self {
            local_id,
            local_addr,
            external: RwLock::new(None),
            rpc: Rpc::new(Arc::clone(&socket), config.max_pending),
            socket,
            table: Mutex::new(RouteTable::new(
                local_id,
                config.k,
                config.bucket_cache_size,
                config.max_failures,
            )),
            db: Mutex::new(Database::new(
                config.max_value_size,
                config.max_values_per_key,
                config.max_values,
            )),
            tokens: TokenManager::new(),
            ready: AtomicBool::new(false),
            collision: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            publishing: AtomicBool::new(false),
            refreshing: AtomicBool::new(false),
            shutdown: Notify::new(),
            config,
        }))
    }

    pub fn local_id(&self) -> &Kuid {
        &self.local_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Our address as other nodes see it, learned from PONGs.
    pub fn external_addr(&self) -> Option<SocketAddr> {
        *self.external.read()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Whether a remote node was ever seen claiming our id. Once set
    /// this stays set; the operator is expected to regenerate the
    /// local id and restart.
    pub fn id_collision(&self) -> bool {
        self.collision.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// The contact other nodes should route back to: the external
    /// address once a PONG taught us one, the bind address before.
    pub(crate) fn local_contact(&self) -> Contact {
        let addr = self.external_addr().unwrap_or(self.local_addr);
        let mut contact = Contact::new(self.local_id, addr);
        contact.vendor = self.config.vendor;
        contact.version = self.config.version;
        contact.instance_id = self.config.instance_id;
        contact
    }

    pub(crate) fn new_message(&self, body: Body) -> Message {
        Message::new(self.local_contact(), body)
    }

    /// Address policy applied before any network I/O. Unspecified,
    /// multicast and zero-port addresses are always rejected;
    /// loopback/private/link-local only pass when the config allows
    /// them.
    pub(crate) fn check_addr(&self, addr: SocketAddr) -> Result<(), DhtError> {
        let ip = addr.ip();
        if addr.port() == 0 || ip.is_unspecified() || ip.is_multicast() {
            return Err(DhtError::IllegalAddress(addr));
        }
        if !self.config.allow_private_addresses {
            let private = match ip {
                IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
                IpAddr::V6(v6) => v6.is_loopback(),
            };
            if private {
                return Err(DhtError::IllegalAddress(addr));
            }
        }
        Ok(())
    }

    /// A sender that just answered us: fold it into the table as
    /// alive, routed at the address the datagram came from.
    pub(crate) fn offer_alive(&self, sender: &Contact, from: SocketAddr) {
        if sender.id == self.local_id {
            return;
        }
        let mut contact = sender.clone();
        contact.addr = from;
        contact.touch();
        self.table.lock().add(contact);
    }

    /// A contact merely heard about, liveness unknown.
    pub(crate) fn offer_contact(&self, contact: Contact) {
        if contact.id == self.local_id {
            return;
        }
        self.table.lock().add(contact);
    }

    pub(crate) fn note_failure(&self, id: &Kuid) {
        self.table.lock().handle_failure(id);
    }

    pub(crate) fn flag_collision(&self, addr: &SocketAddr) {
        if !self.collision.swap(true, Ordering::SeqCst) {
            warn!(%addr, "remote node claims our id; the local id should be regenerated");
        }
    }

    /// Ping an address and return the responding contact. Also
    /// records the external address the responder observed for us.
    pub async fn ping(&self, addr: SocketAddr) -> Result<Contact, DhtError> {
        self.check_addr(addr)?;

        let msg = self.new_message(Body::Ping);
        let response = self
            .rpc
            .request(addr, msg, self.config.request_timeout)
            .await?;

        if response.sender.id == self.local_id {
            self.flag_collision(&addr);
            return Err(DhtError::CollisionDetected);
        }

        match response.body {
            Body::Pong {
                external_addr,
                estimated_size,
            } => {
                trace!(%addr, %external_addr, estimated_size, "pong");
                *self.external.write() = Some(external_addr);
                self.offer_alive(&response.sender, addr);

                let mut contact = response.sender;
                contact.addr = addr;
                contact.touch();
                Ok(contact)
            }
            _ => Err(DhtError::Malformed("unexpected response to ping".into())),
        }
    }

    /// Join the network through the given seed addresses, or through
    /// a previously restored routing table when `seeds` is empty.
    pub async fn bootstrap(
        self: &Arc<Self>,
        seeds: &[SocketAddr],
    ) -> Result<BootstrapResult, DhtError> {
        bootstrap::bootstrap(self, seeds).await
    }

    /// Look a value up, checking the local store before the network.
    pub async fn get(self: &Arc<Self>, key: Kuid) -> Result<Vec<DhtValue>, DhtError> {
        let local = self.db.lock().get(&key);
        if !local.is_empty() {
            return Ok(local);
        }

        match lookup::find_value(self, key).await? {
            ValueOutcome::Found { values, .. } => Ok(values),
            ValueOutcome::NotFound { .. } => Err(DhtError::NotFound),
        }
    }

    /// Publish a value: store it locally, then replicate it onto the
    /// k closest nodes. The periodic publisher keeps it alive from
    /// then on.
    pub async fn put(self: &Arc<Self>, key: Kuid, value: Bytes) -> Result<StoreResult, DhtError> {
        if self.is_closed() {
            return Err(DhtError::Shutdown);
        }
        if value.is_empty() || value.len() > self.config.max_value_size {
            return Err(DhtError::StoreRejected);
        }

        let dht_value = DhtValue {
            key,
            originator: self.local_contact(),
            value,
        };
        // The publisher only re-stores what the local database holds,
        // so a local rejection must fail the put.
        if self.db.lock().insert(dht_value.clone(), true) == StoreStatus::Rejected {
            return Err(DhtError::StoreRejected);
        }

        let result = store::store_value(self, dht_value).await?;
        self.db
            .lock()
            .mark_published(&key, &self.local_id, result.accepted.len());
        Ok(result)
    }

    /// Stop the read loop and fail all outstanding requests. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ready.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
        self.rpc.clear();
        info!("dht node closed");
    }

    pub fn save_route_table(&self, path: &Path) -> Result<(), DhtError> {
        let snapshot = self.table.lock().snapshot();
        std::fs::write(path, &snapshot)?;
        Ok(())
    }

    /// Warm-start from a snapshot. A snapshot saved under the same
    /// local id replaces the table wholesale; one saved under another
    /// id only contributes its contacts. Returns how many contacts
    /// came back.
    pub fn load_route_table(&self, path: &Path) -> Result<usize, DhtError> {
        let data = std::fs::read(path)?;
        let restored = RouteTable::restore(
            &data,
            self.config.k,
            self.config.bucket_cache_size,
            self.config.max_failures,
        )?;

        let mut table = self.table.lock();
        if restored.local_id() == &self.local_id {
            let count = restored.len();
            *table = restored;
            Ok(count)
        } else {
            let mut count = 0;
            for contact in restored.contacts() {
                if table.add(contact) {
                    count += 1;
                }
            }
            Ok(count)
        }
    }

    /// The local id recorded in a routing-table snapshot, so a caller
    /// can resume the same identity via `NodeConfig::local_id`.
    pub fn stored_id(path: &Path) -> Result<Kuid, DhtError> {
        let data = std::fs::read(path)?;
        let mut r = Reader::new(&data);
        let _version = r.u8("snapshot version")?;
        r.kuid("local id")
    }

    /// The read loop plus the periodic timers. Spawn this right after
    /// binding; every other method assumes it is running.
    pub async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut rotate = tokio::time::interval(self.config.token_rotation);
        let mut refresh = tokio::time::interval(self.config.bucket_refresh_interval);
        let mut sweep = tokio::time::interval(self.config.sweep_interval);

        rotate.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // Consume the immediate first tick of each interval.
        rotate.tick().await;
        refresh.tick().await;
        sweep.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((n, from)) => match Message::parse(&buf[..n]) {
                        Ok(msg) => self.handle_datagram(msg, from).await,
                        Err(e) => debug!(%from, "dropping malformed datagram: {e}"),
                    },
                    Err(e) => warn!("socket receive error: {e}"),
                },
                _ = rotate.tick() => self.tokens.rotate(),
                _ = refresh.tick() => {
                    // Lookups await responses this loop delivers, so
                    // maintenance runs off-loop.
                    if !self.refreshing.swap(true, Ordering::SeqCst) {
                        let node = Arc::clone(&self);
                        tokio::spawn(async move {
                            node.refresh_buckets().await;
                            node.refreshing.store(false, Ordering::SeqCst);
                        });
                    }
                },
                _ = sweep.tick() => {
                    self.expire_values();
                    if !self.publishing.swap(true, Ordering::SeqCst) {
                        let node = Arc::clone(&self);
                        tokio::spawn(async move {
                            store::republish(&node).await;
                            node.publishing.store(false, Ordering::SeqCst);
                        });
                    }
                },
            }
        }

        self.rpc.clear();
        debug!("read loop stopped");
    }

    async fn handle_datagram(self: &Arc<Self>, msg: Message, from: SocketAddr) {
        if msg.is_response() {
            // Delivered even when the sender claims our own id, so
            // the waiting requester can surface CollisionDetected.
            self.rpc.resolve(msg, from);
            return;
        }

        if msg.sender.id == self.local_id {
            self.flag_collision(&from);
            return;
        }

        // An unsolicited request proves nothing about the sender; it
        // goes in as unknown, routed at the observed source address.
        // Only a matched response earns the alive state.
        let mut contact = msg.sender.clone();
        contact.addr = from;
        self.offer_contact(contact);
        self.handle_request(msg, from).await;
    }

    async fn handle_request(&self, msg: Message, from: SocketAddr) {
        let body = match msg.body {
            Body::Ping => Body::Pong {
                external_addr: from,
                estimated_size: self.size_estimate(),
            },
            Body::FindNode { target } => Body::FindNodeAck {
                token: self.tokens.issue(&from),
                contacts: self.table.lock().get_closest(&target, self.config.k),
            },
            Body::FindValue { key } => {
                let values = self.db.lock().get(&key);
                let token = self.tokens.issue(&from);
                if values.is_empty() {
                    Body::FindValueAck {
                        token,
                        contacts: self.table.lock().get_closest(&key, self.config.k),
                        values: Vec::new(),
                    }
                } else {
                    Body::FindValueAck {
                        token,
                        contacts: Vec::new(),
                        values,
                    }
                }
            }
            Body::Store { token, values } => {
                let token_ok = self.tokens.validate(&from, &token);
                if !token_ok {
                    debug!(%from, "store with bad token rejected");
                }
                let statuses = values
                    .into_iter()
                    .map(|value| {
                        let key = value.key;
                        let status = if token_ok {
                            self.db.lock().insert(value, false)
                        } else {
                            StoreStatus::Rejected
                        };
                        (key, status)
                    })
                    .collect();
                Body::StoreAck { statuses }
            }
            Body::Stats { kind } => Body::StatsAck {
                report: self.stats_report(kind),
            },
            // Response kinds never reach here.
            _ => return,
        };

        let reply = Message::reply(msg.id, self.local_contact(), body);
        self.rpc.send(from, reply).await;
    }

    async fn refresh_buckets(self: &Arc<Self>) {
        let targets = self
            .table
            .lock()
            .refresh_targets(self.config.bucket_refresh_interval);
        if targets.is_empty() {
            return;
        }
        debug!(count = targets.len(), "refreshing stale buckets");

        for target in targets {
            if self.is_closed() {
                return;
            }
            let _ = lookup::find_node(self, target).await;
        }
    }

    /// Drop expired remote values. The TTL shrinks with the number of
    /// known nodes closer to the key: nodes on the edge of a key's
    /// neighborhood shed it quickly, nodes at its center keep it for
    /// the full expiration window.
    fn expire_values(&self) {
        let keys = self.db.lock().keys();
        if keys.is_empty() {
            return;
        }

        let ttls: HashMap<Kuid, Duration> = {
            let table = self.table.lock();
            keys.into_iter()
                .map(|key| {
                    let closer = table.closer_count(&key) as u32;
                    (key, self.config.value_expiration / (1 + closer))
                })
                .collect()
        };

        let removed = self.db.lock().expire(&ttls);
        if removed > 0 {
            debug!(removed, "expired values evicted");
        }
    }

    /// Rough network size from the density of our own neighborhood:
    /// if the farthest of our k closest contacts shares `d` leading
    /// bits with us, each of the 2^d id prefixes holds about that
    /// many nodes. Diagnostic only, carried in PONGs.
    fn size_estimate(&self) -> u32 {
        let table = self.table.lock();
        let closest = table.get_closest(&self.local_id, self.config.k);
        let Some(farthest) = closest.last() else {
            return 1;
        };
        let depth = self.local_id.bucket_index(&farthest.id).min(24);
        let estimate = (closest.len() as u64) << depth;
        estimate.min(u32::MAX as u64) as u32
    }

    fn stats_report(&self, kind: StatsKind) -> String {
        match kind {
            StatsKind::Routing => {
                let estimated = self.size_estimate();
                let table = self.table.lock();
                format!(
                    "local: {}\nbuckets: {}\ncontacts: {}\nalive: {}\nestimated size: {}",
                    self.local_id,
                    table.bucket_count(),
                    table.len(),
                    table.alive_count(),
                    estimated,
                )
            }
            StatsKind::Database => {
                let db = self.db.lock();
                format!(
                    "keys: {}\nvalues: {}\noutstanding rpcs: {}",
                    db.key_count(),
                    db.value_count(),
                    self.rpc.outstanding(),
                )
            }
        }
    }
}
