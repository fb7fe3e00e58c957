use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::DhtError;
use crate::kuid::Kuid;
use crate::message::Message;

struct Pending {
    dest: SocketAddr,
    tx: oneshot::Sender<Message>,
}

/// Matches responses to outstanding requests over the shared socket.
/// One pending entry per message id; ids are random 160-bit values so
/// collisions under load are not a concern. The table is bounded and
/// no request is ever retried here — a timeout goes back to the
/// caller, which picks a different node instead.
pub struct Rpc {
    socket: Arc<UdpSocket>,
    pending: Mutex<HashMap<Kuid, Pending>>,
    max_pending: usize,
}

impl Rpc {
    pub fn new(socket: Arc<UdpSocket>, max_pending: usize) -> Self {
        Self {
            socket,
            pending: Mutex::new(HashMap::new()),
            max_pending,
        }
    }

    /// Send a request and await the matching response. The pending
    /// entry is removed on every exit path; dropping the receiver on
    /// timeout also drops any late response.
    pub async fn request(
        &self,
        dest: SocketAddr,
        msg: Message,
        wait: Duration,
    ) -> Result<Message, DhtError> {
        let id = msg.id;
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock();
            if pending.len() >= self.max_pending {
                return Err(DhtError::PendingLimit);
            }
            pending.insert(id, Pending { dest, tx });
        }

        let data = msg.encode();
        if let Err(e) = self.socket.send_to(&data, dest).await {
            self.pending.lock().remove(&id);
            return Err(e.into());
        }
        trace!(%id, %dest, "request sent");

        let result = timeout(wait, rx).await;
        self.pending.lock().remove(&id);

        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(DhtError::Shutdown),
            Err(_) => Err(DhtError::Timeout),
        }
    }

    /// Deliver an inbound response. Returns false when nothing was
    /// waiting for it, or when it came from an address other than the
    /// one the request went to.
    pub fn resolve(&self, msg: Message, from: SocketAddr) -> bool {
        let mut pending = self.pending.lock();

        match pending.get(&msg.id) {
            Some(p) if p.dest == from => {
                if let Some(p) = pending.remove(&msg.id) {
                    return p.tx.send(msg).is_ok();
                }
                false
            }
            Some(p) => {
                debug!(id = %msg.id, expected = %p.dest, got = %from,
                    "response from unexpected address dropped");
                false
            }
            None => {
                debug!(id = %msg.id, %from, "unmatched response dropped");
                false
            }
        }
    }

    /// Fire-and-forget, used for replies on the server side.
    pub async fn send(&self, dest: SocketAddr, msg: Message) {
        let data = msg.encode();
        if let Err(e) = self.socket.send_to(&data, dest).await {
            debug!(%dest, "send failed: {e}");
        }
    }

    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drop every pending entry; waiting callers resolve with
    /// `Shutdown`.
    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}
