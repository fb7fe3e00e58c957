use std::net::SocketAddr;

use bytes::Bytes;
use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use tracing::debug;

const TOKEN_LENGTH: usize = 8;

struct Secrets {
    current: [u8; 16],
    previous: [u8; 16],
}

/// Issues and checks the short-lived tokens that gate STORE requests.
/// A token is a truncated hash over a rotating secret and the
/// requester's address, so it proves the requester received our
/// FIND_NODE/FIND_VALUE answer at that address. Tokens issued under
/// the previous secret stay valid for one rotation period.
pub struct TokenManager {
    secrets: RwLock<Secrets>,
}

impl TokenManager {
    pub fn new() -> Self {
        Self {
            secrets: RwLock::new(Secrets {
                current: rand::random(),
                previous: rand::random(),
            }),
        }
    }

    pub fn rotate(&self) {
        let mut secrets = self.secrets.write();
        secrets.previous = secrets.current;
        secrets.current = rand::random();
        debug!("store token secret rotated");
    }

    pub fn issue(&self, addr: &SocketAddr) -> Bytes {
        hash_token(&self.secrets.read().current, addr)
    }

    pub fn validate(&self, addr: &SocketAddr, token: &[u8]) -> bool {
        let secrets = self.secrets.read();

        if hash_token(&secrets.current, addr) == token {
            return true;
        }
        hash_token(&secrets.previous, addr) == token
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_token(secret: &[u8; 16], addr: &SocketAddr) -> Bytes {
    let mut hasher = Sha1::new();
    hasher.update(secret);
    match addr.ip() {
        std::net::IpAddr::V4(ip) => hasher.update(ip.octets()),
        std::net::IpAddr::V6(ip) => hasher.update(ip.octets()),
    }
    hasher.update(addr.port().to_be_bytes());

    let digest = hasher.finalize();
    Bytes::copy_from_slice(&digest[..TOKEN_LENGTH])
}
