use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::contact::Contact;
use crate::error::DhtError;
use crate::kuid::{Kuid, KUID_LENGTH};

const OP_PING: u8 = 0x01;
const OP_PONG: u8 = 0x02;
const OP_FIND_NODE: u8 = 0x03;
const OP_FIND_NODE_ACK: u8 = 0x04;
const OP_FIND_VALUE: u8 = 0x05;
const OP_FIND_VALUE_ACK: u8 = 0x06;
const OP_STORE: u8 = 0x07;
const OP_STORE_ACK: u8 = 0x08;
const OP_STATS: u8 = 0x09;
const OP_STATS_ACK: u8 = 0x0A;

const ADDR_V4: u8 = 4;
const ADDR_V6: u8 = 6;

/// Largest value payload the wire format can carry; value bytes are
/// length-prefixed with a u16.
pub(crate) const MAX_WIRE_VALUE_SIZE: usize = u16::MAX as usize;

/// Per-value verdict carried in a STORE ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsKind {
    Routing,
    Database,
}

/// A key/value pair on the wire: the key, the contact that originally
/// published it, and the opaque payload.
#[derive(Debug, Clone)]
pub struct DhtValue {
    pub key: Kuid,
    pub originator: Contact,
    pub value: Bytes,
}

/// Every datagram decodes to one of these. Requests and responses are
/// distinguished by the opcode; responses echo the request's message
/// id.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: Kuid,
    pub sender: Contact,
    pub body: Body,
}

#[derive(Debug, Clone)]
pub enum Body {
    Ping,
    /// Carries the address the responder saw the request come from,
    /// which is how nodes behind NAT learn their external address.
    Pong {
        external_addr: SocketAddr,
        estimated_size: u32,
    },
    FindNode {
        target: Kuid,
    },
    FindNodeAck {
        token: Bytes,
        contacts: Vec<Contact>,
    },
    FindValue {
        key: Kuid,
    },
    /// Either the values themselves or, when the responder holds
    /// none, its closest contacts. The token is present either way so
    /// the requester can store back to this node.
    FindValueAck {
        token: Bytes,
        contacts: Vec<Contact>,
        values: Vec<DhtValue>,
    },
    Store {
        token: Bytes,
        values: Vec<DhtValue>,
    },
    StoreAck {
        statuses: Vec<(Kuid, StoreStatus)>,
    },
    Stats {
        kind: StatsKind,
    },
    StatsAck {
        report: String,
    },
}

impl Message {
    pub fn new(sender: Contact, body: Body) -> Self {
        Self {
            id: Kuid::random(),
            sender,
            body,
        }
    }

    /// A response reusing the request's message id.
    pub fn reply(request_id: Kuid, sender: Contact, body: Body) -> Self {
        Self {
            id: request_id,
            sender,
            body,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self.body,
            Body::Pong { .. }
                | Body::FindNodeAck { .. }
                | Body::FindValueAck { .. }
                | Body::StoreAck { .. }
                | Body::StatsAck { .. }
        )
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);

        buf.put_u8(opcode(&self.body));
        buf.put_slice(self.id.as_bytes());
        put_contact(&mut buf, &self.sender);

        match &self.body {
            Body::Ping => {}
            Body::Pong {
                external_addr,
                estimated_size,
            } => {
                put_addr(&mut buf, external_addr);
                buf.put_u32(*estimated_size);
            }
            Body::FindNode { target } => buf.put_slice(target.as_bytes()),
            Body::FindNodeAck { token, contacts } => {
                put_token(&mut buf, token);
                put_contacts(&mut buf, contacts);
            }
            Body::FindValue { key } => buf.put_slice(key.as_bytes()),
            Body::FindValueAck {
                token,
                contacts,
                values,
            } => {
                put_token(&mut buf, token);
                buf.put_u8(if values.is_empty() { 0 } else { 1 });
                if values.is_empty() {
                    put_contacts(&mut buf, contacts);
                } else {
                    put_values(&mut buf, values);
                }
            }
            Body::Store { token, values } => {
                put_token(&mut buf, token);
                put_values(&mut buf, values);
            }
            Body::StoreAck { statuses } => {
                buf.put_u8(statuses.len().min(u8::MAX as usize) as u8);
                for (key, status) in statuses.iter().take(u8::MAX as usize) {
                    buf.put_slice(key.as_bytes());
                    buf.put_u8(match status {
                        StoreStatus::Accepted => 1,
                        StoreStatus::Rejected => 0,
                    });
                }
            }
            Body::Stats { kind } => buf.put_u8(match kind {
                StatsKind::Routing => 0,
                StatsKind::Database => 1,
            }),
            Body::StatsAck { report } => {
                let bytes = report.as_bytes();
                let len = bytes.len().min(u16::MAX as usize);
                buf.put_u16(len as u16);
                buf.put_slice(&bytes[..len]);
            }
        }

        buf.freeze()
    }

    /// Single decode entry point; dispatches on the leading opcode
    /// byte. All fields are fixed-width or length-prefixed and
    /// checked against the remaining input before use.
    pub fn parse(data: &[u8]) -> Result<Self, DhtError> {
        let mut r = Reader::new(data);

        let opcode = r.u8("opcode")?;
        let id = r.kuid("message id")?;
        let sender = r.contact()?;

        let body = match opcode {
            OP_PING => Body::Ping,
            OP_PONG => Body::Pong {
                external_addr: r.addr()?,
                estimated_size: r.u32("estimated size")?,
            },
            OP_FIND_NODE => Body::FindNode {
                target: r.kuid("target")?,
            },
            OP_FIND_NODE_ACK => Body::FindNodeAck {
                token: r.token()?,
                contacts: r.contacts()?,
            },
            OP_FIND_VALUE => Body::FindValue {
                key: r.kuid("key")?,
            },
            OP_FIND_VALUE_ACK => {
                let token = r.token()?;
                let has_values = r.u8("values flag")?;
                match has_values {
                    0 => Body::FindValueAck {
                        token,
                        contacts: r.contacts()?,
                        values: Vec::new(),
                    },
                    1 => Body::FindValueAck {
                        token,
                        contacts: Vec::new(),
                        values: r.values()?,
                    },
                    other => {
                        return Err(DhtError::Malformed(format!(
                            "bad values flag: {other}"
                        )))
                    }
                }
            }
            OP_STORE => Body::Store {
                token: r.token()?,
                values: r.values()?,
            },
            OP_STORE_ACK => {
                let count = r.u8("status count")?;
                let mut statuses = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let key = r.kuid("status key")?;
                    let status = match r.u8("status")? {
                        0 => StoreStatus::Rejected,
                        1 => StoreStatus::Accepted,
                        other => {
                            return Err(DhtError::Malformed(format!(
                                "bad store status: {other}"
                            )))
                        }
                    };
                    statuses.push((key, status));
                }
                Body::StoreAck { statuses }
            }
            OP_STATS => Body::Stats {
                kind: match r.u8("stats kind")? {
                    0 => StatsKind::Routing,
                    1 => StatsKind::Database,
                    other => {
                        return Err(DhtError::Malformed(format!("bad stats kind: {other}")))
                    }
                },
            },
            OP_STATS_ACK => {
                let len = r.u16("report length")? as usize;
                let bytes = r.bytes(len, "report")?;
                Body::StatsAck {
                    report: String::from_utf8_lossy(&bytes).into_owned(),
                }
            }
            other => return Err(DhtError::Malformed(format!("unknown opcode: {other:#x}"))),
        };

        Ok(Self { id, sender, body })
    }
}

fn opcode(body: &Body) -> u8 {
    match body {
        Body::Ping => OP_PING,
        Body::Pong { .. } => OP_PONG,
        Body::FindNode { .. } => OP_FIND_NODE,
        Body::FindNodeAck { .. } => OP_FIND_NODE_ACK,
        Body::FindValue { .. } => OP_FIND_VALUE,
        Body::FindValueAck { .. } => OP_FIND_VALUE_ACK,
        Body::Store { .. } => OP_STORE,
        Body::StoreAck { .. } => OP_STORE_ACK,
        Body::Stats { .. } => OP_STATS,
        Body::StatsAck { .. } => OP_STATS_ACK,
    }
}

pub(crate) fn put_addr(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            buf.put_u8(ADDR_V4);
            buf.put_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            buf.put_u8(ADDR_V6);
            buf.put_slice(&v6.ip().octets());
        }
    }
    buf.put_u16(addr.port());
}

pub(crate) fn put_contact(buf: &mut BytesMut, contact: &Contact) {
    buf.put_slice(contact.id.as_bytes());
    put_addr(buf, &contact.addr);
    buf.put_u32(contact.vendor);
    buf.put_u32(contact.version);
    buf.put_u8(contact.instance_id);
}

fn put_token(buf: &mut BytesMut, token: &Bytes) {
    let len = token.len().min(u8::MAX as usize);
    buf.put_u8(len as u8);
    buf.put_slice(&token[..len]);
}

fn put_contacts(buf: &mut BytesMut, contacts: &[Contact]) {
    buf.put_u8(contacts.len().min(u8::MAX as usize) as u8);
    for contact in contacts.iter().take(u8::MAX as usize) {
        put_contact(buf, contact);
    }
}

fn put_values(buf: &mut BytesMut, values: &[DhtValue]) {
    buf.put_u8(values.len().min(u8::MAX as usize) as u8);
    for value in values.iter().take(u8::MAX as usize) {
        buf.put_slice(value.key.as_bytes());
        put_contact(buf, &value.originator);
        let len = value.value.len().min(u16::MAX as usize);
        buf.put_u16(len as u16);
        buf.put_slice(&value.value[..len]);
    }
}

/// Cursor over untrusted input. Every read checks the remaining
/// length first, so truncated or hostile datagrams fail with
/// `Malformed` instead of panicking.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], DhtError> {
        if self.data.len() - self.pos < n {
            return Err(DhtError::Malformed(format!("truncated {what}")));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self, what: &str) -> Result<u8, DhtError> {
        Ok(self.take(1, what)?[0])
    }

    pub(crate) fn u16(&mut self, what: &str) -> Result<u16, DhtError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self, what: &str) -> Result<u32, DhtError> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn bytes(&mut self, n: usize, what: &str) -> Result<Bytes, DhtError> {
        Ok(Bytes::copy_from_slice(self.take(n, what)?))
    }

    pub(crate) fn kuid(&mut self, what: &str) -> Result<Kuid, DhtError> {
        let b = self.take(KUID_LENGTH, what)?;
        Kuid::from_bytes(b)
    }

    pub(crate) fn addr(&mut self) -> Result<SocketAddr, DhtError> {
        let family = self.u8("address family")?;
        let ip = match family {
            ADDR_V4 => {
                let b = self.take(4, "ipv4 address")?;
                IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
            }
            ADDR_V6 => {
                let b = self.take(16, "ipv6 address")?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(b);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            other => {
                return Err(DhtError::Malformed(format!("bad address family: {other}")))
            }
        };
        let port = self.u16("port")?;
        Ok(SocketAddr::new(ip, port))
    }

    pub(crate) fn contact(&mut self) -> Result<Contact, DhtError> {
        let id = self.kuid("contact id")?;
        let addr = self.addr()?;
        let vendor = self.u32("vendor")?;
        let version = self.u32("version")?;
        let instance_id = self.u8("instance id")?;

        let mut contact = Contact::new(id, addr);
        contact.vendor = vendor;
        contact.version = version;
        contact.instance_id = instance_id;
        Ok(contact)
    }

    fn token(&mut self) -> Result<Bytes, DhtError> {
        let len = self.u8("token length")? as usize;
        self.bytes(len, "token")
    }

    fn contacts(&mut self) -> Result<Vec<Contact>, DhtError> {
        let count = self.u8("contact count")?;
        let mut contacts = Vec::with_capacity(count as usize);
        for _ in 0..count {
            contacts.push(self.contact()?);
        }
        Ok(contacts)
    }

    fn values(&mut self) -> Result<Vec<DhtValue>, DhtError> {
        let count = self.u8("value count")?;
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let key = self.kuid("value key")?;
            let originator = self.contact()?;
            let len = self.u16("value length")? as usize;
            let value = self.bytes(len, "value bytes")?;
            values.push(DhtValue {
                key,
                originator,
                value,
            });
        }
        Ok(values)
    }
}
