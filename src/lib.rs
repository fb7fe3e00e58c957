//! rkad - an embeddable Kademlia DHT node
//!
//! This library implements the Kademlia protocol over UDP: a 160-bit
//! XOR identifier space, a trie of k-buckets, iterative lookups,
//! token-guarded stores and periodic republish/expiry maintenance.
//!
//! # Overview
//!
//! - [`Kuid`] - 160-bit identifiers under the XOR metric
//! - [`Contact`] - remote peers and their liveness state
//! - [`RouteTable`] - the trie-of-k-buckets routing table
//! - [`Message`] - the wire protocol and its codec
//! - [`DhtNode`] - the node itself: bootstrap, get, put, ping
//!
//! # Examples
//!
//! ```no_run
//! use rkad::{DhtNode, Kuid, NodeConfig};
//!
//! # async fn example() -> Result<(), rkad::DhtError> {
//! let node = DhtNode::bind("0.0.0.0:7878".parse().unwrap(), NodeConfig::default()).await?;
//! tokio::spawn(node.clone().run());
//!
//! node.bootstrap(&["203.0.113.7:7878".parse().unwrap()]).await?;
//!
//! let key = Kuid::random();
//! node.put(key, "hello".into()).await?;
//! let values = node.get(key).await?;
//! assert_eq!(values[0].value, "hello");
//! # Ok(())
//! # }
//! ```

mod bootstrap;
mod config;
mod contact;
mod error;
mod kuid;
mod lookup;
mod message;
mod node;
mod routing;
mod rpc;
mod store;
mod token;

pub use bootstrap::BootstrapResult;
pub use config::NodeConfig;
pub use contact::{Contact, ContactState};
pub use error::DhtError;
pub use kuid::{Kuid, KUID_BITS, KUID_LENGTH};
pub use message::{Body, DhtValue, Message, StatsKind, StoreStatus};
pub use node::DhtNode;
pub use routing::{Bucket, RouteTable};
pub use store::StoreResult;

#[cfg(test)]
mod tests;
