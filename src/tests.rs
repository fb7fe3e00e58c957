use super::*;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::lookup;
use crate::store::Database;
use crate::token::TokenManager;

fn addr(last: u8, port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), port)
}

fn kuid_with_first_byte(b: u8) -> Kuid {
    let mut bytes = [0u8; KUID_LENGTH];
    bytes[0] = b;
    Kuid(bytes)
}

// ---- kuid ----

#[test]
fn kuid_distance_laws() {
    let a = Kuid::random();
    let b = Kuid::random();

    assert_eq!(a.distance(&b), b.distance(&a));
    assert_eq!(a.distance(&a), [0u8; KUID_LENGTH]);
    if a.distance(&b) == [0u8; KUID_LENGTH] {
        assert_eq!(a, b);
    }
}

#[test]
fn kuid_bucket_index() {
    let zero = Kuid([0u8; KUID_LENGTH]);
    assert_eq!(zero.bucket_index(&kuid_with_first_byte(0x80)), 0);
    assert_eq!(zero.bucket_index(&kuid_with_first_byte(0x01)), 7);

    let mut other = [0u8; KUID_LENGTH];
    other[1] = 0x40;
    assert_eq!(zero.bucket_index(&Kuid(other)), 9);

    // Equal ids fall in the deepest bucket.
    assert_eq!(zero.bucket_index(&zero), KUID_BITS - 1);
}

#[test]
fn kuid_random_within_keeps_prefix() {
    let prefix = Kuid::random();
    for depth in [0, 1, 7, 8, 13, 64, 159] {
        let id = Kuid::random_within(&prefix, depth);
        for i in 0..depth {
            assert_eq!(id.bit(i), prefix.bit(i), "bit {i} at depth {depth}");
        }
    }
}

// ---- contact ----

#[test]
fn contact_state_transitions() {
    let mut contact = Contact::new(Kuid::random(), addr(1, 4000));
    assert_eq!(contact.state, ContactState::Unknown);

    contact.touch();
    assert!(contact.is_alive());

    contact.fail();
    contact.fail();
    contact.fail();
    assert!(contact.is_dead(3));
}

#[test]
fn contact_merge_respects_instance_id() {
    let id = Kuid::random();
    let mut old = Contact::new(id, addr(1, 4000));
    old.instance_id = 2;

    // A sighting with a lower instance id is a stale address.
    let mut stale = Contact::new(id, addr(2, 5000));
    stale.instance_id = 1;
    old.merge(&stale);
    assert_eq!(old.addr, addr(1, 4000));

    let mut fresh = Contact::new(id, addr(3, 6000));
    fresh.instance_id = 3;
    old.merge(&fresh);
    assert_eq!(old.addr, addr(3, 6000));
    assert_eq!(old.instance_id, 3);
}

// ---- routing ----

fn test_table(local: Kuid, k: usize) -> RouteTable {
    RouteTable::new(local, k, 4, 3)
}

#[test]
fn routing_partition_invariant() {
    let mut table = test_table(Kuid([0u8; KUID_LENGTH]), 4);
    for i in 0..200u16 {
        let mut contact = Contact::new(Kuid::random(), addr((i % 250) as u8, 4000 + i));
        contact.touch();
        table.add(contact);
    }

    // Every id is owned by exactly one bucket.
    for _ in 0..500 {
        let probe = Kuid::random();
        let owners = table.buckets().filter(|b| b.contains(&probe)).count();
        assert_eq!(owners, 1, "probe {probe} owned by {owners} buckets");
    }
}

#[test]
fn routing_bucket_capacity() {
    let k = 4;
    let mut table = test_table(Kuid::random(), k);
    for i in 0..300u16 {
        table.add(Contact::new(Kuid::random(), addr((i % 250) as u8, 4000 + i)));
    }

    for bucket in table.buckets() {
        assert!(bucket.len() <= k);
    }
}

#[test]
fn routing_split_own_branch() {
    // A full bucket covering the local node's range splits on the
    // next insert and redistributes by the next bit.
    let local = Kuid([0u8; KUID_LENGTH]);
    let mut table = test_table(local, 2);

    let one_side = kuid_with_first_byte(0x80);
    let zero_side = kuid_with_first_byte(0x40);
    let third = kuid_with_first_byte(0x01);

    assert!(table.add(Contact::new(one_side, addr(1, 4001))));
    assert!(table.add(Contact::new(zero_side, addr(2, 4002))));
    assert_eq!(table.bucket_count(), 1);

    assert!(table.add(Contact::new(third, addr(3, 4003))));
    assert_eq!(table.bucket_count(), 2);
    assert_eq!(table.len(), 3);

    // The 1xx contact lives alone in the far bucket; the other two
    // share the local node's branch.
    let far = table
        .buckets()
        .find(|b| b.contains(&one_side))
        .expect("far bucket");
    assert_eq!(far.len(), 1);
    let near = table
        .buckets()
        .find(|b| b.contains(&local))
        .expect("near bucket");
    assert_eq!(near.len(), 2);
}

#[test]
fn routing_full_far_bucket_goes_to_cache() {
    let local = Kuid([0u8; KUID_LENGTH]);
    let mut table = test_table(local, 2);

    // Fill the root, then force a split so a far bucket exists.
    table.add(Contact::new(kuid_with_first_byte(0x81), addr(1, 4001)));
    table.add(Contact::new(kuid_with_first_byte(0x82), addr(2, 4002)));
    table.add(Contact::new(kuid_with_first_byte(0x01), addr(3, 4003)));
    assert_eq!(table.bucket_count(), 2);

    // The far bucket is full and does not cover the local id: the
    // next contact lands in its replacement cache, and the live
    // entries are untouched.
    let extra = kuid_with_first_byte(0x83);
    assert!(!table.add(Contact::new(extra, addr(4, 4004))));
    assert!(table.contact(&extra).is_none());

    let far = table
        .buckets()
        .find(|b| b.contains(&extra))
        .expect("far bucket");
    assert_eq!(far.len(), 2);
    assert_eq!(far.cache_len(), 1);
}

#[test]
fn routing_failure_evicts_and_promotes_replacement() {
    let local = Kuid([0u8; KUID_LENGTH]);
    let mut table = test_table(local, 2);

    let first = kuid_with_first_byte(0x81);
    table.add(Contact::new(first, addr(1, 4001)));
    table.add(Contact::new(kuid_with_first_byte(0x82), addr(2, 4002)));
    table.add(Contact::new(kuid_with_first_byte(0x01), addr(3, 4003)));

    let cached = kuid_with_first_byte(0x83);
    table.add(Contact::new(cached, addr(4, 4004)));
    assert!(table.contact(&cached).is_none());

    for _ in 0..3 {
        table.handle_failure(&first);
    }
    assert!(table.contact(&first).is_none());
    assert!(table.contact(&cached).is_some());
}

#[test]
fn routing_closest_sorted_and_subset() {
    let mut table = test_table(Kuid::random(), 4);
    for i in 0..100u16 {
        table.add(Contact::new(Kuid::random(), addr((i % 250) as u8, 4000 + i)));
    }

    let target = Kuid::random();
    let closest = table.get_closest(&target, 10);
    assert!(closest.len() <= 10);

    let all: Vec<Kuid> = table.contacts().iter().map(|c| c.id).collect();
    let mut last = [0u8; KUID_LENGTH];
    for (i, contact) in closest.iter().enumerate() {
        let dist = contact.id.distance(&target);
        if i > 0 {
            assert!(dist >= last, "closest-N not sorted");
        }
        last = dist;
        assert!(all.contains(&contact.id));
    }
}

#[test]
fn routing_update_moves_to_most_recent() {
    let local = Kuid([0u8; KUID_LENGTH]);
    let mut table = test_table(local, 2);

    let first = kuid_with_first_byte(0x81);
    table.add(Contact::new(first, addr(1, 4001)));
    table.add(Contact::new(kuid_with_first_byte(0x82), addr(2, 4002)));

    // Re-sighting the oldest contact with a new address updates it in
    // place instead of inserting a duplicate.
    let mut seen = Contact::new(first, addr(9, 9000));
    seen.touch();
    assert!(table.add(seen));
    assert_eq!(table.len(), 2);
    let updated = table.contact(&first).expect("still present");
    assert_eq!(updated.addr, addr(9, 9000));
    assert!(updated.is_alive());
}

#[test]
fn value_ttl_scales_with_closer_contacts() {
    let local = Kuid([0u8; KUID_LENGTH]);
    let mut table = test_table(local, 8);
    let key = kuid_with_first_byte(0x01);
    assert_eq!(table.closer_count(&key), 0);

    // A contact farther from the key than we are does not count.
    table.add(Contact::new(kuid_with_first_byte(0x80), addr(9, 4009)));
    assert_eq!(table.closer_count(&key), 0);

    // Each contact nearer the key than the local node shortens the
    // TTL its values get here.
    let base = Duration::from_secs(3600);
    let mut last_ttl = base;
    for i in 1..=4u8 {
        let mut near = key.0;
        near[KUID_LENGTH - 1] = i;
        table.add(Contact::new(Kuid(near), addr(i, 4000 + i as u16)));

        let closer = table.closer_count(&key);
        assert_eq!(closer, i as usize);
        let ttl = base / (1 + closer as u32);
        assert!(ttl < last_ttl);
        last_ttl = ttl;
    }
}

#[test]
fn routing_snapshot_roundtrip() {
    let local = Kuid::random();
    let mut table = test_table(local, 4);
    for i in 0..50u16 {
        table.add(Contact::new(Kuid::random(), addr((i % 250) as u8, 4000 + i)));
    }

    let snapshot = table.snapshot();
    let restored = RouteTable::restore(&snapshot, 4, 4, 3).expect("restore");

    assert_eq!(restored.local_id(), &local);
    assert_eq!(restored.bucket_count(), table.bucket_count());
    assert_eq!(restored.len(), table.len());

    let mut original: Vec<(Kuid, SocketAddr)> =
        table.contacts().iter().map(|c| (c.id, c.addr)).collect();
    let mut recovered: Vec<(Kuid, SocketAddr)> =
        restored.contacts().iter().map(|c| (c.id, c.addr)).collect();
    original.sort_by_key(|(id, _)| *id);
    recovered.sort_by_key(|(id, _)| *id);
    assert_eq!(original, recovered);
}

#[test]
fn routing_restore_rejects_garbage() {
    assert!(RouteTable::restore(b"", 4, 4, 3).is_err());
    assert!(RouteTable::restore(b"\xFFgarbage", 4, 4, 3).is_err());
}

// ---- message codec ----

fn sample_contact() -> Contact {
    let mut contact = Contact::new(Kuid::random(), addr(7, 4007));
    contact.vendor = 0x524B4144;
    contact.version = 1;
    contact.instance_id = 2;
    contact
}

fn roundtrip(msg: &Message) -> Message {
    let encoded = msg.encode();
    // Deterministic: the same logical message always encodes the same.
    assert_eq!(encoded, msg.encode());
    Message::parse(&encoded).expect("parse back")
}

#[test]
fn codec_ping_pong() {
    let msg = Message::new(sample_contact(), Body::Ping);
    let parsed = roundtrip(&msg);
    assert_eq!(parsed.id, msg.id);
    assert_eq!(parsed.sender.id, msg.sender.id);
    assert_eq!(parsed.sender.addr, msg.sender.addr);
    assert!(matches!(parsed.body, Body::Ping));

    let pong = Message::reply(
        msg.id,
        sample_contact(),
        Body::Pong {
            external_addr: "[2001:db8::1]:9999".parse().unwrap(),
            estimated_size: 1234,
        },
    );
    match roundtrip(&pong).body {
        Body::Pong {
            external_addr,
            estimated_size,
        } => {
            assert_eq!(external_addr, "[2001:db8::1]:9999".parse().unwrap());
            assert_eq!(estimated_size, 1234);
        }
        other => panic!("wrong body: {other:?}"),
    }
}

#[test]
fn codec_find_node() {
    let target = Kuid::random();
    let msg = Message::new(sample_contact(), Body::FindNode { target });
    match roundtrip(&msg).body {
        Body::FindNode { target: t } => assert_eq!(t, target),
        other => panic!("wrong body: {other:?}"),
    }

    let ack = Message::reply(
        msg.id,
        sample_contact(),
        Body::FindNodeAck {
            token: Bytes::from_static(b"tokentok"),
            contacts: vec![sample_contact(), sample_contact()],
        },
    );
    match roundtrip(&ack).body {
        Body::FindNodeAck { token, contacts } => {
            assert_eq!(token, Bytes::from_static(b"tokentok"));
            assert_eq!(contacts.len(), 2);
            assert_eq!(contacts[0].vendor, 0x524B4144);
        }
        other => panic!("wrong body: {other:?}"),
    }
}

#[test]
fn codec_find_value_both_shapes() {
    let key = Kuid::random();
    let with_contacts = Message::new(
        sample_contact(),
        Body::FindValueAck {
            token: Bytes::from_static(b"t"),
            contacts: vec![sample_contact()],
            values: Vec::new(),
        },
    );
    match roundtrip(&with_contacts).body {
        Body::FindValueAck {
            contacts, values, ..
        } => {
            assert_eq!(contacts.len(), 1);
            assert!(values.is_empty());
        }
        other => panic!("wrong body: {other:?}"),
    }

    let with_values = Message::new(
        sample_contact(),
        Body::FindValueAck {
            token: Bytes::from_static(b"t"),
            contacts: Vec::new(),
            values: vec![DhtValue {
                key,
                originator: sample_contact(),
                value: Bytes::from_static(b"payload"),
            }],
        },
    );
    match roundtrip(&with_values).body {
        Body::FindValueAck {
            contacts, values, ..
        } => {
            assert!(contacts.is_empty());
            assert_eq!(values.len(), 1);
            assert_eq!(values[0].key, key);
            assert_eq!(values[0].value, Bytes::from_static(b"payload"));
        }
        other => panic!("wrong body: {other:?}"),
    }
}

#[test]
fn codec_store_and_ack() {
    let key = Kuid::random();
    let store = Message::new(
        sample_contact(),
        Body::Store {
            token: Bytes::from_static(b"issued"),
            values: vec![DhtValue {
                key,
                originator: sample_contact(),
                value: Bytes::from_static(b"v"),
            }],
        },
    );
    match roundtrip(&store).body {
        Body::Store { token, values } => {
            assert_eq!(token, Bytes::from_static(b"issued"));
            assert_eq!(values[0].key, key);
        }
        other => panic!("wrong body: {other:?}"),
    }

    let ack = Message::reply(
        store.id,
        sample_contact(),
        Body::StoreAck {
            statuses: vec![(key, StoreStatus::Accepted), (Kuid::random(), StoreStatus::Rejected)],
        },
    );
    match roundtrip(&ack).body {
        Body::StoreAck { statuses } => {
            assert_eq!(statuses.len(), 2);
            assert_eq!(statuses[0], (key, StoreStatus::Accepted));
        }
        other => panic!("wrong body: {other:?}"),
    }
}

#[test]
fn codec_stats() {
    let msg = Message::new(
        sample_contact(),
        Body::Stats {
            kind: StatsKind::Database,
        },
    );
    match roundtrip(&msg).body {
        Body::Stats { kind } => assert_eq!(kind, StatsKind::Database),
        other => panic!("wrong body: {other:?}"),
    }

    let ack = Message::reply(
        msg.id,
        sample_contact(),
        Body::StatsAck {
            report: "keys: 3\nvalues: 7".into(),
        },
    );
    match roundtrip(&ack).body {
        Body::StatsAck { report } => assert_eq!(report, "keys: 3\nvalues: 7"),
        other => panic!("wrong body: {other:?}"),
    }
}

#[test]
fn codec_rejects_malformed_input() {
    assert!(Message::parse(b"").is_err());

    assert!(Message::parse(&[0xFFu8; 64]).is_err());

    // Every strict prefix of a valid message must fail cleanly.
    let msg = Message::new(
        sample_contact(),
        Body::FindNodeAck {
            token: Bytes::from_static(b"tokentok"),
            contacts: vec![sample_contact(), sample_contact()],
        },
    );
    let encoded = msg.encode();
    for i in 0..encoded.len() {
        assert!(
            Message::parse(&encoded[..i]).is_err(),
            "prefix of length {i} parsed"
        );
    }

    // Bad address family inside the sender contact.
    let mut bad = encoded.to_vec();
    bad[1 + KUID_LENGTH + KUID_LENGTH] = 9;
    assert!(Message::parse(&bad).is_err());
}

// ---- tokens ----

#[test]
fn token_bound_to_address() {
    let tokens = TokenManager::new();
    let issued_to = addr(1, 4001);
    let token = tokens.issue(&issued_to);

    assert!(tokens.validate(&issued_to, &token));
    assert!(!tokens.validate(&addr(2, 4001), &token));
    assert!(!tokens.validate(&addr(1, 4002), &token));
    assert!(!tokens.validate(&issued_to, b"forged!!"));
}

#[test]
fn token_survives_one_rotation() {
    let tokens = TokenManager::new();
    let requester = addr(1, 4001);
    let token = tokens.issue(&requester);

    tokens.rotate();
    assert!(tokens.validate(&requester, &token));

    tokens.rotate();
    assert!(!tokens.validate(&requester, &token));
}

// ---- database ----

fn sample_value(key: Kuid, payload: &'static [u8]) -> DhtValue {
    DhtValue {
        key,
        originator: sample_contact(),
        value: Bytes::from_static(payload),
    }
}

#[test]
fn database_bounds() {
    let mut db = Database::new(8, 2, 100);
    let key = Kuid::random();

    assert_eq!(db.insert(sample_value(key, b"ok"), false), StoreStatus::Accepted);
    assert_eq!(
        db.insert(sample_value(key, b"too long payload"), false),
        StoreStatus::Rejected
    );
    assert_eq!(db.insert(sample_value(key, b""), false), StoreStatus::Rejected);

    // Distinct originators share a key up to the per-key bound.
    assert_eq!(db.insert(sample_value(key, b"b"), false), StoreStatus::Accepted);
    assert_eq!(db.insert(sample_value(key, b"c"), false), StoreStatus::Rejected);
    assert_eq!(db.get(&key).len(), 2);
}

#[test]
fn database_republication_updates_in_place() {
    let mut db = Database::new(64, 4, 100);
    let key = Kuid::random();
    let originator = sample_contact();

    let first = DhtValue {
        key,
        originator: originator.clone(),
        value: Bytes::from_static(b"v1"),
    };
    let second = DhtValue {
        key,
        originator,
        value: Bytes::from_static(b"v2"),
    };

    assert_eq!(db.insert(first, false), StoreStatus::Accepted);
    assert_eq!(db.insert(second, false), StoreStatus::Accepted);

    let values = db.get(&key);
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].value, Bytes::from_static(b"v2"));
}

#[test]
fn database_expiry_spares_local_values() {
    let mut db = Database::new(64, 4, 100);
    let remote_key = Kuid::random();
    let local_key = Kuid::random();

    db.insert(sample_value(remote_key, b"remote"), false);
    db.insert(sample_value(local_key, b"local"), true);

    let mut ttls = std::collections::HashMap::new();
    ttls.insert(remote_key, Duration::ZERO);
    ttls.insert(local_key, Duration::ZERO);

    assert_eq!(db.expire(&ttls), 1);
    assert!(db.get(&remote_key).is_empty());
    assert_eq!(db.get(&local_key).len(), 1);
}

#[test]
fn database_republish_only_local_values() {
    let mut db = Database::new(64, 4, 100);
    let local_key = Kuid::random();
    db.insert(sample_value(Kuid::random(), b"remote"), false);
    db.insert(sample_value(local_key, b"local"), true);

    let due = db.due_for_republish(Duration::ZERO, Duration::ZERO, 20);
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].key, local_key);

    // Freshly published with a full replica set: not due again yet.
    let originator = due[0].originator.id;
    db.mark_published(&local_key, &originator, 20);
    let due = db.due_for_republish(Duration::from_secs(3600), Duration::from_secs(60), 20);
    assert!(due.is_empty());
}

// ---- live nodes over localhost ----

fn test_config() -> NodeConfig {
    NodeConfig {
        k: 8,
        alpha: 3,
        request_timeout: Duration::from_millis(300),
        lookup_timeout: Duration::from_secs(5),
        allow_private_addresses: true,
        ..NodeConfig::default()
    }
}

async fn spawn_node(config: NodeConfig) -> Arc<DhtNode> {
    let node = DhtNode::bind("127.0.0.1:0".parse().unwrap(), config)
        .await
        .expect("bind");
    tokio::spawn(Arc::clone(&node).run());
    node
}

/// A bound socket that never answers, for exercising timeout paths.
async fn dead_addr() -> (tokio::net::UdpSocket, SocketAddr) {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let addr = socket.local_addr().expect("addr");
    (socket, addr)
}

#[tokio::test]
async fn ping_learns_external_address() {
    let a = spawn_node(test_config()).await;
    let b = spawn_node(test_config()).await;

    let contact = a.ping(b.local_addr()).await.expect("ping");
    assert_eq!(&contact.id, b.local_id());
    assert_eq!(contact.addr, b.local_addr());
    assert_eq!(a.external_addr(), Some(a.local_addr()));

    a.close();
    b.close();
}

#[tokio::test]
async fn request_sender_is_not_marked_alive() {
    let a = spawn_node(test_config()).await;
    let b = spawn_node(test_config()).await;
    b.ping(a.local_addr()).await.expect("ping");

    // An unsolicited request is spoofable, so the responder records
    // the sender without granting it the alive state. The requester
    // matched a response, so it does.
    let state = a.table.lock().contact(b.local_id()).map(|c| c.state);
    assert_eq!(state, Some(ContactState::Unknown));
    let state = b.table.lock().contact(a.local_id()).map(|c| c.state);
    assert_eq!(state, Some(ContactState::Alive));

    a.close();
    b.close();
}

#[tokio::test]
async fn address_policy_rejects_loopback_by_default() {
    let node = DhtNode::bind("127.0.0.1:0".parse().unwrap(), NodeConfig::default())
        .await
        .expect("bind");

    let loopback = "127.0.0.1:4000".parse().unwrap();
    assert!(matches!(
        node.ping(loopback).await,
        Err(DhtError::IllegalAddress(_))
    ));
    assert!(matches!(
        node.bootstrap(&[loopback]).await,
        Err(DhtError::IllegalAddress(_))
    ));
}

#[tokio::test]
async fn bootstrap_reports_dead_seeds() {
    let a = spawn_node(test_config()).await;
    let (_guard, dead) = dead_addr().await;
    let b = spawn_node(test_config()).await;

    let result = b
        .bootstrap(&[dead, a.local_addr()])
        .await
        .expect("bootstrap");
    assert_eq!(result.failed_seeds, vec![dead]);
    assert!(b.is_ready());

    a.close();
    b.close();
}

#[tokio::test]
async fn bootstrap_fails_when_all_seeds_dead() {
    let (_g1, dead1) = dead_addr().await;
    let (_g2, dead2) = dead_addr().await;
    let node = spawn_node(test_config()).await;

    assert!(matches!(
        node.bootstrap(&[dead1, dead2]).await,
        Err(DhtError::BootstrapFailed)
    ));
    assert!(!node.is_ready());

    node.close();
}

#[tokio::test]
async fn put_then_get_roundtrip() {
    let a = spawn_node(test_config()).await;
    let b = spawn_node(test_config()).await;
    let c = spawn_node(test_config()).await;

    b.bootstrap(&[a.local_addr()]).await.expect("b bootstrap");
    c.bootstrap(&[a.local_addr()]).await.expect("c bootstrap");

    let key = Kuid::random();
    let payload = Bytes::from_static(b"stored bytes");
    let result = b.put(key, payload.clone()).await.expect("put");
    assert!(!result.accepted.is_empty());

    let values = c.get(key).await.expect("get");
    assert_eq!(values[0].value, payload);
    assert_eq!(&values[0].originator.id, b.local_id());

    // A latecomer that holds nothing locally fetches over the network.
    let d = spawn_node(test_config()).await;
    d.bootstrap(&[a.local_addr()]).await.expect("d bootstrap");
    let values = d.get(key).await.expect("remote get");
    assert_eq!(values[0].value, payload);

    for node in [a, b, c, d] {
        node.close();
    }
}

#[tokio::test]
async fn put_fails_when_local_database_is_full() {
    let mut config = test_config();
    config.max_values = 0;
    let a = spawn_node(test_config()).await;
    let b = spawn_node(config).await;
    b.ping(a.local_addr()).await.expect("ping");

    // A value the local database cannot hold would never be
    // republished, so the put fails even with peers willing to
    // accept it.
    let key = Kuid::random();
    assert!(matches!(
        b.put(key, Bytes::from_static(b"crowded out")).await,
        Err(DhtError::StoreRejected)
    ));
    assert!(b.db.lock().get(&key).is_empty());

    a.close();
    b.close();
}

#[tokio::test]
async fn put_with_no_peers_is_rejected() {
    let node = spawn_node(test_config()).await;

    let key = Kuid::random();
    assert!(matches!(
        node.put(key, Bytes::from_static(b"orphan")).await,
        Err(DhtError::StoreRejected)
    ));
    // The value stays local; the publisher retries it once the
    // routing table has peers.
    assert_eq!(node.db.lock().get(&key).len(), 1);

    node.close();
}

#[tokio::test]
async fn value_size_capped_at_wire_limit() {
    let mut config = test_config();
    config.max_value_size = 1 << 20;
    let node = spawn_node(config).await;

    let big = Bytes::from(vec![0u8; u16::MAX as usize + 1]);
    assert!(matches!(
        node.put(Kuid::random(), big).await,
        Err(DhtError::StoreRejected)
    ));

    node.close();
}

#[tokio::test]
async fn get_missing_key_is_not_found() {
    let a = spawn_node(test_config()).await;
    let b = spawn_node(test_config()).await;
    b.bootstrap(&[a.local_addr()]).await.expect("bootstrap");

    assert!(matches!(
        b.get(Kuid::random()).await,
        Err(DhtError::NotFound)
    ));

    a.close();
    b.close();
}

#[tokio::test]
async fn lookup_tolerates_unresponsive_contact() {
    let a = spawn_node(test_config()).await;
    let b = spawn_node(test_config()).await;
    b.ping(a.local_addr()).await.expect("ping");

    let (_guard, dead) = dead_addr().await;
    let dead_id = Kuid::random();
    b.offer_contact(Contact::new(dead_id, dead));

    let found = lookup::find_node(&b, Kuid::random()).await.expect("lookup");
    assert!(found.iter().any(|(c, _)| &c.id == a.local_id()));
    assert!(found.iter().all(|(c, _)| c.id != dead_id));

    a.close();
    b.close();
}

#[tokio::test]
async fn lookup_results_sorted_by_distance() {
    let a = spawn_node(test_config()).await;
    let mut nodes = vec![Arc::clone(&a)];
    for _ in 0..5 {
        let n = spawn_node(test_config()).await;
        n.bootstrap(&[a.local_addr()]).await.expect("bootstrap");
        nodes.push(n);
    }

    let probe = spawn_node(test_config()).await;
    probe.bootstrap(&[a.local_addr()]).await.expect("bootstrap");

    let target = Kuid::random();
    let found = lookup::find_node(&probe, target).await.expect("lookup");
    assert!(!found.is_empty());

    let mut last = [0u8; KUID_LENGTH];
    for (i, (contact, token)) in found.iter().enumerate() {
        assert!(!token.is_empty(), "responder issued no token");
        let dist = contact.id.distance(&target);
        if i > 0 {
            assert!(dist >= last);
        }
        last = dist;
    }

    probe.close();
    for node in nodes {
        node.close();
    }
}

#[tokio::test]
async fn lookup_finds_the_globally_closest_nodes() {
    // Full mesh, so every node's table knows every peer and the
    // convergence property can be checked against the whole
    // population: nobody left out of the result set is closer to the
    // target than the worst node returned.
    let mut nodes = Vec::new();
    for _ in 0..10 {
        nodes.push(spawn_node(test_config()).await);
    }
    for node in &nodes {
        for other in &nodes {
            if node.local_id() != other.local_id() {
                node.ping(other.local_addr()).await.expect("ping");
            }
        }
    }

    let probe = &nodes[0];
    let target = Kuid::random();
    let found = lookup::find_node(probe, target).await.expect("lookup");
    assert!(!found.is_empty());

    let worst = found
        .last()
        .map(|(c, _)| c.id.distance(&target))
        .expect("nonempty result");
    let returned: Vec<Kuid> = found.iter().map(|(c, _)| c.id).collect();
    for node in &nodes[1..] {
        let id = *node.local_id();
        if !returned.contains(&id) {
            assert!(
                id.distance(&target) >= worst,
                "node {id} was left out of the result set but is closer than its worst member"
            );
        }
    }

    for node in nodes {
        node.close();
    }
}

#[tokio::test]
async fn store_requires_matching_token() {
    let a = spawn_node(test_config()).await;
    let b = spawn_node(test_config()).await;
    b.ping(a.local_addr()).await.expect("ping");

    let key = Kuid::random();
    let value = DhtValue {
        key,
        originator: b.local_contact(),
        value: Bytes::from_static(b"guarded"),
    };

    // A store with a token the responder never issued is rejected.
    let forged = b.new_message(Body::Store {
        token: Bytes::from_static(b"not a real token"),
        values: vec![value.clone()],
    });
    let response = b
        .rpc
        .request(a.local_addr(), forged, Duration::from_secs(1))
        .await
        .expect("response");
    match response.body {
        Body::StoreAck { statuses } => {
            assert_eq!(statuses, vec![(key, StoreStatus::Rejected)]);
        }
        other => panic!("wrong body: {other:?}"),
    }

    // With the token a issued to us, the same store goes through.
    let found = lookup::find_node(&b, key).await.expect("lookup");
    let (target, token) = found
        .into_iter()
        .find(|(c, _)| &c.id == a.local_id())
        .expect("a responded");
    let store = b.new_message(Body::Store {
        token,
        values: vec![value],
    });
    let response = b
        .rpc
        .request(target.addr, store, Duration::from_secs(1))
        .await
        .expect("response");
    match response.body {
        Body::StoreAck { statuses } => {
            assert_eq!(statuses, vec![(key, StoreStatus::Accepted)]);
        }
        other => panic!("wrong body: {other:?}"),
    }

    a.close();
    b.close();
}

#[tokio::test]
async fn stats_reports_counters() {
    let a = spawn_node(test_config()).await;
    let b = spawn_node(test_config()).await;
    b.ping(a.local_addr()).await.expect("ping");

    let request = b.new_message(Body::Stats {
        kind: StatsKind::Routing,
    });
    let response = b
        .rpc
        .request(a.local_addr(), request, Duration::from_secs(1))
        .await
        .expect("response");
    match response.body {
        Body::StatsAck { report } => {
            assert!(report.contains("contacts: 1"), "unexpected report: {report}");
        }
        other => panic!("wrong body: {other:?}"),
    }

    a.close();
    b.close();
}

#[tokio::test]
async fn collision_surfaces_on_forged_response() {
    let a = spawn_node(test_config()).await;
    let forger = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let forger_addr = forger.local_addr().expect("addr");
    let stolen_id = *a.local_id();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        let (n, from) = forger.recv_from(&mut buf).await.expect("recv");
        let request = Message::parse(&buf[..n]).expect("parse");
        let reply = Message::reply(
            request.id,
            Contact::new(stolen_id, forger_addr),
            Body::Pong {
                external_addr: from,
                estimated_size: 1,
            },
        );
        forger.send_to(&reply.encode(), from).await.expect("send");
    });

    assert!(matches!(
        a.ping(forger_addr).await,
        Err(DhtError::CollisionDetected)
    ));
    assert!(a.id_collision());

    a.close();
}

#[tokio::test]
async fn request_claiming_our_id_is_dropped() {
    let mut config = test_config();
    let a = spawn_node(config.clone()).await;

    // A second node deliberately bound to the same id.
    config.local_id = Some(*a.local_id());
    let impostor = spawn_node(config).await;

    assert!(matches!(
        impostor.ping(a.local_addr()).await,
        Err(DhtError::Timeout)
    ));
    assert!(a.id_collision());

    a.close();
    impostor.close();
}

#[tokio::test]
async fn route_table_survives_restart_via_snapshot() {
    let a = spawn_node(test_config()).await;
    let b = spawn_node(test_config()).await;
    let c = spawn_node(test_config()).await;
    b.ping(a.local_addr()).await.expect("ping a");
    b.ping(c.local_addr()).await.expect("ping c");

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("routes.bin");
    b.save_route_table(&path).expect("save");
    assert_eq!(DhtNode::stored_id(&path).expect("stored id"), *b.local_id());

    // Restart under the same identity.
    let mut config = test_config();
    config.local_id = Some(*b.local_id());
    b.close();
    let reborn = spawn_node(config).await;
    let loaded = reborn.load_route_table(&path).expect("load");
    assert_eq!(loaded, 2);

    // The restored contacts are immediately usable as seeds.
    let result = reborn.bootstrap(&[]).await.expect("warm bootstrap");
    assert!(result.failed_seeds.is_empty());
    assert!(reborn.is_ready());

    a.close();
    c.close();
    reborn.close();
}
