//! Clean-shutdown reload, dirty restart, and degraded-terms init.

mod fixtures;

use silt::Message;

use fixtures::{kib_body, msg, qname, Node};

const TRANSIENT_DIR: &str = "msg_store_transient";

#[test]
fn clean_shutdown_reloads_exactly_the_persistent_messages() {
    // Tiny segments so the zero target pushes entries across a segment
    // boundary into Δ, forcing transient index entries onto disk; the
    // reload must still drop them at the transient threshold.
    let node = Node::new(4);
    let name = qname("orders");

    {
        let mut stores = node.start(&[name.clone()]);
        let mut queue = node.open_queue(&mut stores, &name, true);
        for i in 0..6 {
            // Alternate persistent and transient publishes.
            queue
                .publish(Message::new(kib_body(i), i % 2 == 0))
                .unwrap();
        }
        queue.set_ram_duration_target(Some(0.0)).unwrap();
        for _ in 0..4 {
            queue.idle_timeout().unwrap();
        }
        queue.terminate().unwrap();
        stores.terminate().unwrap();
    }

    let mut stores = node.start(&[name.clone()]);
    let mut queue = node.open_queue(&mut stores, &name, true);
    assert_eq!(queue.len(), 3);
    for i in [0usize, 2, 4] {
        let fetched = queue.fetch(false).unwrap().expect("persistent message");
        assert_eq!(fetched.message.body.as_ref(), kib_body(i).as_slice());
        assert!(fetched.message.is_persistent);
    }
    assert!(queue.is_empty());
    // The transient store was cleaned at boot.
    assert_eq!(node.blob_count(TRANSIENT_DIR), 0);
}

#[test]
fn pending_acks_at_shutdown_come_back_redelivered() {
    let node = Node::new(64);
    let name = qname("work");

    {
        let mut stores = node.start(&[name.clone()]);
        let mut queue = node.open_queue(&mut stores, &name, true);
        queue.publish(msg("keep-me", true)).unwrap();
        let fetched = queue.fetch(true).unwrap().unwrap();
        assert!(fetched.ack_tag.is_some());
        // Terminate with the ack still outstanding.
        queue.terminate().unwrap();
        stores.terminate().unwrap();
    }

    let mut stores = node.start(&[name.clone()]);
    let mut queue = node.open_queue(&mut stores, &name, true);
    assert_eq!(queue.len(), 1);
    let fetched = queue.fetch(true).unwrap().expect("redelivery");
    assert!(fetched.is_delivered);
    assert_eq!(fetched.message.body.as_ref(), b"keep-me");
}

#[test]
fn missing_terms_fall_back_to_index_bounds() {
    let node = Node::new(256);
    let name = qname("gapped");

    {
        let mut stores = node.start(&[name.clone()]);
        let mut queue = node.open_queue(&mut stores, &name, true);
        for i in 0..2000 {
            queue.publish(Message::new(kib_body(i), true)).unwrap();
        }
        let mut tags = Vec::new();
        for _ in 0..1000 {
            tags.push(queue.fetch(true).unwrap().unwrap().ack_tag.unwrap());
        }
        queue.ack(&tags).unwrap();
        queue.handle_pre_hibernate().unwrap();
        // Crash: no terminate, so no terms file and no store marker.
    }

    let mut stores = node.start(&[name.clone()]);
    let mut queue = node.open_queue(&mut stores, &name, true);

    // Bounds are (1000, 2000); with the terms gone the engine rebuilds
    // Δ = {1000, 1000, 2000}, sets the transient threshold to 2000, and
    // primes Q3 with one segment's worth.
    assert_eq!(queue.len(), 1000);
    assert_eq!(queue.transient_threshold().get(), 2000);
    let depths = queue.depths();
    assert!(depths.q3 > 0);
    assert_eq!(depths.q3 as u64 + depths.delta, 1000);

    for i in 1000..2000 {
        let fetched = queue.fetch(false).unwrap().expect("recovered message");
        assert_eq!(fetched.message.body.as_ref(), kib_body(i).as_slice());
    }
    assert!(queue.is_empty());
}
