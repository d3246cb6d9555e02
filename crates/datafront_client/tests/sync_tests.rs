mod common;

use common::{Harness, as_fields};
use datafront_client::{EntityChange, EntityId, EntityKind, Push};
use datafront_common::codec::encode_batch;
use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn test_update_merges_into_fetched_entity() {
    let harness = Harness::online();

    let handle = harness.client.use_single("factories", 1);
    let sent = harness.sent_queries();
    harness.respond(sent[0].correlation_id, json!({ "id": 1, "name": "A", "level": 2 }));

    harness.push_update(EntityKind::Factories, 1, json!({ "level": 3 }));

    let entity = handle.result().single().cloned().unwrap();
    assert_eq!(entity.to_value(), json!({ "id": 1, "name": "A", "level": 3 }));
}

#[test]
fn test_pushes_apply_in_receipt_order() {
    let harness = Harness::online();

    let batch = encode_batch(&[
        Push::EntityUpdate {
            entity_type: EntityKind::Factories,
            id: EntityId::Int(9),
            fields: as_fields(json!({ "level": 2 })),
        },
        Push::EntityUpdate {
            entity_type: EntityKind::Factories,
            id: EntityId::Int(9),
            fields: as_fields(json!({ "level": 3 })),
        },
    ])
    .unwrap();
    harness.server.send_packet(batch).unwrap();
    harness.client.tick();

    let factory = harness
        .client
        .store()
        .get(&EntityKind::Factories, &EntityId::Int(9))
        .unwrap();
    assert_eq!(factory.get("level"), Some(&json!(3)));
}

#[test]
fn test_removal_makes_referencing_queries_absent() {
    let harness = Harness::online();

    let single = harness.client.use_single("cities", 2);
    let sent = harness.sent_queries();
    harness.respond(sent[0].correlation_id, json!({ "id": 2, "name": "Lima" }));

    let listing = harness.client.use_listing("coastalCities", "cities", json!({}));
    let sent = harness.sent_queries();
    harness.respond(sent[0].correlation_id, json!([{ "id": 1 }, { "id": 2 }]));

    harness.push_removed(EntityKind::Cities, 2);

    assert!(single.result().single().is_none());
    assert!(single.error().is_none());
    let remaining: Vec<_> = listing
        .result()
        .collection()
        .map(|entities| entities.keys().cloned().collect())
        .unwrap_or_default();
    assert_eq!(remaining, vec![EntityId::Int(1)]);
}

#[test]
fn test_entity_subscribers_see_each_change() {
    let harness = Harness::online();
    let store = harness.client.store().clone();

    let changes = Rc::new(RefCell::new(Vec::new()));
    {
        let changes = changes.clone();
        store.subscribe(&EntityKind::Worlds, &EntityId::Int(1), move |event| {
            changes.borrow_mut().push(event.change.clone())
        });
    }

    harness.push_update(EntityKind::Worlds, 1, json!({ "age": 1 }));
    harness.push_update(EntityKind::Worlds, 1, json!({ "age": 1 }));
    harness.push_update(EntityKind::Worlds, 1, json!({ "age": 2 }));
    harness.push_removed(EntityKind::Worlds, 1);

    assert_eq!(
        *changes.borrow(),
        vec![
            EntityChange::Inserted,
            EntityChange::Updated {
                fields: vec!["age".to_string()]
            },
            EntityChange::Removed,
        ]
    );
}

#[test]
fn test_query_listeners_follow_entity_updates() {
    let harness = Harness::online();

    let handle = harness.client.use_single("companies", 3);
    let levels = Rc::new(RefCell::new(Vec::new()));
    {
        let levels = levels.clone();
        handle.subscribe(move |state| {
            levels.borrow_mut().push(
                state
                    .result
                    .single()
                    .and_then(|company| company.get("cash").cloned()),
            )
        });
    }

    let sent = harness.sent_queries();
    harness.respond(sent[0].correlation_id, json!({ "id": 3, "cash": 10 }));
    harness.push_update(EntityKind::Companies, 3, json!({ "cash": 15 }));

    assert_eq!(levels.borrow().last().cloned(), Some(Some(json!(15))));
    assert!(levels.borrow().contains(&Some(json!(10))));
}

#[test]
fn test_unknown_entity_kinds_are_kept() {
    let harness = Harness::online();

    harness.push_update(EntityKind::from("shipments"), 1, json!({ "cargo": "ore" }));

    let shipment = harness
        .client
        .store()
        .get(&EntityKind::Other("shipments".to_string()), &EntityId::Int(1))
        .unwrap();
    assert_eq!(shipment.get("cargo"), Some(&json!("ore")));
}

#[test]
fn test_malformed_frame_is_skipped() {
    let harness = Harness::online();

    let mut packet = encode_batch(&[json!({ "nonsense": true })]).unwrap();
    packet.extend(
        encode_batch(&[Push::EntityUpdate {
            entity_type: EntityKind::Bases,
            id: EntityId::Int(1),
            fields: as_fields(json!({ "name": "Kept" })),
        }])
        .unwrap(),
    );
    harness.server.send_packet(packet).unwrap();
    harness.client.tick();

    assert!(harness.client.is_online());
    assert!(
        harness
            .client
            .store()
            .get(&EntityKind::Bases, &EntityId::Int(1))
            .is_some()
    );
}
