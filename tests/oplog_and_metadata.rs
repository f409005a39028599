//! Oplog filtering/transform and index-metadata scenarios from spec §8.

use bson::doc;

use dumpkit::metadata::{CollectionKind, CollectionMetadata, IndexSpec};
use dumpkit::oplog::prepare_batch;
use dumpkit::server::mock::MockServer;
use dumpkit::server::ServerHandle;

#[test]
fn oplog_replay_drops_session_and_cache_noise_but_keeps_user_ops() {
    let raw_ops = vec![
        doc! {"ns": "config.system.sessions", "op": "d", "o": {"_id": "x"}},
        doc! {"ns": "config.cache.chunks.mydb.orders", "op": "u", "o": {}},
        doc! {"ns": "mydb.orders", "op": "i", "o": {"_id": 1, "item": "pen"}},
        doc! {"ns": "mydb.orders", "op": "i", "o": {"_id": 2, "item": "pad"}},
    ];

    let prepared = prepare_batch(raw_ops);
    assert_eq!(prepared.len(), 2);
    assert!(prepared.iter().all(|op| op.get_str("ns").unwrap() == "mydb.orders"));
}

#[test]
fn oplog_replay_lowers_commit_index_build_to_create_indexes() {
    let raw_ops = vec![doc! {
        "ns": "mydb.$cmd",
        "op": "c",
        "o": {
            "commitIndexBuild": "orders",
            "indexes": [{"key": {"item": 1}, "name": "item_1"}],
        },
    }];

    let prepared = prepare_batch(raw_ops);
    assert_eq!(prepared.len(), 1);
    let rewritten = prepared[0].get_document("o").unwrap();
    assert_eq!(rewritten.get_str("createIndexes").unwrap(), "orders");
}

#[test]
fn hashed_dotted_index_field_survives_legacy_rewrite() {
    let spec = IndexSpec {
        name: "a.b_1".into(),
        key: doc! {"a.b": 1},
        options: doc! {"ns": "db.coll", "v": 1, "background": true},
    };
    let rewritten = spec.clone().rewrite_legacy();
    assert_eq!(rewritten.key, doc! {"a.b": 1});
    assert!(!rewritten.options.contains_key("ns"));
    assert_eq!(rewritten.options.get_bool("background").unwrap(), true);
}

#[test]
fn metadata_round_trips_through_json_with_indexes_and_uuid() {
    let mut meta = CollectionMetadata::new("orders", CollectionKind::Collection);
    meta.uuid = Some(uuid::Uuid::new_v4());
    meta.indexes.push(IndexSpec {
        name: "_id_".into(),
        key: doc! {"_id": 1},
        options: Default::default(),
    });
    meta.indexes.push(IndexSpec {
        name: "item_1".into(),
        key: doc! {"item": 1},
        options: doc! {"unique": true},
    });

    let json = meta.to_json().unwrap();
    let back = CollectionMetadata::from_json(&json).unwrap();
    assert_eq!(back.indexes.len(), 2);
    assert_eq!(back.uuid, meta.uuid);
}

#[test]
fn create_indexes_reach_the_server_through_restore_prepare() {
    let server = MockServer::new("6.0.0");
    let ns = dumpkit::namespace::Namespace::new("db", "coll");
    server
        .create_indexes(
            &ns,
            vec![IndexSpec {
                name: "item_1".into(),
                key: doc! {"item": 1},
                options: doc! {"unique": true},
            }
            .to_create_indexes_spec()],
            true,
        )
        .unwrap();

    assert_eq!(server.indexes(&ns).len(), 1);
}
