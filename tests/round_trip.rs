//! End-to-end dump-then-restore scenarios against the in-memory
//! `ServerHandle`, covering the concrete cases from spec §8.

use bson::doc;
use tempfile::tempdir;

use dumpkit::common::{NamespaceFilter, ReadPreference, WriteConcern};
use dumpkit::dump::{DumpOptions, DumpPipeline};
use dumpkit::namespace::Namespace;
use dumpkit::restore::{RestoreOptions, RestorePipeline};
use dumpkit::server::mock::MockServer;
use dumpkit::server::ServerHandle;

fn dump_opts(out_dir: std::path::PathBuf) -> DumpOptions {
    DumpOptions {
        filter: NamespaceFilter::default(),
        read_preference: ReadPreference::default(),
        capture_oplog: false,
        num_parallel_collections: Some(4),
        gzip: false,
        archive_path: None,
        out_dir,
        tool_version: "0.1.0".into(),
    }
}

fn restore_opts(source_dir: std::path::PathBuf) -> RestoreOptions {
    RestoreOptions {
        filter: NamespaceFilter::default(),
        renames: Vec::new(),
        write_concern: WriteConcern::default(),
        num_parallel_collections: Some(4),
        maintain_insertion_order: false,
        stop_on_error: false,
        drop_before_restore: true,
        preserve_uuids: false,
        config_db_only: false,
        fix_legacy_indexes: false,
        fix_hashed_dotted_indexes: false,
        archive_path: None,
        source_dir,
        gzip: false,
        target_db: None,
    }
}

#[test]
fn three_collection_directory_round_trip_preserves_documents() {
    let source = MockServer::new("6.0.0");
    source.seed(
        &Namespace::new("mydb", "orders"),
        vec![doc! {"_id": 1, "item": "pen"}, doc! {"_id": 2, "item": "pad"}],
    );
    source.seed(
        &Namespace::new("mydb", "customers"),
        vec![doc! {"_id": 1, "name": "alice"}],
    );
    source.seed(
        &Namespace::new("otherdb", "events"),
        vec![doc! {"_id": 1}, doc! {"_id": 2}, doc! {"_id": 3}],
    );

    let dir = tempdir().unwrap();
    let dump = DumpPipeline::new(&source, dump_opts(dir.path().to_path_buf()));
    let dump_report = dump.run().unwrap();
    assert_eq!(dump_report.namespaces_dumped, 3);
    assert_eq!(dump_report.documents_dumped, 6);

    let target = MockServer::new("6.0.0");
    let restore = RestorePipeline::new(&target, restore_opts(dir.path().to_path_buf()));
    let restore_report = restore.run().unwrap();
    assert_eq!(restore_report.namespaces_restored, 3);
    assert_eq!(restore_report.documents_inserted, 6);

    assert_eq!(
        target.documents(&Namespace::new("mydb", "orders")).len(),
        2
    );
    assert_eq!(
        target.documents(&Namespace::new("mydb", "customers")).len(),
        1
    );
    assert_eq!(
        target.documents(&Namespace::new("otherdb", "events")).len(),
        3
    );
}

#[test]
fn archive_round_trip_preserves_documents_across_namespaces() {
    let source = MockServer::new("6.0.0");
    source.seed(&Namespace::new("db", "a"), vec![doc! {"_id": 1}, doc! {"_id": 2}]);
    source.seed(&Namespace::new("db", "b"), vec![doc! {"_id": 1}]);

    let dir = tempdir().unwrap();
    let mut opts = dump_opts(dir.path().to_path_buf());
    opts.archive_path = Some(dir.path().join("dump.archive"));
    let dump = DumpPipeline::new(&source, opts);
    dump.run().unwrap();

    let target = MockServer::new("6.0.0");
    let mut ropts = restore_opts(dir.path().to_path_buf());
    ropts.archive_path = Some(dir.path().join("dump.archive"));
    let restore = RestorePipeline::new(&target, ropts);
    let report = restore.run().unwrap();

    assert_eq!(report.namespaces_restored, 2);
    assert_eq!(report.documents_inserted, 3);
}

#[test]
fn restore_skips_duplicate_keys_without_stop_on_error() {
    let source = MockServer::new("6.0.0");
    source.seed(
        &Namespace::new("db", "coll"),
        vec![doc! {"_id": 1}, doc! {"_id": 2}],
    );

    let dir = tempdir().unwrap();
    let dump = DumpPipeline::new(&source, dump_opts(dir.path().to_path_buf()));
    dump.run().unwrap();

    let target = MockServer::new("6.0.0");
    target.seed(&Namespace::new("db", "coll"), vec![doc! {"_id": 1}]);

    let mut opts = restore_opts(dir.path().to_path_buf());
    opts.drop_before_restore = false;
    let restore = RestorePipeline::new(&target, opts);
    let report = restore.run().unwrap();

    assert_eq!(report.documents_inserted, 1);
    assert_eq!(report.documents_skipped, 1);
}

#[test]
fn namespace_exclude_filter_skips_collection_on_restore() {
    let source = MockServer::new("6.0.0");
    source.seed(&Namespace::new("db", "keep"), vec![doc! {"_id": 1}]);
    source.seed(&Namespace::new("db", "drop_me"), vec![doc! {"_id": 1}]);

    let dir = tempdir().unwrap();
    let dump = DumpPipeline::new(&source, dump_opts(dir.path().to_path_buf()));
    dump.run().unwrap();

    let target = MockServer::new("6.0.0");
    let mut opts = restore_opts(dir.path().to_path_buf());
    opts.filter.exclude.push("db.drop_me".into());
    let restore = RestorePipeline::new(&target, opts);
    let report = restore.run().unwrap();

    assert_eq!(report.namespaces_restored, 1);
    assert!(target.documents(&Namespace::new("db", "keep")).len() == 1);
    assert!(target.documents(&Namespace::new("db", "drop_me")).is_empty());
}

#[test]
fn admin_users_and_roles_are_restored_through_the_merge_path_not_plain_insert() {
    let source = MockServer::new("6.0.0");
    source.seed(
        &Namespace::new("admin", "system.users"),
        vec![doc! {"user": "alice", "db": "admin"}],
    );
    source.seed(
        &Namespace::new("admin", "system.roles"),
        vec![doc! {"role": "readWrite", "db": "mydb"}],
    );
    source.seed(&Namespace::new("mydb", "orders"), vec![doc! {"_id": 1}]);

    let dir = tempdir().unwrap();
    let dump = DumpPipeline::new(&source, dump_opts(dir.path().to_path_buf()));
    let dump_report = dump.run().unwrap();
    assert_eq!(dump_report.namespaces_dumped, 3);

    let target = MockServer::new("6.0.0");
    let restore = RestorePipeline::new(&target, restore_opts(dir.path().to_path_buf()));
    let restore_report = restore.run().unwrap();

    assert_eq!(restore_report.namespaces_restored, 3);
    assert_eq!(target.documents(&Namespace::new("mydb", "orders")).len(), 1);
    // The merge command stages into temp collections and cleans them up
    // afterward; `admin.system.users`/`system.roles` themselves are never
    // written by this in-memory mock (that's the real server's job), so the
    // only directly observable effect here is that the temp collections were
    // left clean rather than lingering.
    assert!(target
        .documents(&Namespace::new("admin", "tempusers"))
        .is_empty());
    assert!(target
        .documents(&Namespace::new("admin", "temproles"))
        .is_empty());
}

#[test]
fn empty_users_and_roles_are_skipped_without_issuing_a_merge_command() {
    let source = MockServer::new("6.0.0");
    source.seed(&Namespace::new("admin", "system.users"), vec![]);
    source.seed(&Namespace::new("mydb", "orders"), vec![doc! {"_id": 1}]);

    let dir = tempdir().unwrap();
    let dump = DumpPipeline::new(&source, dump_opts(dir.path().to_path_buf()));
    dump.run().unwrap();

    let target = MockServer::new("6.0.0");
    let restore = RestorePipeline::new(&target, restore_opts(dir.path().to_path_buf()));
    let restore_report = restore.run().unwrap();

    // Only `mydb.orders` counts as restored; the empty users namespace is
    // skipped entirely per spec, not counted as a restored namespace.
    assert_eq!(restore_report.namespaces_restored, 1);
}

#[test]
fn namespace_rename_moves_collection_to_new_target() {
    let source = MockServer::new("6.0.0");
    source.seed(&Namespace::new("db", "coll"), vec![doc! {"_id": 1}]);

    let dir = tempdir().unwrap();
    let dump = DumpPipeline::new(&source, dump_opts(dir.path().to_path_buf()));
    dump.run().unwrap();

    let target = MockServer::new("6.0.0");
    let mut opts = restore_opts(dir.path().to_path_buf());
    opts.renames.push(dumpkit::common::NamespaceRename {
        from: "db.coll".into(),
        to: "db2.renamed".into(),
    });
    let restore = RestorePipeline::new(&target, opts);
    restore.run().unwrap();

    assert_eq!(target.documents(&Namespace::new("db2", "renamed")).len(), 1);
    assert!(target.documents(&Namespace::new("db", "coll")).is_empty());
}

#[test]
fn oplog_tail_is_captured_and_replayed_after_every_other_intent() {
    let source = MockServer::new("6.0.0");
    source.seed(&Namespace::new("mydb", "orders"), vec![doc! {"_id": 1}]);
    source
        .apply_ops(vec![doc! {"ns": "mydb.orders", "op": "i", "o": {"_id": 2}}])
        .unwrap();

    let dir = tempdir().unwrap();
    let mut opts = dump_opts(dir.path().to_path_buf());
    opts.capture_oplog = true;
    let dump = DumpPipeline::new(&source, opts);
    let dump_report = dump.run().unwrap();
    assert_eq!(dump_report.oplog_ops_captured, 1);
    assert!(dir.path().join("oplog.bson").exists());

    let target = MockServer::new("6.0.0");
    let restore = RestorePipeline::new(&target, restore_opts(dir.path().to_path_buf()));
    let restore_report = restore.run().unwrap();
    assert_eq!(restore_report.oplog_ops_replayed, 1);

    let replayed: Vec<_> = target
        .oplog_cursor(None)
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].get_str("ns").unwrap(), "mydb.orders");
}

#[test]
fn oplog_tail_round_trips_through_an_archive() {
    let source = MockServer::new("6.0.0");
    source.seed(&Namespace::new("db", "a"), vec![doc! {"_id": 1}]);
    source
        .apply_ops(vec![doc! {"ns": "db.a", "op": "i", "o": {"_id": 2}}])
        .unwrap();

    let dir = tempdir().unwrap();
    let mut opts = dump_opts(dir.path().to_path_buf());
    opts.capture_oplog = true;
    opts.archive_path = Some(dir.path().join("dump.archive"));
    let dump = DumpPipeline::new(&source, opts);
    let dump_report = dump.run().unwrap();
    assert_eq!(dump_report.oplog_ops_captured, 1);

    let target = MockServer::new("6.0.0");
    let mut ropts = restore_opts(dir.path().to_path_buf());
    ropts.archive_path = Some(dir.path().join("dump.archive"));
    let restore = RestorePipeline::new(&target, ropts);
    let restore_report = restore.run().unwrap();
    assert_eq!(restore_report.oplog_ops_replayed, 1);
}

#[test]
fn timeseries_collection_dumps_and_restores_the_bucket_collection() {
    let source = MockServer::new("6.0.0");
    let view_ns = Namespace::new("mydb", "readings");
    let bucket_ns = view_ns.bucket_namespace();
    source.declare_collection(&view_ns, "timeseries", doc! {"timeseries": {"timeField": "ts"}});
    source.declare_collection(
        &bucket_ns,
        "collection",
        doc! {"timeseriesBucketsMayHaveMixedSchemaData": true},
    );
    source.seed(&bucket_ns, vec![doc! {"_id": 1, "control": {"version": 1}}]);
    // The user-facing view itself must never be read as a dump source.
    source.seed(&view_ns, vec![doc! {"_id": 999}]);

    let dir = tempdir().unwrap();
    let dump = DumpPipeline::new(&source, dump_opts(dir.path().to_path_buf()));
    let dump_report = dump.run().unwrap();
    assert_eq!(dump_report.documents_dumped, 1);
    assert!(dir
        .path()
        .join("mydb")
        .join("system.buckets.readings.bson")
        .exists());
    assert!(dir
        .path()
        .join("mydb")
        .join("readings.metadata.json")
        .exists());

    let target = MockServer::new("6.0.0");
    let restore = RestorePipeline::new(&target, restore_opts(dir.path().to_path_buf()));
    let restore_report = restore.run().unwrap();
    assert_eq!(restore_report.documents_inserted, 1);

    assert_eq!(target.documents(&bucket_ns).len(), 1);
    assert!(target.documents(&view_ns).is_empty());

    let (db, command) = target.last_command().expect("a collMod should have run");
    assert_eq!(db, "mydb");
    assert_eq!(command.get_str("collMod").unwrap(), "system.buckets.readings");
    assert_eq!(
        command
            .get_bool("timeseriesBucketsMayHaveMixedSchemaData")
            .unwrap(),
        true
    );
}

#[test]
fn bare_bucket_file_without_sibling_metadata_is_an_error() {
    let dir = tempdir().unwrap();
    let db_dir = dir.path().join("mydb");
    std::fs::create_dir_all(&db_dir).unwrap();
    std::fs::write(db_dir.join("system.buckets.readings.bson"), b"").unwrap();

    let target = MockServer::new("6.0.0");
    let restore = RestorePipeline::new(&target, restore_opts(dir.path().to_path_buf()));
    let err = restore.run().unwrap_err();
    assert!(matches!(err, dumpkit::Error::ValidationError(_)));
}
