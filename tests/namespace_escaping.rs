//! Directory-mode output path escaping, invariant I4.

use bson::doc;
use tempfile::tempdir;

use dumpkit::common::{NamespaceFilter, ReadPreference};
use dumpkit::dump::{DumpOptions, DumpPipeline};
use dumpkit::namespace::{escape_collection_name, unescape_collection_name};
use dumpkit::server::mock::MockServer;
use dumpkit::namespace::Namespace;

#[test]
fn long_collection_name_is_dumped_under_a_truncated_hashed_path() {
    let long_name = "a".repeat(300);
    let server = MockServer::new("6.0.0");
    server.seed(&Namespace::new("db", &long_name), vec![doc! {"_id": 1}]);

    let dir = tempdir().unwrap();
    let pipeline = DumpPipeline::new(
        &server,
        DumpOptions {
            filter: NamespaceFilter::default(),
            read_preference: ReadPreference::default(),
            capture_oplog: false,
            num_parallel_collections: Some(1),
            gzip: false,
            archive_path: None,
            out_dir: dir.path().to_path_buf(),
            tool_version: "0.1.0".into(),
        },
    );
    pipeline.run().unwrap();

    let escaped = escape_collection_name(&long_name);
    assert!(unescape_collection_name(&escaped).is_none());
    assert!(dir.path().join("db").join(format!("{}.bson", escaped)).exists());
    assert!(dir
        .path()
        .join("db")
        .join(format!("{}.metadata.json", escaped))
        .exists());

    // The original name is recoverable only via the metadata file, not the
    // path itself.
    let json = std::fs::read_to_string(
        dir.path().join("db").join(format!("{}.metadata.json", escaped)),
    )
    .unwrap();
    assert!(json.contains(&long_name));
}
