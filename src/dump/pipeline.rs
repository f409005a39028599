//! Dump pipeline implementation.

use std::path::PathBuf;

use bson::{doc, Bson, Document};
use log::{info, warn};

use crate::archive::{ArchiveMultiplexer, Prelude, PreludeEntry};
use crate::bson_io::create_writer;
use crate::common::{NamespaceFilter, ReadPreference};
use crate::concurrency::{default_collection_workers, CancellationToken};
use crate::error::{Error, Result};
use crate::intent::{classify_admin_namespace, Direction, Intent, IntentKind, IntentManager};
use crate::metadata::{CollectionKind, CollectionMetadata};
use crate::namespace::Namespace;
use crate::oplog::{check_not_resharding, OplogCapture};
use crate::server::ServerHandle;

/// Tunables for a single dump run. Mirrors the options surface of the
/// toolchain this pipeline generalizes (`--db`, `--collection`,
/// `--excludeCollection`, `--oplog`, `--numParallelCollections`, `--gzip`,
/// `--archive`, `--out`).
pub struct DumpOptions {
    pub filter: NamespaceFilter,
    pub read_preference: ReadPreference,
    pub capture_oplog: bool,
    pub num_parallel_collections: Option<usize>,
    pub gzip: bool,
    /// `Some(path)` writes a single archive file; `None` writes a directory
    /// tree of `<db>/<escaped-collection>.bson[.gz]` files rooted at
    /// `out_dir`.
    pub archive_path: Option<PathBuf>,
    pub out_dir: PathBuf,
    pub tool_version: String,
}

pub struct DumpPipeline<'a> {
    server: &'a dyn ServerHandle,
    options: DumpOptions,
    cancellation: CancellationToken,
}

/// Summary returned after a dump completes.
#[derive(Debug, Default)]
pub struct DumpReport {
    pub namespaces_dumped: usize,
    pub documents_dumped: u64,
    pub oplog_ops_captured: u64,
}

impl<'a> DumpPipeline<'a> {
    pub fn new(server: &'a dyn ServerHandle, options: DumpOptions) -> Self {
        DumpPipeline {
            server,
            options,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Discovers every namespace across every database, applies the
    /// namespace filter, and builds one intent per surviving namespace.
    fn enumerate_intents(&self) -> Result<Vec<Intent>> {
        let mut intents = Vec::new();
        for database in self.server.list_databases()? {
            let collection_docs = self.server.list_collections(&database)?;
            // Indexed by name so a timeseries collection's intent can look up
            // its own bucket collection's `listCollections` entry, which is
            // where the server reports the mixed-schema flag (§4.4).
            let by_name: std::collections::HashMap<&str, &Document> = collection_docs
                .iter()
                .filter_map(|d| d.get_str("name").ok().map(|n| (n, d)))
                .collect();

            for collection_doc in &collection_docs {
                let name = collection_doc
                    .get_str("name")
                    .map_err(|_| Error::format("list_collections entry missing 'name'"))?;
                let namespace = Namespace::new(database.clone(), name);
                if !self.options.filter.allows(&namespace.full_name()) {
                    continue;
                }
                // A timeseries collection's bucket namespace is never a
                // standalone intent (invariant I7); it rides along with its
                // user-facing collection.
                if namespace.is_bucket_collection() {
                    continue;
                }

                let kind = match collection_doc.get_str("type").unwrap_or("collection") {
                    "view" => IntentKind::View,
                    "timeseries" => IntentKind::Timeseries,
                    _ => classify_admin_namespace(&namespace, IntentKind::Normal),
                };

                let mut intent = Intent::new(namespace.clone(), kind);
                if kind == IntentKind::Timeseries {
                    intent.options = timeseries_collection_options(&namespace, &by_name);
                }
                intents.push(intent);
            }
        }
        Ok(intents)
    }

    /// Runs the dump, writing either a single archive or a directory tree
    /// depending on `options.archive_path`.
    pub fn run(&self) -> Result<DumpReport> {
        // §4.4: checked before anything else touches the server, and again
        // implicitly via the oplog itself while tailing — a resharding
        // operation already in progress makes the whole dump invalid.
        let oplog_start = if self.options.capture_oplog {
            check_not_resharding(self.server)?;
            // Recorded before any collection cursor opens (§5's ordering
            // guarantee), so the tail read after the dump covers every
            // write that happened while collections were being read.
            Some(self.server.oplog_position()?)
        } else {
            None
        };

        let intents = self.enumerate_intents()?;
        let manager = IntentManager::new(Direction::Dump);
        manager.extend(intents);

        let mut report = DumpReport::default();
        match &self.options.archive_path {
            Some(path) => self.run_archive(&manager, path, oplog_start, &mut report)?,
            None => self.run_directory(&manager, oplog_start, &mut report)?,
        }

        Ok(report)
    }

    /// Reads the oplog window starting at `after_ts` to its current tail,
    /// handing each prepared-for-replay-free raw entry to `sink` (§4.4: the
    /// tail is captured verbatim; filtering/transformation happens on
    /// replay, not capture).
    fn capture_oplog_tail(&self, after_ts: Bson, mut sink: impl FnMut(Document) -> Result<()>) -> Result<u64> {
        let mut capture = OplogCapture::start(self.server, Some(after_ts))?;
        let mut count = 0u64;
        while let Some(result) = capture.next_op() {
            match result {
                Ok(op) => {
                    sink(op)?;
                    count += 1;
                }
                Err(e) => {
                    warn!("oplog capture stopped early: {}", e);
                    return Err(e);
                }
            }
        }
        Ok(count)
    }

    fn run_archive(
        &self,
        manager: &IntentManager,
        path: &std::path::Path,
        oplog_start: Option<Bson>,
        report: &mut DumpReport,
    ) -> Result<()> {
        let mut prelude = Prelude::new(&self.options.tool_version, self.server.server_version().to_string());
        // Pre-scan so the prelude can list every namespace before the
        // multiplexer starts writing; the manager is re-filled afterward
        // since `pop` drains it.
        let mut pending = Vec::new();
        while let Some(intent) = manager.pop() {
            prelude.namespaces.push(PreludeEntry {
                database: intent.namespace.database.clone(),
                collection: intent.namespace.collection.clone(),
                metadata: intent_metadata_json(&intent)?,
                size: intent.size_hint,
            });
            pending.push(intent);
        }
        if oplog_start.is_some() {
            // No sibling metadata: §6 exempts the oplog stream from needing
            // one. `database` is left empty, matching the restore side's
            // pseudo-namespace lookup.
            prelude.namespaces.push(PreludeEntry {
                database: String::new(),
                collection: OPLOG_STREAM_COLLECTION.into(),
                metadata: String::new(),
                size: 0,
            });
        }

        let writer = create_writer(path, self.options.gzip)?;
        let multiplexer = ArchiveMultiplexer::new(writer, &prelude)?;

        let worker_count = self
            .options
            .num_parallel_collections
            .unwrap_or_else(default_collection_workers);
        let token = &self.cancellation;
        let results = crate::concurrency::run_pool(pending, worker_count, token, |intent| {
            self.dump_one_archive(&multiplexer, intent)
        });

        for result in results {
            report.documents_dumped += result?;
            report.namespaces_dumped += 1;
        }

        if let Some(start) = oplog_start {
            let mut writer = multiplexer.writer_for(Namespace::new("", OPLOG_STREAM_COLLECTION));
            report.oplog_ops_captured = self.capture_oplog_tail(start, |op| writer.write_document(op))?;
        }

        multiplexer.finish()?;
        Ok(())
    }

    fn dump_one_archive(&self, multiplexer: &ArchiveMultiplexer, intent: Intent) -> Result<u64> {
        let mut writer = multiplexer.writer_for(intent.namespace.clone());
        let source = dump_source_namespace(&intent);
        let cursor = self
            .server
            .find(&source, None, &self.options.read_preference)?;

        let mut count = 0u64;
        for doc in cursor {
            self.cancellation.check()?;
            writer.write_document(doc?)?;
            count += 1;
        }
        info!("dumped {} documents from {}", count, intent.namespace);
        Ok(count)
    }

    fn run_directory(
        &self,
        manager: &IntentManager,
        oplog_start: Option<Bson>,
        report: &mut DumpReport,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.options.out_dir).map_err(Error::Io)?;
        let worker_count = self
            .options
            .num_parallel_collections
            .unwrap_or_else(default_collection_workers);

        let mut pending = Vec::new();
        while let Some(intent) = manager.pop() {
            pending.push(intent);
        }

        let token = &self.cancellation;
        let results = crate::concurrency::run_pool(pending, worker_count, token, |intent| {
            self.dump_one_directory(intent)
        });

        for result in results {
            report.documents_dumped += result?;
            report.namespaces_dumped += 1;
        }

        if let Some(start) = oplog_start {
            let ext = if self.options.gzip { "bson.gz" } else { "bson" };
            let oplog_path = self.options.out_dir.join(format!("oplog.{}", ext));
            let mut sink = crate::bson_io::BsonSink::new(create_writer(&oplog_path, self.options.gzip)?);
            report.oplog_ops_captured = self.capture_oplog_tail(start, |op| sink.write_document(&op))?;
            sink.flush()?;
        }
        Ok(())
    }

    fn dump_one_directory(&self, intent: Intent) -> Result<u64> {
        let db_dir = self.options.out_dir.join(&intent.namespace.database);
        std::fs::create_dir_all(&db_dir).map_err(Error::Io)?;

        // Metadata is always filed under the user-facing collection name;
        // the data stream for a timeseries collection is filed under its
        // bucket collection's name instead (§4.4, §6, invariant I7).
        let metadata_escaped = crate::namespace::escape_collection_name(&intent.namespace.collection);
        let source = dump_source_namespace(&intent);
        let data_escaped = crate::namespace::escape_collection_name(&source.collection);
        let ext = if self.options.gzip { "bson.gz" } else { "bson" };
        let data_path = db_dir.join(format!("{}.{}", data_escaped, ext));
        let metadata_path = db_dir.join(format!("{}.metadata.json", metadata_escaped));

        std::fs::write(&metadata_path, intent_metadata_json(&intent)?).map_err(Error::Io)?;

        let mut sink = crate::bson_io::BsonSink::new(create_writer(&data_path, self.options.gzip)?);
        let cursor = self
            .server
            .find(&source, None, &self.options.read_preference)?;

        let mut count = 0u64;
        for doc in cursor {
            self.cancellation.check()?;
            sink.write_document(&doc?)?;
            count += 1;
        }
        sink.flush()?;
        info!("dumped {} documents from {}", count, intent.namespace);
        Ok(count)
    }
}

/// The namespace an intent's documents should actually be read from: a
/// timeseries collection's raw data lives in its bucket collection, never
/// the user-facing view (§4.4, invariant I7).
fn dump_source_namespace(intent: &Intent) -> Namespace {
    if intent.kind == IntentKind::Timeseries {
        intent.namespace.bucket_namespace()
    } else {
        intent.namespace.clone()
    }
}

/// Pseudo-collection name the oplog tail is filed under, both as an archive
/// stream key and (stripped of its `.bson` extension) a directory-mode file
/// name. Matches the restore side's lookup in `restore::pipeline`.
pub(crate) const OPLOG_STREAM_COLLECTION: &str = "oplog";

/// Builds a timeseries intent's `options`, carrying over the collection's
/// creation options and, when the server reports its bucket collection as
/// mixed-schema, recording that flag for restore to act on (§4.4, §4.5
/// point 6, scenario 6).
fn timeseries_collection_options(
    namespace: &Namespace,
    by_name: &std::collections::HashMap<&str, &Document>,
) -> Document {
    let mut options = by_name
        .get(namespace.collection.as_str())
        .and_then(|doc| doc.get_document("options").ok())
        .cloned()
        .unwrap_or_default();

    let mixed_schema = by_name
        .get(namespace.bucket_collection_name().as_str())
        .and_then(|doc| doc.get_document("options").ok())
        .map(|opts| {
            opts.get_bool("timeseriesBucketsMayHaveMixedSchemaData")
                .unwrap_or(false)
        })
        .unwrap_or(false);

    if mixed_schema {
        let mut timeseries = options.get_document("timeseries").cloned().unwrap_or_default();
        timeseries.insert("mixedSchema", true);
        options.insert("timeseries", Bson::Document(timeseries));
    }

    options
}

fn intent_metadata_json(intent: &Intent) -> Result<String> {
    let kind = match intent.kind {
        IntentKind::View => CollectionKind::View,
        IntentKind::Timeseries => CollectionKind::Timeseries,
        _ => CollectionKind::Collection,
    };
    let mut metadata = CollectionMetadata::new(intent.namespace.collection.clone(), kind);
    metadata.options = intent.options.clone();
    metadata.to_json()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::mock::MockServer;
    use tempfile::tempdir;

    fn options(out_dir: PathBuf) -> DumpOptions {
        DumpOptions {
            filter: NamespaceFilter::default(),
            read_preference: ReadPreference::default(),
            capture_oplog: false,
            num_parallel_collections: Some(2),
            gzip: false,
            archive_path: None,
            out_dir,
            tool_version: "0.1.0".into(),
        }
    }

    #[test]
    fn directory_dump_writes_one_file_pair_per_collection() {
        let server = MockServer::new("6.0.0");
        server.seed(
            &Namespace::new("mydb", "orders"),
            vec![doc! {"_id": 1}, doc! {"_id": 2}],
        );
        server
            .create_indexes(&Namespace::new("mydb", "orders"), vec![], false)
            .unwrap();

        let dir = tempdir().unwrap();
        let pipeline = DumpPipeline::new(&server, options(dir.path().to_path_buf()));
        let report = pipeline.run().unwrap();

        assert_eq!(report.namespaces_dumped, 1);
        assert_eq!(report.documents_dumped, 2);
        assert!(dir.path().join("mydb").join("orders.bson").exists());
        assert!(dir.path().join("mydb").join("orders.metadata.json").exists());
    }

    #[test]
    fn archive_dump_produces_one_file_with_prelude() {
        let server = MockServer::new("6.0.0");
        server.seed(&Namespace::new("mydb", "a"), vec![doc! {"_id": 1}]);
        server.seed(&Namespace::new("mydb", "b"), vec![doc! {"_id": 2}, doc! {"_id": 3}]);

        let dir = tempdir().unwrap();
        let mut opts = options(dir.path().to_path_buf());
        opts.archive_path = Some(dir.path().join("dump.archive"));
        let pipeline = DumpPipeline::new(&server, opts);
        let report = pipeline.run().unwrap();

        assert_eq!(report.namespaces_dumped, 2);
        assert_eq!(report.documents_dumped, 3);
        assert!(dir.path().join("dump.archive").exists());
    }
}
