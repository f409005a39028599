//! Restore pipeline implementation.

use std::path::PathBuf;

use bson::{doc, Document};
use log::info;
use semver::Version;

use crate::archive::ArchiveDemux;
use crate::bson_io::{open_reader, BsonSource};
use crate::common::{NamespaceFilter, NamespaceRename, WriteConcern};
use crate::concurrency::{default_collection_workers, default_insertion_workers, CancellationToken};
use crate::error::{Error, Result};
use crate::intent::{classify_admin_namespace, Direction, Intent, IntentKind, IntentManager};
use crate::metadata::{rewrite_legacy_index_set, CollectionKind, CollectionMetadata, IndexSpec};
use crate::namespace::Namespace;
use crate::server::ServerHandle;
use crate::users_roles::{check_auth_schema, restore_users_and_roles, MergeMode};

use super::bulk_writer::BulkWriter;

fn is_admin_auth_intent(kind: IntentKind) -> bool {
    matches!(kind, IntentKind::Users | IntentKind::Roles | IntentKind::AuthVersion)
}

/// `config.*` collections restored even when the dump was not scoped
/// exclusively to `config` (spec §4.3 ordering rule 3, §4.5 planning).
const RECOGNIZED_CONFIG_COLLECTIONS: &[&str] = &[
    "chunks",
    "collections",
    "databases",
    "settings",
    "shards",
    "tags",
    "version",
];

/// Tunables for a single restore run.
pub struct RestoreOptions {
    pub filter: NamespaceFilter,
    pub renames: Vec<NamespaceRename>,
    pub write_concern: WriteConcern,
    pub num_parallel_collections: Option<usize>,
    pub maintain_insertion_order: bool,
    pub stop_on_error: bool,
    pub drop_before_restore: bool,
    pub preserve_uuids: bool,
    /// Whether the restore is scoped exclusively to the `config` database
    /// (e.g. `--db config`), which lifts the "only recognized `config.*`
    /// collections" restriction of §4.3 rule 3.
    pub config_db_only: bool,
    /// Enables the §4.5.5 legacy-index key normalization pass.
    pub fix_legacy_indexes: bool,
    /// Within legacy-index rewriting, also rewrites a hashed index on a
    /// dotted field to an ascending key (§4.5.5, testable scenario 4).
    /// Has no effect unless `fix_legacy_indexes` is also set.
    pub fix_hashed_dotted_indexes: bool,
    /// `Some(path)` reads a single archive file; `None` reads a directory
    /// tree rooted at `source_dir`.
    pub archive_path: Option<PathBuf>,
    pub source_dir: PathBuf,
    pub gzip: bool,
    /// The database the restore is scoped to (e.g. `--db mydb`), used to
    /// populate the users/roles merge command's `db` field (§4.7 point 4).
    /// `None` or `Some("admin")` both mean "not scoped to one database".
    pub target_db: Option<String>,
}

#[derive(Debug, Default)]
pub struct RestoreReport {
    pub namespaces_restored: usize,
    pub documents_inserted: u64,
    pub documents_skipped: u64,
    pub oplog_ops_replayed: u64,
}

pub struct RestorePipeline<'a> {
    server: &'a dyn ServerHandle,
    options: RestoreOptions,
    cancellation: CancellationToken,
}

impl<'a> RestorePipeline<'a> {
    pub fn new(server: &'a dyn ServerHandle, options: RestoreOptions) -> Self {
        RestorePipeline {
            server,
            options,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Applies `nsInclude`/`nsExclude` first, then `nsFrom`/`nsTo` renames,
    /// per §4.3's ordering rule: a namespace excluded by filter is never
    /// considered for rename. `config.*` namespaces outside the seven
    /// recognized system collections are dropped unless the restore is
    /// scoped exclusively to `config` (§4.3 rule 3).
    fn plan_namespace(&self, namespace: &Namespace) -> Option<Namespace> {
        if namespace.database == "config"
            && !self.options.config_db_only
            && !RECOGNIZED_CONFIG_COLLECTIONS.contains(&namespace.collection.as_str())
        {
            return None;
        }
        if !self.options.filter.allows(&namespace.full_name()) {
            return None;
        }
        for rename in &self.options.renames {
            if let Some(renamed) = rename.apply(&namespace.full_name()) {
                return Namespace::parse(&renamed);
            }
        }
        Some(namespace.clone())
    }

    pub fn run(&self) -> Result<RestoreReport> {
        if self.options.preserve_uuids && !self.options.drop_before_restore {
            // §4.5 point 2: preserving a dumped collection's UUID only
            // makes sense when the target is being dropped and recreated;
            // applying it to an existing collection would require changing
            // a live collection's identity in place, which no command
            // supports. Caught here, before any mutation (§7 ValidationError).
            return Err(Error::validation(
                "preserveUUID requires drop to also be set",
            ));
        }
        match &self.options.archive_path {
            Some(path) => self.run_archive(path),
            None => self.run_directory(),
        }
    }

    fn run_directory(&self) -> Result<RestoreReport> {
        let manager = IntentManager::new(Direction::Restore);
        let mut intents = Vec::new();

        for db_dir in std::fs::read_dir(&self.options.source_dir).map_err(Error::Io)? {
            let db_dir = db_dir.map_err(Error::Io)?;
            if !db_dir.file_type().map_err(Error::Io)?.is_dir() {
                continue;
            }
            let database = db_dir.file_name().to_string_lossy().into_owned();

            // Bucket-file names with a sibling metadata file, tracked so the
            // second pass below can tell a legitimate timeseries data file
            // from a bare one (§4.5 point 6).
            let mut expected_bucket_files = std::collections::HashSet::new();
            let mut dir_entries = Vec::new();

            for entry in std::fs::read_dir(db_dir.path()).map_err(Error::Io)? {
                let entry = entry.map_err(Error::Io)?;
                let path = entry.path();
                dir_entries.push(path.clone());
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let json = std::fs::read_to_string(&path).map_err(Error::Io)?;
                let metadata = CollectionMetadata::from_json(&json)?;
                let namespace = Namespace::new(database.clone(), metadata.collection_name.clone());

                let kind = match metadata.kind {
                    CollectionKind::View => IntentKind::View,
                    CollectionKind::Timeseries => IntentKind::Timeseries,
                    CollectionKind::Collection => classify_admin_namespace(&namespace, IntentKind::Normal),
                };
                if kind == IntentKind::Timeseries {
                    expected_bucket_files.insert(crate::namespace::escape_collection_name(
                        &namespace.bucket_collection_name(),
                    ));
                }

                let target = match self.plan_namespace(&namespace) {
                    Some(t) => t,
                    None => continue,
                };

                let mut intent = Intent::new(namespace, kind);
                intent.rename_to = if target.full_name() == intent.namespace.full_name() {
                    None
                } else {
                    Some(target)
                };
                intent.options = metadata.options.clone();
                intent.metadata = Some(metadata);
                intents.push(intent);
            }

            for path in &dir_entries {
                let file_name = match path.file_name().and_then(|n| n.to_str()) {
                    Some(n) => n,
                    None => continue,
                };
                let stem = match file_name
                    .strip_suffix(".bson.gz")
                    .or_else(|| file_name.strip_suffix(".bson"))
                {
                    Some(stem) => stem,
                    None => continue,
                };
                if !stem.starts_with("system.buckets.") {
                    continue;
                }
                if !expected_bucket_files.contains(stem) {
                    return Err(Error::validation(format!(
                        "{}/{} is a timeseries bucket file with no sibling metadata",
                        database, file_name
                    )));
                }
            }
        }

        manager.extend(intents);
        let mut report = self.execute_directory(&manager)?;
        self.replay_oplog_directory(&mut report)?;
        Ok(report)
    }

    /// Reads back the oplog tail a dump captured at `<source_dir>/oplog.*`,
    /// if one is present, and replays it now that every other intent has
    /// finished restoring (§2 step 5, §4.5 step 5, §5's ordering guarantee).
    fn replay_oplog_directory(&self, report: &mut RestoreReport) -> Result<()> {
        let ext = if self.options.gzip { "bson.gz" } else { "bson" };
        let oplog_path = self.options.source_dir.join(format!("oplog.{}", ext));
        if !oplog_path.exists() {
            return Ok(());
        }
        let reader = open_reader(&oplog_path, self.options.gzip)?;
        let ops: Vec<Document> = BsonSource::new(reader).into_iter().collect();
        report.oplog_ops_replayed = ops.len() as u64;
        crate::oplog::replay_batch(self.server, ops)?;
        Ok(())
    }

    fn execute_directory(&self, manager: &IntentManager) -> Result<RestoreReport> {
        let mut pending = Vec::new();
        while let Some(intent) = manager.pop() {
            pending.push(intent);
        }
        let (special, normal): (Vec<Intent>, Vec<Intent>) = pending
            .into_iter()
            .partition(|intent| is_admin_auth_intent(intent.kind));

        let worker_count = self
            .options
            .num_parallel_collections
            .unwrap_or_else(default_collection_workers);
        let token = &self.cancellation;

        let results = crate::concurrency::run_pool(normal, worker_count, token, |intent| {
            self.restore_one_directory(intent)
        });

        let mut report = RestoreReport::default();
        for result in results {
            let (inserted, skipped) = result?;
            report.namespaces_restored += 1;
            report.documents_inserted += inserted;
            report.documents_skipped += skipped;
        }

        self.finish_users_and_roles(special, &mut report, |intent| {
            self.read_documents_directory(intent)
        })?;

        Ok(report)
    }

    fn read_documents_directory(&self, intent: &Intent) -> Result<Vec<Document>> {
        let escaped = crate::namespace::escape_collection_name(&intent.namespace.collection);
        let ext = if self.options.gzip { "bson.gz" } else { "bson" };
        let data_path = self
            .options
            .source_dir
            .join(&intent.namespace.database)
            .join(format!("{}.{}", escaped, ext));
        let reader = open_reader(&data_path, self.options.gzip)?;
        Ok(BsonSource::new(reader).into_iter().collect())
    }

    /// Gathers the `admin.system.users`/`admin.system.roles` documents set
    /// aside by the caller's partition, and performs the merge-command
    /// restore once both are in hand, instead of the usual per-namespace
    /// create-and-insert path (§4.7). A no-op when both namespaces were
    /// empty or absent (§4.7 point 1).
    fn finish_users_and_roles(
        &self,
        special: Vec<Intent>,
        report: &mut RestoreReport,
        mut read: impl FnMut(&Intent) -> Result<Vec<Document>>,
    ) -> Result<()> {
        if special.is_empty() {
            return Ok(());
        }

        let mut users = Vec::new();
        let mut roles = Vec::new();
        for intent in &special {
            match intent.kind {
                IntentKind::Users => users = read(intent)?,
                IntentKind::Roles => roles = read(intent)?,
                IntentKind::AuthVersion => {}
                _ => unreachable!("finish_users_and_roles only receives admin auth intents"),
            }
        }

        if users.is_empty() && roles.is_empty() {
            return Ok(());
        }

        check_auth_schema(self.server)?;
        let mode = if self.options.drop_before_restore {
            MergeMode::Replace
        } else {
            MergeMode::Merge
        };
        let inserted = (users.len() + roles.len()) as u64;
        let target_db = self.options.target_db.as_deref().unwrap_or("");
        restore_users_and_roles(self.server, users, roles, mode, target_db)?;

        report.namespaces_restored += special.len();
        report.documents_inserted += inserted;
        Ok(())
    }

    fn restore_one_directory(&self, intent: Intent) -> Result<(u64, u64)> {
        self.prepare_target(&intent)?;

        let source_namespace = restore_source_namespace(&intent);
        let escaped = crate::namespace::escape_collection_name(&source_namespace.collection);
        let ext = if self.options.gzip { "bson.gz" } else { "bson" };
        let data_path = self
            .options
            .source_dir
            .join(&intent.namespace.database)
            .join(format!("{}.{}", escaped, ext));

        let reader = open_reader(&data_path, self.options.gzip)?;
        let source = BsonSource::new(reader);
        let (inserted, skipped) = self.insert_documents(&intent, source.into_iter())?;
        Ok((inserted, skipped))
    }

    fn run_archive(&self, path: &std::path::Path) -> Result<RestoreReport> {
        let reader = open_reader(path, self.options.gzip)?;
        let (demux, prelude) = ArchiveDemux::new(reader)?;

        let manager = IntentManager::new(Direction::Restore);
        let mut intents = Vec::new();
        for entry in &prelude.namespaces {
            let namespace = Namespace::new(entry.database.clone(), entry.collection.clone());
            // The captured oplog tail rides along as a pseudo-namespace
            // stream, not an intent (§4.4, §5): it is replayed once, after
            // every real intent finishes, below.
            if namespace.database.is_empty() && namespace.collection == crate::dump::OPLOG_STREAM_COLLECTION {
                continue;
            }
            let target = match self.plan_namespace(&namespace) {
                Some(t) => t,
                None => continue,
            };
            let metadata = CollectionMetadata::from_json(&entry.metadata)?;
            let kind = match metadata.kind {
                CollectionKind::View => IntentKind::View,
                CollectionKind::Timeseries => IntentKind::Timeseries,
                CollectionKind::Collection => classify_admin_namespace(&namespace, IntentKind::Normal),
            };
            let mut intent = Intent::new(namespace, kind);
            intent.rename_to = if target.full_name() == intent.namespace.full_name() {
                None
            } else {
                Some(target)
            };
            intent.options = metadata.options.clone();
            intent.metadata = Some(metadata);
            intents.push(intent);
        }
        manager.extend(intents);

        let mut pending = Vec::new();
        while let Some(intent) = manager.pop() {
            pending.push(intent);
        }
        let (special, normal): (Vec<Intent>, Vec<Intent>) = pending
            .into_iter()
            .partition(|intent| is_admin_auth_intent(intent.kind));

        let worker_count = self
            .options
            .num_parallel_collections
            .unwrap_or_else(default_collection_workers);
        let token = &self.cancellation;
        let results = crate::concurrency::run_pool(normal, worker_count, token, |intent| {
            self.restore_one_archive(&demux, intent)
        });

        let mut report = RestoreReport::default();
        for result in results {
            let (inserted, skipped) = result?;
            report.namespaces_restored += 1;
            report.documents_inserted += inserted;
            report.documents_skipped += skipped;
        }

        self.finish_users_and_roles(special, &mut report, |intent| {
            let reader = demux.take_reader(&intent.namespace).ok_or_else(|| {
                Error::format(format!("archive has no stream for {}", intent.namespace))
            })?;
            Ok(reader.collect())
        })?;

        // Drained before `finish()` is called: an unread registered stream
        // would otherwise block the demultiplexer's pump thread forever on
        // its bounded channel.
        if let Some(reader) = demux.take_reader(&Namespace::new("", crate::dump::OPLOG_STREAM_COLLECTION)) {
            let ops: Vec<Document> = reader.collect();
            report.oplog_ops_replayed = ops.len() as u64;
            crate::oplog::replay_batch(self.server, ops)?;
        }

        demux.finish()?;
        Ok(report)
    }

    fn restore_one_archive(&self, demux: &ArchiveDemux, intent: Intent) -> Result<(u64, u64)> {
        self.prepare_target(&intent)?;
        let reader = demux
            .take_reader(&intent.namespace)
            .ok_or_else(|| Error::format(format!("archive has no stream for {}", intent.namespace)))?;
        self.insert_documents(&intent, reader)
    }

    /// Drops (if requested) and creates the target collection, applies its
    /// clustered index if any, and creates its secondary indexes before any
    /// document is inserted — per §4.5, index creation always precedes
    /// bulk insertion so the server can validate documents against unique
    /// indexes as they stream in.
    fn prepare_target(&self, intent: &Intent) -> Result<()> {
        let target = intent.target_namespace();

        if self.options.drop_before_restore {
            self.server.drop_collection(target)?;
        }

        let mut create_command = doc! { "create": target.collection.clone() };
        if self.options.preserve_uuids {
            if let Some(metadata) = &intent.metadata {
                if let Some(uuid) = metadata.uuid {
                    create_command.insert("uuid", bson::Bson::Binary(bson::Binary {
                        subtype: bson::spec::BinarySubtype::Uuid,
                        bytes: uuid.as_bytes().to_vec(),
                    }));
                }
            }
        }
        for (k, v) in intent.options.iter() {
            create_command.insert(k.clone(), v.clone());
        }

        let server_version = self.server.server_version();
        // §4.5 point 2: `autoIndexId: false` stopped being honored on 4.0+
        // for every database but `local`; restoring it verbatim there would
        // silently produce a collection without its `_id` index.
        if target.database != "local"
            && server_version >= Version::new(4, 0, 0)
            && matches!(create_command.get_bool("autoIndexId"), Ok(false))
        {
            create_command.insert("autoIndexId", true);
        }

        match self
            .server
            .run_command(&target.database, create_command)?
            .into_result(&target.database)
        {
            Ok(_) => {}
            // NamespaceExists (48): the collection already exists (e.g. a
            // restore without --drop against a pre-existing namespace); not
            // fatal, just means we reuse it.
            Err(Error::FatalServerError { message, .. }) if message.contains("[48]") => {}
            Err(e) => return Err(e),
        }

        if let Some(metadata) = &intent.metadata {
            self.create_indexes_for(target, &metadata.indexes, &server_version)?;

            if metadata.is_mixed_schema_timeseries() {
                // §4.5 point 6: proactively turn on mixed-schema buckets
                // before any document is loaded, rather than waiting on a
                // reactive 408 from the server.
                self.apply_mixed_schema_collmod(intent)?;
            }
        }

        Ok(())
    }

    /// Builds `indexes` against `target`, applying §4.5 point 4's
    /// version-gated behavior: `ignoreUnknownIndexOptions` on servers ≥
    /// 4.1.9, a 127-byte fully-qualified name cap below 4.2, and a legacy
    /// `system.indexes` insert fallback below 2.6 (where `createIndexes`
    /// does not exist).
    fn create_indexes_for(
        &self,
        target: &Namespace,
        indexes: &[IndexSpec],
        server_version: &Version,
    ) -> Result<()> {
        let indexes: Vec<IndexSpec> = if self.options.fix_legacy_indexes {
            rewrite_legacy_index_set(indexes.to_vec(), self.options.fix_hashed_dotted_indexes)
        } else {
            indexes.to_vec()
        };
        if indexes.is_empty() {
            return Ok(());
        }

        if *server_version < Version::new(4, 2, 0) {
            let full_name_cap = 127;
            for spec in &indexes {
                let fqn = format!("{}.{}", target.full_name(), spec.name);
                if fqn.len() > full_name_cap {
                    return Err(Error::validation(format!(
                        "index name '{}' would produce a fully-qualified name of {} bytes, \
                         over the {}-byte limit on server versions below 4.2",
                        spec.name,
                        fqn.len(),
                        full_name_cap
                    )));
                }
            }
        }

        if *server_version < Version::new(2, 6, 0) {
            // No `createIndexes` command on servers this old; insert
            // directly into `system.indexes`, one at a time, restoring the
            // `ns` field legacy index catalogs require.
            let system_indexes = Namespace::new(target.database.clone(), "system.indexes");
            for spec in &indexes {
                let mut doc = spec.clone().rewrite_legacy().to_create_indexes_spec();
                doc.insert("ns", target.full_name());
                let results = self.server.insert_many(
                    &system_indexes,
                    vec![doc],
                    &self.options.write_concern,
                )?;
                for result in results {
                    result?;
                }
            }
            return Ok(());
        }

        let ignore_unknown_options = *server_version >= Version::new(4, 1, 9);
        let specs: Vec<Document> = indexes
            .into_iter()
            .map(|spec| spec.rewrite_legacy().to_create_indexes_spec())
            .collect();
        self.server
            .create_indexes(target, specs, ignore_unknown_options)
    }

    fn insert_documents(
        &self,
        intent: &Intent,
        documents: impl Iterator<Item = Document>,
    ) -> Result<(u64, u64)> {
        // A timeseries collection's documents load into its bucket
        // collection, never the user-facing view (§4.4, invariant I7).
        let insert_target = if intent.kind == IntentKind::Timeseries {
            intent.target_namespace().bucket_namespace()
        } else {
            intent.target_namespace().clone()
        };

        let worker_count = default_insertion_workers(self.options.maintain_insertion_order);
        let writer = BulkWriter::new(
            self.server,
            insert_target.clone(),
            self.options.write_concern,
            worker_count,
            self.options.stop_on_error,
        );

        // Buffered rather than streamed past this point so a mixed-schema
        // timeseries retry (§7, code 408) can replay the same documents
        // after the corrective collMod; already-inserted documents come
        // back as ignorable duplicate-key errors on the retry.
        let buffered: Vec<Document> = documents.collect();
        let report = match writer.run(buffered.iter().cloned(), &self.cancellation) {
            Ok(report) => report,
            Err(Error::RecoverableServerError { code: 408, .. }) => {
                self.apply_mixed_schema_collmod(intent)?;
                writer.run(buffered.into_iter(), &self.cancellation)?
            }
            Err(e) => return Err(e),
        };

        info!(
            "restored {} documents into {} ({} skipped)",
            report.inserted, insert_target, report.skipped
        );
        Ok((report.inserted, report.skipped))
    }

    /// Turns on mixed-schema bucket tolerance on `intent`'s bucket
    /// collection, using the real server collMod flag name (§4.5 point 6,
    /// §7).
    fn apply_mixed_schema_collmod(&self, intent: &Intent) -> Result<()> {
        let bucket = intent.target_namespace().bucket_namespace();
        let command = doc! {
            "collMod": bucket.collection.clone(),
            "timeseriesBucketsMayHaveMixedSchemaData": true,
        };
        self.server
            .run_command(&bucket.database, command)?
            .into_result(&bucket.database)?;
        Ok(())
    }
}

/// The namespace a restored intent's documents should actually be read
/// from: a timeseries collection's data file is filed under its bucket
/// collection's escaped name, not the user-facing one (§4.4, §6).
fn restore_source_namespace(intent: &Intent) -> Namespace {
    if intent.kind == IntentKind::Timeseries {
        intent.namespace.bucket_namespace()
    } else {
        intent.namespace.clone()
    }
}
