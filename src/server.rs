//! `ServerHandle`: the seam between the dump/restore pipelines and an
//! actual server connection (spec §A.5). The pipelines are written entirely
//! against this trait; a real implementation wraps a connection pool the way
//! the rest of this crate's original `client` module did, while tests and
//! examples use the in-memory [`mock::MockServer`].

use bson::{Bson, Document};
use semver::Version;

use crate::common::{ReadPreference, WriteConcern};
use crate::error::{Error, Result};
use crate::namespace::Namespace;

/// A single command reply, as returned by `run_command`. Mirrors the shape
/// of a real server reply closely enough that `classify_write_failure` can
/// be driven directly off it.
#[derive(Debug, Clone)]
pub struct CommandReply {
    pub ok: bool,
    pub code: Option<i32>,
    pub error_message: Option<String>,
    pub body: Document,
}

impl CommandReply {
    pub fn into_result(self, namespace: &str) -> Result<Document> {
        if self.ok {
            return Ok(self.body);
        }
        let failure = match self.code {
            Some(code) => crate::error::WriteFailure::Coded(
                code,
                self.error_message.unwrap_or_default(),
            ),
            None => crate::error::WriteFailure::Unacknowledged,
        };
        Err(crate::error::classify_write_failure(namespace, failure))
    }
}

/// An open, ordered cursor over a collection's documents.
pub trait Cursor: Iterator<Item = Result<Document>> + Send {}
impl<T: Iterator<Item = Result<Document>> + Send> Cursor for T {}

/// Everything the dump and restore pipelines need from a server connection.
/// Deliberately narrow: no connection management, no authentication, no
/// wire-protocol detail leaks through this boundary.
pub trait ServerHandle: Send + Sync {
    /// The server's reported version, used to gate options that only exist
    /// on newer releases (clustered indexes, timeseries collMod, etc).
    fn server_version(&self) -> Version;

    /// Opens a cursor over `namespace` honoring `read_preference`, optionally
    /// restricted to `filter` (used by the timeseries metadata-only query
    /// restriction, spec §4.3).
    fn find(
        &self,
        namespace: &Namespace,
        filter: Option<Document>,
        read_preference: &ReadPreference,
    ) -> Result<Box<dyn Cursor>>;

    /// Inserts a batch of documents, honoring `write_concern`. Each element
    /// of the returned vector corresponds positionally to `documents` and is
    /// `Ok(())` or the per-document write failure.
    fn insert_many(
        &self,
        namespace: &Namespace,
        documents: Vec<Document>,
        write_concern: &WriteConcern,
    ) -> Result<Vec<Result<()>>>;

    fn run_command(&self, database: &str, command: Document) -> Result<CommandReply>;

    /// Builds `specs` via `createIndexes`. `ignore_unknown_options` is
    /// forwarded as the command's `ignoreUnknownIndexOptions` flag, which
    /// restore only sets on servers ≥ 4.1.9 (§4.5 point 4).
    fn create_indexes(
        &self,
        namespace: &Namespace,
        specs: Vec<Document>,
        ignore_unknown_options: bool,
    ) -> Result<()>;

    fn list_collections(&self, database: &str) -> Result<Vec<Document>>;

    fn list_databases(&self) -> Result<Vec<String>>;

    fn drop_collection(&self, namespace: &Namespace) -> Result<()>;

    /// Applies a batch of oplog-shaped operations atomically via the
    /// server's bulk apply-ops primitive (spec §4.7).
    fn apply_ops(&self, operations: Vec<Document>) -> Result<()>;

    /// Opens a tailable cursor over the oplog starting after `after_ts`, or
    /// from the current tail if `None`.
    fn oplog_cursor(&self, after_ts: Option<Bson>) -> Result<Box<dyn Cursor>>;

    /// The oplog's current tail position, used to mark the start of an
    /// oplog-capturing dump's window before any collection cursor opens
    /// (§4.4, §5).
    fn oplog_position(&self) -> Result<Bson>;
}

/// Convenience helper: runs a command and maps its reply straight to
/// `Result<Document>`, folding server-side failures through the §7
/// taxonomy.
pub fn run_command_checked(
    server: &dyn ServerHandle,
    database: &str,
    command: Document,
) -> Result<Document> {
    server
        .run_command(database, command)?
        .into_result(database)
}

pub fn require_version(server: &dyn ServerHandle, minimum: &Version) -> Result<()> {
    let actual = server.server_version();
    if &actual < minimum {
        return Err(Error::validation(format!(
            "server version {} is older than the minimum required {}",
            actual, minimum
        )));
    }
    Ok(())
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// A single namespace's in-memory document store, for tests.
    #[derive(Default)]
    struct Collection {
        documents: Vec<Document>,
        indexes: Vec<Document>,
        /// The `type` a `listCollections` entry reports for this namespace;
        /// `"collection"` unless a test declares otherwise via
        /// [`MockServer::declare_collection`].
        kind: Option<String>,
        /// The `options` a `listCollections` entry reports for this
        /// namespace, e.g. a timeseries spec or the mixed-schema flag.
        options: Document,
    }

    /// An in-memory `ServerHandle` used by the dump/restore pipeline tests
    /// and by integration tests under `tests/`.
    pub struct MockServer {
        version: Version,
        collections: Mutex<HashMap<String, Collection>>,
        oplog: Mutex<Vec<Document>>,
        /// The most recent `run_command` call, for tests that need to assert
        /// on a command's exact shape (e.g. the users/roles merge command).
        last_command: Mutex<Option<(String, Document)>>,
    }

    impl MockServer {
        pub fn new(version: &str) -> Self {
            MockServer {
                version: Version::parse(version).unwrap(),
                collections: Mutex::new(HashMap::new()),
                oplog: Mutex::new(Vec::new()),
                last_command: Mutex::new(None),
            }
        }

        pub fn seed(&self, namespace: &Namespace, documents: Vec<Document>) {
            self.collections
                .lock()
                .unwrap()
                .entry(namespace.full_name())
                .or_default()
                .documents = documents;
        }

        /// Declares the `listCollections` `type` and `options` a namespace
        /// should report, for tests exercising timeseries/view enumeration.
        pub fn declare_collection(&self, namespace: &Namespace, kind: &str, options: Document) {
            let mut collections = self.collections.lock().unwrap();
            let entry = collections.entry(namespace.full_name()).or_default();
            entry.kind = Some(kind.to_owned());
            entry.options = options;
        }

        pub fn documents(&self, namespace: &Namespace) -> Vec<Document> {
            self.collections
                .lock()
                .unwrap()
                .get(&namespace.full_name())
                .map(|c| c.documents.clone())
                .unwrap_or_default()
        }

        pub fn indexes(&self, namespace: &Namespace) -> Vec<Document> {
            self.collections
                .lock()
                .unwrap()
                .get(&namespace.full_name())
                .map(|c| c.indexes.clone())
                .unwrap_or_default()
        }

        /// The `(database, command)` of the most recent `run_command` call.
        pub fn last_command(&self) -> Option<(String, Document)> {
            self.last_command.lock().unwrap().clone()
        }
    }

    impl ServerHandle for MockServer {
        fn server_version(&self) -> Version {
            self.version.clone()
        }

        fn find(
            &self,
            namespace: &Namespace,
            _filter: Option<Document>,
            _read_preference: &ReadPreference,
        ) -> Result<Box<dyn Cursor>> {
            let docs = self.documents(namespace);
            Ok(Box::new(docs.into_iter().map(Ok)))
        }

        fn insert_many(
            &self,
            namespace: &Namespace,
            documents: Vec<Document>,
            _write_concern: &WriteConcern,
        ) -> Result<Vec<Result<()>>> {
            let mut collections = self.collections.lock().unwrap();
            let collection = collections.entry(namespace.full_name()).or_default();
            let mut results = Vec::with_capacity(documents.len());
            for doc in documents {
                let id = doc.get("_id").cloned();
                let duplicate = id
                    .as_ref()
                    .map(|id| collection.documents.iter().any(|d| d.get("_id") == Some(id)))
                    .unwrap_or(false);
                if duplicate {
                    results.push(Err(crate::error::classify_write_failure(
                        &namespace.full_name(),
                        crate::error::WriteFailure::Coded(11000, "duplicate key".into()),
                    )));
                } else {
                    collection.documents.push(doc);
                    results.push(Ok(()));
                }
            }
            Ok(results)
        }

        fn run_command(&self, database: &str, command: Document) -> Result<CommandReply> {
            *self.last_command.lock().unwrap() = Some((database.to_owned(), command));
            Ok(CommandReply {
                ok: true,
                code: None,
                error_message: None,
                body: Document::new(),
            })
        }

        fn create_indexes(
            &self,
            namespace: &Namespace,
            specs: Vec<Document>,
            _ignore_unknown_options: bool,
        ) -> Result<()> {
            let mut collections = self.collections.lock().unwrap();
            let collection = collections.entry(namespace.full_name()).or_default();
            collection.indexes.extend(specs);
            Ok(())
        }

        fn list_collections(&self, database: &str) -> Result<Vec<Document>> {
            let collections = self.collections.lock().unwrap();
            Ok(collections
                .iter()
                .filter_map(|(full, c)| Namespace::parse(full).map(|ns| (ns, c)))
                .filter(|(ns, _)| ns.database == database)
                .map(|(ns, c)| {
                    bson::doc! {
                        "name": ns.collection,
                        "type": c.kind.clone().unwrap_or_else(|| "collection".to_owned()),
                        "options": c.options.clone(),
                    }
                })
                .collect())
        }

        fn list_databases(&self) -> Result<Vec<String>> {
            let collections = self.collections.lock().unwrap();
            let mut dbs: Vec<String> = collections
                .keys()
                .filter_map(|full| Namespace::parse(full))
                .map(|ns| ns.database)
                .collect();
            dbs.sort();
            dbs.dedup();
            Ok(dbs)
        }

        fn drop_collection(&self, namespace: &Namespace) -> Result<()> {
            self.collections.lock().unwrap().remove(&namespace.full_name());
            Ok(())
        }

        fn apply_ops(&self, operations: Vec<Document>) -> Result<()> {
            self.oplog.lock().unwrap().extend(operations);
            Ok(())
        }

        fn oplog_cursor(&self, _after_ts: Option<Bson>) -> Result<Box<dyn Cursor>> {
            let ops = self.oplog.lock().unwrap().clone();
            Ok(Box::new(ops.into_iter().map(Ok)))
        }

        fn oplog_position(&self) -> Result<Bson> {
            Ok(Bson::Int64(self.oplog.lock().unwrap().len() as i64))
        }
    }

    #[test]
    fn insert_many_rejects_duplicate_ids() {
        let server = MockServer::new("6.0.0");
        let ns = Namespace::new("db", "coll");
        let wc = WriteConcern::default();
        let results = server
            .insert_many(&ns, vec![bson::doc! {"_id": 1}], &wc)
            .unwrap();
        assert!(results[0].is_ok());

        let results = server
            .insert_many(&ns, vec![bson::doc! {"_id": 1}], &wc)
            .unwrap();
        assert!(matches!(
            results[0],
            Err(Error::IgnorableWriteError { code: Some(11000), .. })
        ));
    }

    #[test]
    fn require_version_rejects_too_old() {
        let server = MockServer::new("4.0.0");
        let err = require_version(&server, &Version::parse("5.0.0").unwrap());
        assert!(err.is_err());
    }
}
