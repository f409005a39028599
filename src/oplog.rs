//! Oplog capture and replay: tails operations around a dump, and filters,
//! transforms, and applies them during a restore (spec §4.7).

use bson::{doc, Bson, Document};

use crate::error::{Error, Result};
use crate::server::ServerHandle;

/// The oplog engine's state machine. A restore drives one instance of this
/// through `READING` → `FILTER` → `TRANSFORM` → `APPLY` per batch of
/// captured operations; `IDLE` is both the start and (on success) the end
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OplogState {
    Idle,
    Reading,
    Filter,
    Transform,
    Apply,
    Done,
    Failed,
}

/// Namespaces whose operations are always dropped rather than replayed:
/// session and cache bookkeeping collections that are local to the server
/// that generated them.
fn is_filtered_namespace(ns: &str) -> bool {
    ns.starts_with("config.system.sessions") || ns.starts_with("config.cache.")
}

/// Command names dropped outright: index builds are recreated from
/// collection metadata, not replayed as commands, and a no-op with an empty
/// payload carries nothing worth applying.
fn is_filtered_command(op: &Document) -> bool {
    if let Ok(cmd) = op.get_document("o") {
        if cmd.contains_key("startIndexBuild") || cmd.contains_key("abortIndexBuild") {
            return true;
        }
    }
    if op.get_str("op").unwrap_or("") == "n" {
        return op
            .get_document("o")
            .map(|o| o.is_empty())
            .unwrap_or(true);
    }
    false
}

/// Applies the `commitIndexBuild` → `createIndexes` rewrite: a 4.4+ oplog
/// records index builds as a two-phase `startIndexBuild`/`commitIndexBuild`
/// pair, but a replayed `createIndexes` command achieves the same result in
/// one step and the restore pipeline's createIndexes/legacy index path
/// already handles this shape everywhere else.
fn transform_op(mut op: Document) -> Option<Document> {
    if let Ok(cmd) = op.get_document("o") {
        if let (Ok(indexes), Ok(collection)) =
            (cmd.get_array("indexes"), cmd.get_str("commitIndexBuild"))
        {
            let rewritten = doc! {
                "createIndexes": collection.to_owned(),
                "indexes": Bson::Array(indexes.clone()),
            };
            op.insert("o", Bson::Document(rewritten));
            return Some(op);
        }
    }
    // A bare `createIndexes` command (no `commitIndexBuild` wrapper) passes
    // through unchanged; it is already the shape restore's index path expects.
    Some(op)
}

/// Runs one batch of raw oplog entries through filter and transform, in
/// order, dropping filtered entries and rewriting the rest.
pub fn prepare_batch(raw_ops: Vec<Document>) -> Vec<Document> {
    raw_ops
        .into_iter()
        .filter(|op| {
            let ns = op.get_str("ns").unwrap_or("");
            !is_filtered_namespace(ns) && !is_filtered_command(op)
        })
        .filter_map(transform_op)
        .collect()
}

/// The three collections whose presence indicates an in-progress
/// resharding operation (§4.4): any write to one of them, captured mid-dump
/// via the oplog, means the oplog window captured so far can no longer be
/// assumed to apply cleanly to the collection's final shard key.
pub const RESHARDING_COLLECTIONS: &[&str] = &[
    "config.reshardingOperations",
    "config.localReshardingOperations.donor",
    "config.localReshardingOperations.recipient",
];

fn is_resharding_event(op: &Document) -> bool {
    RESHARDING_COLLECTIONS.contains(&op.get_str("ns").unwrap_or(""))
}

/// Checked once before an oplog-capturing dump begins (§4.4): fails fast if
/// any of the three resharding-tracking collections already exist in
/// `config`, rather than discovering the condition partway through the
/// oplog tail.
pub fn check_not_resharding(server: &dyn ServerHandle) -> Result<()> {
    let collections = server.list_collections("config")?;
    for collection in collections {
        if let Ok(name) = collection.get_str("name") {
            let ns = format!("config.{}", name);
            if RESHARDING_COLLECTIONS.contains(&ns.as_str()) {
                return Err(Error::FatalServerError {
                    namespace: ns,
                    message: "cannot dump with oplog while resharding".into(),
                });
            }
        }
    }
    Ok(())
}

/// Captures the oplog window spanning a dump, from `start` (inclusive) up
/// to whenever the caller stops calling `next`. Detects a resharding event
/// partway through and turns it into a fatal error per §4.7's Non-goals
/// note on resharding-mid-dump.
pub struct OplogCapture<'a> {
    cursor: Box<dyn crate::server::Cursor + 'a>,
    state: OplogState,
}

impl<'a> OplogCapture<'a> {
    pub fn start(server: &'a dyn ServerHandle, after_ts: Option<Bson>) -> Result<Self> {
        let cursor = server.oplog_cursor(after_ts)?;
        Ok(OplogCapture {
            cursor,
            state: OplogState::Reading,
        })
    }

    pub fn state(&self) -> OplogState {
        self.state
    }

    /// Reads the next raw operation, failing fatally if it is a resharding
    /// event.
    pub fn next_op(&mut self) -> Option<Result<Document>> {
        let next = self.cursor.next()?;
        match next {
            Ok(op) if is_resharding_event(&op) => {
                self.state = OplogState::Failed;
                Some(Err(Error::FatalServerError {
                    namespace: "config.collections".into(),
                    message: "collection was resharded during dump; oplog window is invalid"
                        .into(),
                }))
            }
            Ok(op) => Some(Ok(op)),
            Err(e) => {
                self.state = OplogState::Failed;
                Some(Err(e))
            }
        }
    }
}

/// Applies a prepared, filtered-and-transformed batch to `server` via the
/// atomic apply-ops primitive, advancing through `FILTER` → `TRANSFORM` →
/// `APPLY` for bookkeeping/logging purposes.
pub fn replay_batch(server: &dyn ServerHandle, raw_ops: Vec<Document>) -> Result<OplogState> {
    let prepared = prepare_batch(raw_ops);
    if prepared.is_empty() {
        return Ok(OplogState::Done);
    }
    server.apply_ops(prepared)?;
    Ok(OplogState::Done)
}
