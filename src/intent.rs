//! Intent/plan model: one [`Intent`] per namespace to dump or restore, and
//! the [`IntentManager`] that orders and hands them out to worker threads
//! (spec §4.3).

use std::collections::VecDeque;
use std::sync::Mutex;

use bson::Document;

use crate::error::{Error, Result};
use crate::metadata::CollectionMetadata;
use crate::namespace::Namespace;

/// What kind of namespace an intent represents. Ordering and handling rules
/// differ per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentKind {
    Normal,
    View,
    Timeseries,
    Users,
    Roles,
    AuthVersion,
    Oplog,
}

/// One namespace's worth of work: where its data and metadata live, and
/// enough bookkeeping to drive both dump and restore.
#[derive(Debug, Clone)]
pub struct Intent {
    pub namespace: Namespace,
    pub kind: IntentKind,
    /// Set when an `nsFrom`/`nsTo` rename applies on restore.
    pub rename_to: Option<Namespace>,
    pub metadata: Option<CollectionMetadata>,
    /// Options document used to (re)create the collection.
    pub options: Document,
    pub size_hint: i64,
}

impl Intent {
    pub fn new(namespace: Namespace, kind: IntentKind) -> Self {
        Intent {
            namespace,
            kind,
            rename_to: None,
            metadata: None,
            options: Document::new(),
            size_hint: 0,
        }
    }

    /// The namespace this intent should actually write to: the rename
    /// target if one applies, otherwise the original namespace.
    pub fn target_namespace(&self) -> &Namespace {
        self.rename_to.as_ref().unwrap_or(&self.namespace)
    }
}

/// Relative priority used to sort intents before handing them to the worker
/// pool. Lower sorts first. Mirrors §4.3: user-visible collections go
/// first, views are deferred until their backing collections exist, the
/// `admin` database's users/roles/authVersion namespaces are always last
/// since they live in the database processed last by both tools, and the
/// oplog trails everything else (dump's tail is captured out-of-band of
/// this queue; restore's replay runs only after every other intent
/// finishes, per §5's ordering guarantees). A timeseries collection's
/// bucket namespace is dumped and restored together with it, never
/// standalone.
fn dump_priority(kind: IntentKind) -> u8 {
    match kind {
        IntentKind::Normal | IntentKind::Timeseries => 0,
        IntentKind::View => 1,
        IntentKind::Users | IntentKind::Roles | IntentKind::AuthVersion => 2,
        IntentKind::Oplog => 3,
    }
}

fn restore_priority(kind: IntentKind) -> u8 {
    match kind {
        IntentKind::Normal | IntentKind::Timeseries => 0,
        IntentKind::View => 1,
        IntentKind::Users | IntentKind::Roles | IntentKind::AuthVersion => 2,
        IntentKind::Oplog => 3,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Dump,
    Restore,
}

/// Collects intents, orders them per §4.3, and hands them out to a worker
/// pool one at a time. Safe to share across threads: `pop` is the only
/// mutating operation workers call, and it is synchronized internally.
pub struct IntentManager {
    direction: Direction,
    queue: Mutex<VecDeque<Intent>>,
}

impl IntentManager {
    pub fn new(direction: Direction) -> Self {
        IntentManager {
            direction,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Adds `intents` and re-sorts the whole queue by the direction's
    /// priority rules, preserving relative order within a priority tier
    /// (namespaces are otherwise processed in discovery order).
    pub fn extend(&self, intents: impl IntoIterator<Item = Intent>) {
        let mut queue = self.queue.lock().unwrap();
        queue.extend(intents);
        let priority = match self.direction {
            Direction::Dump => dump_priority,
            Direction::Restore => restore_priority,
        };
        let mut as_vec: Vec<Intent> = queue.drain(..).collect();
        as_vec.sort_by_key(|intent| priority(intent.kind));
        queue.extend(as_vec);
    }

    /// Removes and returns the next intent, if any remain.
    pub fn pop(&self) -> Option<Intent> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Upgrades `base` (as derived from a collection's own metadata) to
/// `Users`/`Roles`/`AuthVersion` when `namespace` is one of `admin`'s three
/// special authorization namespaces, so both pipelines route them through
/// the merge-command path instead of a plain create-and-insert (§4.7).
pub fn classify_admin_namespace(namespace: &Namespace, base: IntentKind) -> IntentKind {
    if base != IntentKind::Normal || namespace.database != "admin" {
        return base;
    }
    match namespace.collection.as_str() {
        "system.users" => IntentKind::Users,
        "system.roles" => IntentKind::Roles,
        "system.version" => IntentKind::AuthVersion,
        _ => base,
    }
}

/// Validates that a timeseries intent's bucket namespace is never presented
/// as a standalone user-facing namespace (invariant I7).
pub fn validate_timeseries_pairing(intent: &Intent) -> Result<()> {
    if intent.kind == IntentKind::Timeseries && intent.namespace.is_bucket_collection() {
        return Err(Error::validation(format!(
            "{} is a system.buckets collection and cannot be dumped or restored directly",
            intent.namespace
        )));
    }
    Ok(())
}
