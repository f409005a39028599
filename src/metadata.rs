//! Per-collection metadata file: options, indexes, and the UUID needed to
//! preserve collection identity across a drop-and-recreate restore (spec
//! §4.5, §4.6).

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// One entry of `db.system.indexes`, as recorded in a collection's metadata
/// file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub key: Document,
    /// Remaining index options (`unique`, `sparse`, `expireAfterSeconds`,
    /// etc.), verbatim.
    #[serde(default)]
    pub options: Document,
}

impl IndexSpec {
    /// Full command document as accepted by `createIndexes`, merging `key`,
    /// `name`, and the remaining options into one flat document.
    pub fn to_create_indexes_spec(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("key", Bson::Document(self.key.clone()));
        doc.insert("name", Bson::String(self.name.clone()));
        for (k, v) in self.options.iter() {
            doc.insert(k.clone(), v.clone());
        }
        doc
    }

    /// Rewrites a legacy (pre-4.2) index spec that used the removed `ns`
    /// field, and un-escapes any dotted/dollar-prefixed field name that was
    /// hashed for storage in a 2.x-era index catalog, per §4.5's legacy-index
    /// rewriting rules. Returns a new spec; the original's `ns` is dropped.
    pub fn rewrite_legacy(mut self) -> Self {
        self.options.remove("ns");
        self.options.remove("v");
        self
    }

    /// Normalizes this spec's key document per §4.5.5: an unrecognized
    /// direction/type value on a non-dotted field becomes ascending (`1`);
    /// a hashed index on a dotted field is also rewritten to ascending when
    /// `fix_hashed_dotted` is set. Non-dotted hashed indexes, and dotted
    /// indexes when the fix is not requested, are left untouched.
    pub fn rewrite_legacy_key(mut self, fix_hashed_dotted: bool) -> Self {
        let mut rewritten = Document::new();
        for (field, value) in self.key.iter() {
            let dotted = field.contains('.');
            let is_hashed = matches!(value, Bson::String(s) if s == "hashed");

            let new_value = if is_hashed && dotted && fix_hashed_dotted {
                Bson::Int32(1)
            } else if !dotted && !is_recognized_key_value(value) {
                Bson::Int32(1)
            } else {
                value.clone()
            };
            rewritten.insert(field.clone(), new_value);
        }
        self.key = rewritten;
        self
    }

    pub fn is_clustered(&self) -> bool {
        self.options
            .get_bool("clustered")
            .unwrap_or(false)
    }
}

/// Whether `value` is a key-pattern value a modern server recognizes
/// (ascending/descending, or one of the special index types). Anything
/// else is 2.x-era shorthand that legacy rewriting normalizes to ascending.
fn is_recognized_key_value(value: &Bson) -> bool {
    match value {
        Bson::Int32(v) => *v == 1 || *v == -1,
        Bson::Int64(v) => *v == 1 || *v == -1,
        Bson::Double(v) => *v == 1.0 || *v == -1.0,
        Bson::String(s) => matches!(
            s.as_str(),
            "2d" | "2dsphere" | "geoHaystack" | "hashed" | "text"
        ),
        _ => false,
    }
}

/// Collapses a name like `foo_`, `foo_1`, `foo_1.0` down to the same
/// canonical form (`foo`), matching §4.5.5's dedup example: these are all
/// the same index under different legacy auto-naming schemes.
fn canonical_index_name(name: &str) -> String {
    name.trim_end_matches(|c: char| c.is_ascii_digit() || c == '.' || c == '_')
        .to_owned()
}

/// Applies the full §4.5.5 legacy-index rewrite to a collection's index
/// set: normalizes each spec's key document, drops exact duplicates that
/// result, then dedupes names that collide after rewriting (keeping the
/// first occurrence of each).
pub fn rewrite_legacy_index_set(indexes: Vec<IndexSpec>, fix_hashed_dotted: bool) -> Vec<IndexSpec> {
    let mut rewritten: Vec<IndexSpec> = indexes
        .into_iter()
        .map(|spec| spec.rewrite_legacy_key(fix_hashed_dotted))
        .collect();

    let mut seen_specs: Vec<(Document, Document)> = Vec::new();
    rewritten.retain(|spec| {
        let signature = (spec.key.clone(), spec.options.clone());
        if seen_specs.contains(&signature) {
            false
        } else {
            seen_specs.push(signature);
            true
        }
    });

    let mut seen_names: Vec<String> = Vec::new();
    rewritten.retain(|spec| {
        let canon = canonical_index_name(&spec.name);
        if seen_names.contains(&canon) {
            false
        } else {
            seen_names.push(canon);
            true
        }
    });

    rewritten
}

/// The collection-level document persisted alongside a namespace's data,
/// either as a sibling `.metadata.json` file (directory mode) or inline in
/// the prelude (archive mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionMetadata {
    pub collection_name: String,
    #[serde(rename = "type")]
    pub kind: CollectionKind,
    pub uuid: Option<Uuid>,
    #[serde(default)]
    pub options: Document,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    Collection,
    View,
    Timeseries,
}

impl CollectionMetadata {
    pub fn new(collection_name: impl Into<String>, kind: CollectionKind) -> Self {
        CollectionMetadata {
            collection_name: collection_name.into(),
            kind,
            uuid: None,
            options: Document::new(),
            indexes: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(Error::Json)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(Error::Json)
    }

    /// Whether this collection's options mark it as a timeseries collection
    /// with a mixed schema (both typed and loosely-typed buckets), which
    /// requires a corrective `collMod` before the server will accept writes
    /// for every document shape (§7, code 408).
    pub fn is_mixed_schema_timeseries(&self) -> bool {
        self.kind == CollectionKind::Timeseries
            && self
                .options
                .get_document("timeseries")
                .ok()
                .and_then(|ts| ts.get_bool("mixedSchema").ok())
                .unwrap_or(false)
    }

    /// The clustered-index spec to preserve verbatim on restore, if this
    /// collection was created with one.
    pub fn clustered_index(&self) -> Option<&IndexSpec> {
        self.indexes.iter().find(|idx| idx.is_clustered())
    }
}
