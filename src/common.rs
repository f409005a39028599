//! Shared option and value types used across the dump and restore pipelines.

use std::collections::BTreeMap;
use std::str::FromStr;

use bson::{doc, Bson, Document};

use crate::error::Error::ValidationError;
use crate::error::Result;

/// Level of desired consistency and isolation properties of the data read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReadConcernLevel {
    Local,
    Available,
    Majority,
    Linearizable,
    Snapshot,
}

impl ReadConcernLevel {
    fn to_str(&self) -> &'static str {
        match *self {
            ReadConcernLevel::Available => "available",
            ReadConcernLevel::Linearizable => "linearizable",
            ReadConcernLevel::Local => "local",
            ReadConcernLevel::Majority => "majority",
            ReadConcernLevel::Snapshot => "snapshot",
        }
    }
}

impl FromStr for ReadConcernLevel {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "available" => ReadConcernLevel::Available,
            "linearizable" => ReadConcernLevel::Linearizable,
            "local" => ReadConcernLevel::Local,
            "majority" => ReadConcernLevel::Majority,
            "snapshot" => ReadConcernLevel::Snapshot,
            _ => {
                return Err(ValidationError(format!(
                    "could not convert '{}' to ReadConcernLevel",
                    s
                )))
            }
        })
    }
}

/// Indicates the consistency and isolation properties of the data read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReadConcern {
    pub level: ReadConcernLevel,
}

impl ReadConcern {
    pub fn new(level: ReadConcernLevel) -> ReadConcern {
        ReadConcern { level }
    }

    pub fn to_document(&self) -> Document {
        doc! { "level": self.level.to_str() }
    }
}

/// Indicates how a server should be selected during read operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReadMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl ReadMode {
    fn to_str(&self) -> &'static str {
        match *self {
            ReadMode::Primary => "primary",
            ReadMode::PrimaryPreferred => "primaryPreferred",
            ReadMode::Secondary => "secondary",
            ReadMode::SecondaryPreferred => "secondaryPreferred",
            ReadMode::Nearest => "nearest",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReadPreference {
    pub mode: ReadMode,
    /// Filters servers based on the first tag set that matches at least one server.
    pub tag_sets: Vec<BTreeMap<String, String>>,
}

impl ReadPreference {
    pub fn new(mode: ReadMode, tag_sets: Option<Vec<BTreeMap<String, String>>>) -> ReadPreference {
        ReadPreference {
            mode,
            tag_sets: tag_sets.unwrap_or_default(),
        }
    }

    pub fn to_document(&self) -> Document {
        let mut doc = doc! { "mode": self.mode.to_str() };
        let bson_tag_sets: Vec<_> = self
            .tag_sets
            .iter()
            .map(|map| {
                let mut bson_map = Document::new();
                for (key, val) in map.iter() {
                    bson_map.insert(key.clone(), Bson::String(val.to_owned()));
                }
                Bson::Document(bson_map)
            })
            .collect();

        doc.insert("tagSets", Bson::Array(bson_tag_sets));
        doc
    }
}

impl Default for ReadPreference {
    fn default() -> Self {
        ReadPreference::new(ReadMode::Primary, None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteConcern {
    /// Write replication.
    pub w: i32,
    /// Used in conjunction with `w`. Propagation timeout in ms.
    pub w_timeout: i32,
    /// If true, block until write operations have been committed to the journal.
    pub j: bool,
}

impl WriteConcern {
    pub fn new() -> WriteConcern {
        WriteConcern {
            w: 1,
            w_timeout: 0,
            j: false,
        }
    }

    pub fn to_document(&self) -> Document {
        doc! {
            "w": self.w,
            "wtimeout": self.w_timeout,
            "j": self.j,
        }
    }
}

impl Default for WriteConcern {
    fn default() -> Self {
        WriteConcern::new()
    }
}

/// Merges `options` on top of `document`, with `options` fields taking
/// precedence on key collision. Both document and options preserve
/// insertion order, since command shapes (aggregate pipelines, index specs)
/// are order-sensitive.
pub fn merge_options<T: Into<Document>>(document: Document, options: T) -> Document {
    let options_doc: Document = options.into();
    document.into_iter().chain(options_doc.into_iter()).collect()
}

/// Namespace include/exclude filtering shared by dump and restore.
#[derive(Debug, Clone, Default)]
pub struct NamespaceFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub include_prefixes: Vec<String>,
    pub exclude_prefixes: Vec<String>,
}

impl NamespaceFilter {
    pub fn allows(&self, namespace: &str) -> bool {
        if self.exclude.iter().any(|ns| ns == namespace) {
            return false;
        }
        if self
            .exclude_prefixes
            .iter()
            .any(|p| namespace.starts_with(p.as_str()))
        {
            return false;
        }
        if !self.include.is_empty() && !self.include.iter().any(|ns| ns == namespace) {
            return false;
        }
        if !self.include_prefixes.is_empty()
            && !self
                .include_prefixes
                .iter()
                .any(|p| namespace.starts_with(p.as_str()))
        {
            return false;
        }
        true
    }
}

/// A single `nsFrom` → `nsTo` rename rule, with `*` wildcards capturing
/// dot-delimited segments positionally.
#[derive(Debug, Clone)]
pub struct NamespaceRename {
    pub from: String,
    pub to: String,
}

impl NamespaceRename {
    /// Applies this rule to `namespace` if it matches, returning the
    /// renamed namespace. Each `*` in `from` captures one `.`-delimited
    /// segment, substituted positionally into `to`.
    pub fn apply(&self, namespace: &str) -> Option<String> {
        let from_parts: Vec<&str> = self.from.split('.').collect();
        let ns_parts: Vec<&str> = namespace.splitn(from_parts.len(), '.').collect();
        if from_parts.len() != ns_parts.len() {
            return None;
        }

        let mut captures = Vec::new();
        for (pattern, actual) in from_parts.iter().zip(ns_parts.iter()) {
            if *pattern == "*" {
                captures.push(*actual);
            } else if pattern != actual {
                return None;
            }
        }

        let mut capture_iter = captures.into_iter();
        let mut result = String::new();
        for (i, part) in self.to.split('.').enumerate() {
            if i > 0 {
                result.push('.');
            }
            if part == "*" {
                result.push_str(capture_iter.next().unwrap_or(""));
            } else {
                result.push_str(part);
            }
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_filter_include_exclude() {
        let mut f = NamespaceFilter::default();
        f.include.push("db.coll".to_owned());
        assert!(f.allows("db.coll"));
        assert!(!f.allows("db.other"));

        let mut f2 = NamespaceFilter::default();
        f2.exclude.push("db.secret".to_owned());
        assert!(f2.allows("db.coll"));
        assert!(!f2.allows("db.secret"));
    }

    #[test]
    fn rename_wildcard_positional() {
        let rule = NamespaceRename {
            from: "source.*".to_owned(),
            to: "target.*".to_owned(),
        };
        assert_eq!(rule.apply("source.coll").as_deref(), Some("target.coll"));
        assert_eq!(rule.apply("other.coll"), None);
    }

    #[test]
    fn rename_whole_database_wildcard() {
        let rule = NamespaceRename {
            from: "*.events".to_owned(),
            to: "*.events_copy".to_owned(),
        };
        assert_eq!(
            rule.apply("db1.events").as_deref(),
            Some("db1.events_copy")
        );
    }

    #[test]
    fn merge_options_preserves_order_and_overrides() {
        let base = doc! { "a": 1, "b": 2 };
        let merged = merge_options(base, doc! { "b": 3, "c": 4 });
        let keys: Vec<&str> = merged.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(merged.get_i32("b").unwrap(), 3);
    }
}
