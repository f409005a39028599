//! Namespace identity and the file-system-safe escaping scheme used for
//! directory-mode output paths (spec §3, §4.4, §4.8, invariant I4).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha1::{Digest, Sha1};

/// `(database, collection)` pair. Collection names may contain any Unicode
/// codepoint other than the namespace separator, including embedded
/// newlines; this type never validates that beyond splitting on the first
/// `.`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Namespace {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Parses a `db.coll` string, splitting on the first `.` only, so that
    /// collection names containing `.` (e.g. `system.buckets.foo`) remain
    /// intact in `collection`.
    pub fn parse(full: &str) -> Option<Namespace> {
        let (db, coll) = full.split_once('.')?;
        Some(Namespace::new(db, coll))
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }

    /// The bucket collection name backing a timeseries collection with this
    /// namespace's collection name.
    pub fn bucket_collection_name(&self) -> String {
        format!("system.buckets.{}", self.collection)
    }

    pub fn bucket_namespace(&self) -> Namespace {
        Namespace::new(self.database.clone(), self.bucket_collection_name())
    }

    /// A `system.buckets.<name>` collection may never be named directly by
    /// the user; only the timeseries machinery is allowed to produce one.
    pub fn is_bucket_collection(&self) -> bool {
        self.collection.starts_with("system.buckets.")
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

/// Bytes left unescaped on disk, matching the RFC 3986 unreserved set plus
/// the path separator handling described in spec §4.8. Every other byte
/// (including the path separator) is percent-encoded.
const ESCAPE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Truncated stem length (bytes) used before appending the `%24` marker and
/// the hash suffix, per spec §4.4.
const TRUNCATED_STEM_LEN: usize = 208;
/// Names whose escaped form is at or under this length need no truncation.
const MAX_ESCAPED_LEN: usize = 255;
const TRUNCATION_MARKER: &str = "%24";

/// Percent-encodes `name` for use as a file-system path component, applying
/// the §4.4 truncation-and-hash scheme when the escaped form would exceed
/// 255 bytes.
pub fn escape_collection_name(name: &str) -> String {
    let escaped: String = utf8_percent_encode(name, ESCAPE_SET).to_string();
    if escaped.len() <= MAX_ESCAPED_LEN {
        return escaped;
    }

    let mut stem: String = escaped.chars().take(TRUNCATED_STEM_LEN).collect();
    // Never split a percent-escape triplet.
    while stem.ends_with('%') || stem.len() >= 2 && stem[stem.len() - 2..].starts_with('%') {
        stem.pop();
    }

    let digest = Sha1::digest(name.as_bytes());
    let hash = URL_SAFE_NO_PAD.encode(digest);
    format!("{}{}{}", stem, TRUNCATION_MARKER, hash)
}

/// Reverses `escape_collection_name` for names that were not truncated.
/// Truncated (hash-suffixed) names cannot be reversed from the path alone —
/// callers must consult the sibling metadata file for the original name, per
/// spec §4.4/§4.8.
pub fn unescape_collection_name(escaped: &str) -> Option<String> {
    if escaped.contains(TRUNCATION_MARKER) {
        return None;
    }
    percent_decode_str(escaped).decode_utf8().ok().map(|s| s.into_owned())
}

/// Returns the sha1 digest of `name`, used to validate the truncated-name
/// suffix against the metadata file's recorded original name (invariant I4).
pub fn name_hash(name: &str) -> Vec<u8> {
    Sha1::digest(name.as_bytes()).to_vec()
}
