//! Archive wire framing (spec §4.1, §6).
//!
//! The archive is a sequence of length-prefixed messages of three kinds:
//! prelude (exactly one, first), namespace header/terminator, and body
//! chunks. Control messages (prelude, namespace header/terminator) are
//! tagged with a negative `i32` discriminator that can never collide with a
//! real BSON document length (always positive); body chunks carry no tag at
//! all and are read back using their own BSON length prefix. This lets a
//! reader tell the two apart by peeking the first four bytes of a message.

use std::io::{self, Read, Write};

use bson::{doc, Document};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::namespace::Namespace;

const MAGIC_PRELUDE: i32 = -0x1ABE11;
const MAGIC_NAMESPACE_OPEN: i32 = -0x1ABE22;
const MAGIC_NAMESPACE_CLOSE: i32 = -0x1ABE33;

/// One `(database, collection, metadata, size)` entry in the prelude.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreludeEntry {
    pub database: String,
    pub collection: String,
    /// JSON-encoded metadata document, per spec §6 ("Metadata file").
    pub metadata: String,
    pub size: i64,
}

/// The archive's single leading record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prelude {
    pub tool_version: String,
    pub server_version: String,
    pub format_version: i32,
    pub namespaces: Vec<PreludeEntry>,
}

impl Prelude {
    pub fn new(tool_version: impl Into<String>, server_version: impl Into<String>) -> Self {
        Prelude {
            tool_version: tool_version.into(),
            server_version: server_version.into(),
            format_version: 1,
            namespaces: Vec::new(),
        }
    }
}

/// A message read back from the archive stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ArchiveMessage {
    Prelude(Prelude),
    NamespaceOpen(Namespace),
    NamespaceClose(Namespace),
    Body(Document),
}

fn namespace_doc(ns: &Namespace) -> Document {
    doc! { "db": ns.database.clone(), "collection": ns.collection.clone() }
}

fn namespace_from_doc(doc: &Document) -> Result<Namespace> {
    let db = doc
        .get_str("db")
        .map_err(|_| Error::format("namespace frame missing 'db'"))?;
    let coll = doc
        .get_str("collection")
        .map_err(|_| Error::format("namespace frame missing 'collection'"))?;
    Ok(Namespace::new(db, coll))
}

fn write_tagged<W: Write>(writer: &mut W, magic: i32, payload: &Document) -> Result<()> {
    writer.write_i32::<LittleEndian>(magic).map_err(Error::Io)?;
    payload.to_writer(writer).map_err(Error::BsonEncode)
}

/// Writes the prelude. Must be called exactly once, before any namespace
/// frames.
pub fn write_prelude<W: Write>(writer: &mut W, prelude: &Prelude) -> Result<()> {
    let doc = bson::to_document(prelude).map_err(Error::BsonEncode)?;
    write_tagged(writer, MAGIC_PRELUDE, &doc)
}

pub fn write_namespace_open<W: Write>(writer: &mut W, ns: &Namespace) -> Result<()> {
    write_tagged(writer, MAGIC_NAMESPACE_OPEN, &namespace_doc(ns))
}

pub fn write_namespace_close<W: Write>(writer: &mut W, ns: &Namespace) -> Result<()> {
    write_tagged(writer, MAGIC_NAMESPACE_CLOSE, &namespace_doc(ns))
}

pub fn write_body<W: Write>(writer: &mut W, doc: &Document) -> Result<()> {
    doc.to_writer(writer).map_err(Error::BsonEncode)
}

/// Reads the next message from the stream. Returns `Ok(None)` on a clean EOF
/// at a message boundary.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<ArchiveMessage>> {
    let mut head = [0u8; 4];
    match reader.read_exact(&mut head) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    }
    let leading = i32::from_le_bytes(head);

    if leading >= 0 {
        // A raw BSON body chunk: `leading` is the document's own length,
        // which we've already consumed the first four bytes of.
        let doc = read_body_with_known_prefix(reader, leading)?;
        return Ok(Some(ArchiveMessage::Body(doc)));
    }

    let payload = read_bson_document(reader)?;
    match leading {
        MAGIC_PRELUDE => {
            let prelude: Prelude = bson::from_document(payload).map_err(Error::BsonDecode)?;
            Ok(Some(ArchiveMessage::Prelude(prelude)))
        }
        MAGIC_NAMESPACE_OPEN => Ok(Some(ArchiveMessage::NamespaceOpen(namespace_from_doc(
            &payload,
        )?))),
        MAGIC_NAMESPACE_CLOSE => Ok(Some(ArchiveMessage::NamespaceClose(namespace_from_doc(
            &payload,
        )?))),
        other => Err(Error::format(format!(
            "unknown archive message kind discriminator {}",
            other
        ))),
    }
}

fn read_bson_document<R: Read>(reader: &mut R) -> Result<Document> {
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|e| short_read_error(e))?;
    let len = i32::from_le_bytes(len_bytes);
    read_body_with_known_prefix(reader, len)
}

fn read_body_with_known_prefix<R: Read>(reader: &mut R, len: i32) -> Result<Document> {
    if len < 5 {
        return Err(Error::format(format!(
            "BSON document length {} is smaller than the minimum of 5 bytes",
            len
        )));
    }
    let mut buf = vec![0u8; len as usize];
    buf[0..4].copy_from_slice(&len.to_le_bytes());
    reader
        .read_exact(&mut buf[4..])
        .map_err(|e| short_read_error(e))?;
    Document::from_reader(&mut buf.as_slice()).map_err(Error::BsonDecode)
}

fn short_read_error(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::format("truncated archive message: short read mid-message")
    } else {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prelude_round_trips() {
        let mut prelude = Prelude::new("1.0.0", "6.0.0");
        prelude.namespaces.push(PreludeEntry {
            database: "db".into(),
            collection: "coll".into(),
            metadata: "{}".into(),
            size: 42,
        });

        let mut buf = Vec::new();
        write_prelude(&mut buf, &prelude).unwrap();
        match read_message(&mut buf.as_slice()).unwrap() {
            Some(ArchiveMessage::Prelude(p)) => assert_eq!(p, prelude),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn namespace_open_close_and_body_round_trip() {
        let ns = Namespace::new("db", "coll");
        let mut buf = Vec::new();
        write_namespace_open(&mut buf, &ns).unwrap();
        write_body(&mut buf, &doc! {"x": 1}).unwrap();
        write_body(&mut buf, &doc! {"x": 2}).unwrap();
        write_namespace_close(&mut buf, &ns).unwrap();

        let mut cursor = buf.as_slice();
        assert_eq!(
            read_message(&mut cursor).unwrap(),
            Some(ArchiveMessage::NamespaceOpen(ns.clone()))
        );
        assert_eq!(
            read_message(&mut cursor).unwrap(),
            Some(ArchiveMessage::Body(doc! {"x": 1}))
        );
        assert_eq!(
            read_message(&mut cursor).unwrap(),
            Some(ArchiveMessage::Body(doc! {"x": 2}))
        );
        assert_eq!(
            read_message(&mut cursor).unwrap(),
            Some(ArchiveMessage::NamespaceClose(ns))
        );
        assert_eq!(read_message(&mut cursor).unwrap(), None);
    }

    #[test]
    fn unknown_kind_is_format_error() {
        let mut buf = Vec::new();
        buf.write_i32::<LittleEndian>(-999).unwrap();
        doc! {}.to_writer(&mut buf).unwrap();
        let err = read_message(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, Error::FormatError(_)));
    }

    #[test]
    fn short_read_mid_message_is_format_error() {
        let ns = Namespace::new("db", "coll");
        let mut buf = Vec::new();
        write_namespace_open(&mut buf, &ns).unwrap();
        buf.truncate(buf.len() - 3);
        let err = read_message(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, Error::FormatError(_)));
    }
}
