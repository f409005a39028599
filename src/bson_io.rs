//! BSON document source/sink streams (spec §4.2).
//!
//! A source reads the 4-byte little-endian length prefix of each document,
//! then the remainder, and hands back the raw bytes (as well as the decoded
//! `Document` on request). A sink writes documents in the same
//! length-prefixed form. Both compose over anything that is `Read`/`Write`:
//! a file, a gzip stream, standard input/output, or an archive
//! demultiplexer/multiplexer channel.

use std::io::{self, BufReader, BufWriter, Read, Write};

use bson::Document;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{Error, Result};

/// Reads a single length-prefixed BSON document's raw bytes from `reader`,
/// validating that the declared length is internally consistent (it must be
/// at least 5 bytes: 4-byte length + trailing NUL) and that the buffer ends
/// with the BSON document terminator (`0x00`).
///
/// Returns `Ok(None)` on a clean EOF at a message boundary. A short read
/// that starts a length prefix but cannot complete it is a `FormatError`.
fn read_raw_document<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    }

    let len = i32::from_le_bytes(len_bytes);
    if len < 5 {
        return Err(Error::format(format!(
            "BSON document length {} is smaller than the minimum of 5 bytes",
            len
        )));
    }

    let mut buf = Vec::with_capacity(len as usize);
    buf.extend_from_slice(&len_bytes);
    buf.resize(len as usize, 0);
    reader.read_exact(&mut buf[4..]).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::format("truncated BSON document: short read mid-message")
        } else {
            Error::Io(e)
        }
    })?;

    if *buf.last().unwrap() != 0 {
        return Err(Error::format(
            "malformed BSON document: missing trailing NUL terminator",
        ));
    }

    Ok(Some(buf))
}

/// A BSON document source: yields raw and decoded documents from an
/// underlying byte stream until EOF.
pub struct BsonSource<R: Read> {
    reader: R,
    err: Option<Error>,
}

impl<R: Read> BsonSource<R> {
    pub fn new(reader: R) -> Self {
        BsonSource { reader, err: None }
    }

    /// Returns the next document, or `None` once the stream is exhausted.
    /// After `next` returns `None`, call `err()` to distinguish a clean EOF
    /// from a stream that failed partway through.
    pub fn next(&mut self) -> Option<Document> {
        if self.err.is_some() {
            return None;
        }
        match read_raw_document(&mut self.reader) {
            Ok(Some(raw)) => match bson::Document::from_reader(&mut raw.as_slice()) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    self.err = Some(Error::BsonDecode(e));
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                self.err = Some(e);
                None
            }
        }
    }

    /// The terminal error, if the source stopped early due to a failure
    /// rather than a clean EOF.
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }
}

impl<R: Read> Iterator for BsonSource<R> {
    type Item = Document;
    fn next(&mut self) -> Option<Document> {
        BsonSource::next(self)
    }
}

/// A BSON document sink: writes documents in length-prefixed form.
pub struct BsonSink<W: Write> {
    writer: W,
}

impl<W: Write> BsonSink<W> {
    pub fn new(writer: W) -> Self {
        BsonSink { writer }
    }

    pub fn write_document(&mut self, doc: &Document) -> Result<()> {
        doc.to_writer(&mut self.writer).map_err(Error::BsonEncode)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(Error::Io)
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Drop for BsonSink<W> {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Opens a buffered, optionally gzip-wrapped, reader over a file path.
pub fn open_reader(path: &std::path::Path, gzip: bool) -> Result<Box<dyn Read>> {
    let file = std::fs::File::open(path).map_err(Error::Io)?;
    let buffered = BufReader::new(file);
    if gzip {
        Ok(Box::new(BufReader::new(GzDecoder::new(buffered))))
    } else {
        Ok(Box::new(buffered))
    }
}

/// Opens a buffered, optionally gzip-wrapped, writer over a file path,
/// truncating any existing file.
pub fn create_writer(path: &std::path::Path, gzip: bool) -> Result<Box<dyn Write>> {
    let file = std::fs::File::create(path).map_err(Error::Io)?;
    let buffered = BufWriter::new(file);
    if gzip {
        Ok(Box::new(GzEncoder::new(buffered, Compression::default())))
    } else {
        Ok(Box::new(buffered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn round_trips_multiple_documents() {
        let docs = vec![doc! {"a": 1}, doc! {"b": "two"}, doc! {"c": [1, 2, 3]}];
        let mut buf = Vec::new();
        {
            let mut sink = BsonSink::new(&mut buf);
            for d in &docs {
                sink.write_document(d).unwrap();
            }
            sink.flush().unwrap();
        }

        let mut source = BsonSource::new(buf.as_slice());
        let read_back: Vec<Document> = std::iter::from_fn(|| source.next()).collect();
        assert_eq!(read_back, docs);
        assert!(source.err().is_none());
    }

    #[test]
    fn empty_stream_yields_no_documents_and_no_error() {
        let mut source = BsonSource::new(&b""[..]);
        assert!(source.next().is_none());
        assert!(source.err().is_none());
    }

    #[test]
    fn truncated_mid_message_is_format_error() {
        let doc = doc! {"a": 1};
        let mut buf = Vec::new();
        doc.to_writer(&mut buf).unwrap();
        buf.truncate(buf.len() - 2);

        let mut source = BsonSource::new(buf.as_slice());
        assert!(source.next().is_none());
        assert!(matches!(source.err(), Some(Error::FormatError(_))));
    }
}
