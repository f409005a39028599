//! Reader-side demultiplexer: a single pump thread walks the archive's
//! interleaved message stream and routes each body chunk to the bounded
//! channel registered for its currently-open namespace (spec §4.1, §5).
//!
//! Every namespace the prelude names gets a channel up front, so a restore
//! worker can call [`ArchiveDemux::take_reader`] for its namespace whenever
//! it is scheduled, independent of how far the pump thread has read.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use bson::Document;
use crossbeam_channel::{bounded, Receiver, Sender};

use super::codec::{self, ArchiveMessage, Prelude};
use crate::error::{Error, Result};
use crate::namespace::Namespace;

struct Shared {
    receivers: Mutex<HashMap<Namespace, Receiver<Document>>>,
}

/// Pumps one archive's messages into per-namespace channels.
pub struct ArchiveDemux {
    shared: Arc<Shared>,
    pump: Option<JoinHandle<Result<()>>>,
}

impl ArchiveDemux {
    /// Reads the prelude synchronously, then spawns the pump thread and
    /// returns both.
    pub fn new<R: Read + Send + 'static>(mut reader: R) -> Result<(Self, Prelude)> {
        let prelude = match codec::read_message(&mut reader)? {
            Some(ArchiveMessage::Prelude(p)) => p,
            Some(_) => return Err(Error::format("archive does not begin with a prelude")),
            None => return Err(Error::format("archive is empty")),
        };

        let mut receivers = HashMap::new();
        let mut senders: HashMap<Namespace, Sender<Document>> = HashMap::new();
        for entry in &prelude.namespaces {
            let ns = Namespace::new(entry.database.clone(), entry.collection.clone());
            // Bounded like the bulk-insert subpool channel; a slow consumer
            // applies backpressure all the way to the pump thread's reads.
            let (tx, rx) = bounded::<Document>(256);
            senders.insert(ns.clone(), tx);
            receivers.insert(ns, rx);
        }

        let pump = thread::Builder::new()
            .name("archive-demux".into())
            .spawn(move || -> Result<()> {
                let mut current: Option<Sender<Document>> = None;
                loop {
                    match codec::read_message(&mut reader)? {
                        None => break,
                        Some(ArchiveMessage::Prelude(_)) => {
                            return Err(Error::format("unexpected second prelude in archive"))
                        }
                        Some(ArchiveMessage::NamespaceOpen(ns)) => {
                            current = senders.get(&ns).cloned();
                            if current.is_none() {
                                return Err(Error::format(format!(
                                    "archive opened namespace {} absent from its own prelude",
                                    ns
                                )));
                            }
                        }
                        Some(ArchiveMessage::Body(doc)) => {
                            let sender = current.as_ref().ok_or_else(|| {
                                Error::format("archive body chunk with no namespace open")
                            })?;
                            if sender.send(doc).is_err() {
                                // The consumer dropped its reader early (e.g. a
                                // restore worker failed and bailed); nothing
                                // left to do but keep draining the stream.
                            }
                        }
                        Some(ArchiveMessage::NamespaceClose(_)) => {
                            current = None;
                        }
                    }
                }
                Ok(())
            })
            .expect("failed to spawn archive-demux thread");

        Ok((
            ArchiveDemux {
                shared: Arc::new(Shared {
                    receivers: Mutex::new(receivers),
                }),
                pump: Some(pump),
            },
            prelude,
        ))
    }

    /// Takes the reader for `namespace`, if present in the prelude and not
    /// already taken.
    pub fn take_reader(&self, namespace: &Namespace) -> Option<NamespaceReader> {
        self.shared
            .receivers
            .lock()
            .unwrap()
            .remove(namespace)
            .map(|receiver| NamespaceReader { receiver })
    }

    /// Waits for the pump thread to finish, returning its first error.
    pub fn finish(mut self) -> Result<()> {
        match self.pump.take() {
            Some(pump) => pump.join().expect("archive-demux thread panicked"),
            None => Ok(()),
        }
    }
}

/// A single namespace's demultiplexed body stream.
pub struct NamespaceReader {
    receiver: Receiver<Document>,
}

impl Iterator for NamespaceReader {
    type Item = Document;
    fn next(&mut self) -> Option<Document> {
        self.receiver.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::codec::{write_body, write_namespace_close, write_namespace_open};
    use bson::doc;

    fn build_archive() -> Vec<u8> {
        let mut prelude = Prelude::new("1.0.0", "6.0.0");
        prelude.namespaces.push(codec::PreludeEntry {
            database: "db".into(),
            collection: "a".into(),
            metadata: "{}".into(),
            size: 0,
        });
        prelude.namespaces.push(codec::PreludeEntry {
            database: "db".into(),
            collection: "b".into(),
            metadata: "{}".into(),
            size: 0,
        });

        let mut buf = Vec::new();
        codec::write_prelude(&mut buf, &prelude).unwrap();

        let a = Namespace::new("db", "a");
        let b = Namespace::new("db", "b");
        write_namespace_open(&mut buf, &a).unwrap();
        write_body(&mut buf, &doc! {"n": 1}).unwrap();
        write_namespace_close(&mut buf, &a).unwrap();
        write_namespace_open(&mut buf, &b).unwrap();
        write_body(&mut buf, &doc! {"n": 2}).unwrap();
        write_body(&mut buf, &doc! {"n": 3}).unwrap();
        write_namespace_close(&mut buf, &b).unwrap();
        buf
    }

    #[test]
    fn routes_each_namespace_to_its_own_reader() {
        let buf = build_archive();
        let (demux, prelude) = ArchiveDemux::new(buf.as_slice()).unwrap();
        assert_eq!(prelude.namespaces.len(), 2);

        let a_docs: Vec<Document> = demux.take_reader(&Namespace::new("db", "a")).unwrap().collect();
        assert_eq!(a_docs, vec![doc! {"n": 1}]);

        let b_docs: Vec<Document> = demux.take_reader(&Namespace::new("db", "b")).unwrap().collect();
        assert_eq!(b_docs, vec![doc! {"n": 2}, doc! {"n": 3}]);

        demux.finish().unwrap();
    }

    #[test]
    fn unknown_namespace_returns_none() {
        let buf = build_archive();
        let (demux, _) = ArchiveDemux::new(buf.as_slice()).unwrap();
        assert!(demux.take_reader(&Namespace::new("db", "nope")).is_none());
        // Drain the known readers so the pump thread can reach EOF cleanly.
        demux.take_reader(&Namespace::new("db", "a")).unwrap().count();
        demux.take_reader(&Namespace::new("db", "b")).unwrap().count();
        demux.finish().unwrap();
    }
}
