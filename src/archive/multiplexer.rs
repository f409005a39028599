//! Writer-side multiplexer: collection workers each own a [`NamespaceWriter`]
//! handle and send frames to a single background thread that owns the
//! underlying sink, serializing concurrent writers into one interleaved
//! stream (spec §4.1, §5).
//!
//! Workers never touch the sink directly. This is what lets namespace `A`'s
//! body chunks interleave with namespace `B`'s in the archive while still
//! guaranteeing that no two threads ever write for the *same* namespace at
//! once: each worker owns exclusive use of its own [`NamespaceWriter`] for
//! the lifetime of its namespace.

use std::io::Write;
use std::thread::{self, JoinHandle};

use bson::Document;
use crossbeam_channel::{bounded, Sender};

use super::codec::{self, Prelude};
use crate::error::{Error, Result};
use crate::namespace::Namespace;

enum Frame {
    Open(Namespace),
    Body(Namespace, Document),
    Close(Namespace),
}

/// Owns the archive's output stream. Spawns one background thread that
/// drains frames sent by any number of [`NamespaceWriter`] handles and
/// writes them to `sink` in the order received.
pub struct ArchiveMultiplexer {
    sender: Sender<Frame>,
    worker: Option<JoinHandle<Result<()>>>,
}

impl ArchiveMultiplexer {
    /// Writes `prelude` immediately, then starts the background serializer.
    pub fn new<W: Write + Send + 'static>(mut sink: W, prelude: &Prelude) -> Result<Self> {
        codec::write_prelude(&mut sink, prelude)?;

        // Bounded to the same default as the bulk-insert channel; the
        // multiplexer thread is almost always the bottleneck for a slow
        // disk, so an unbounded channel would just move memory pressure
        // from the wire to the heap.
        let (sender, receiver) = bounded::<Frame>(256);

        let worker = thread::Builder::new()
            .name("archive-multiplexer".into())
            .spawn(move || -> Result<()> {
                for frame in receiver {
                    match frame {
                        Frame::Open(ns) => codec::write_namespace_open(&mut sink, &ns)?,
                        Frame::Body(_, doc) => codec::write_body(&mut sink, &doc)?,
                        Frame::Close(ns) => codec::write_namespace_close(&mut sink, &ns)?,
                    }
                }
                sink.flush().map_err(Error::Io)
            })
            .expect("failed to spawn archive-multiplexer thread");

        Ok(ArchiveMultiplexer {
            sender,
            worker: Some(worker),
        })
    }

    /// Hands out a writer handle for `namespace`. The caller is responsible
    /// for ensuring no two handles are live for the same namespace at once;
    /// the intent manager enforces this by construction (one worker claims
    /// one intent at a time).
    pub fn writer_for(&self, namespace: Namespace) -> NamespaceWriter {
        NamespaceWriter {
            namespace,
            sender: self.sender.clone(),
            opened: false,
        }
    }

    /// Waits for all outstanding writers to be dropped and the serializer
    /// thread to drain and flush. Returns the first error encountered, if
    /// any.
    pub fn finish(self) -> Result<()> {
        // Destructure rather than calling `drop(self.sender.clone())`: a
        // clone leaves the original (held by `self` until the function
        // returns) alive, which would keep the channel open and deadlock
        // the `join()` below waiting for a close that never comes.
        let ArchiveMultiplexer { sender, mut worker } = self;
        drop(sender);
        if let Some(worker) = worker.take() {
            worker.join().expect("archive-multiplexer thread panicked")
        } else {
            Ok(())
        }
    }
}

/// A per-namespace handle into the shared multiplexer. Emits a namespace
/// open frame on first use and a close frame when dropped, satisfying the
/// "one open-to-close run per namespace" guarantee independent of whether
/// the caller panics or returns early.
pub struct NamespaceWriter {
    namespace: Namespace,
    sender: Sender<Frame>,
    opened: bool,
}

impl NamespaceWriter {
    pub fn write_document(&mut self, doc: Document) -> Result<()> {
        if !self.opened {
            self.send(Frame::Open(self.namespace.clone()))?;
            self.opened = true;
        }
        self.send(Frame::Body(self.namespace.clone(), doc))
    }

    fn send(&self, frame: Frame) -> Result<()> {
        self.sender
            .send(frame)
            .map_err(|_| Error::format("archive multiplexer thread has already exited"))
    }
}

impl Drop for NamespaceWriter {
    fn drop(&mut self) {
        if self.opened {
            let _ = self.sender.send(Frame::Close(self.namespace.clone()));
        }
    }
}
