//! Dump pipeline: enumerates namespaces, dispatches a worker pool over
//! them, and writes the result into an archive or a directory tree (spec
//! §4.3, §4.6, §4.7).

mod pipeline;

pub use pipeline::{DumpOptions, DumpPipeline, DumpReport};
pub(crate) use pipeline::OPLOG_STREAM_COLLECTION;
