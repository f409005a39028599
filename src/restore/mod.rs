//! Restore pipeline: plans namespaces from an archive or directory tree,
//! applies include/exclude filtering and renames, then executes each intent
//! (spec §4.3, §4.5, §4.6).

mod bulk_writer;
mod pipeline;

pub use bulk_writer::BulkWriter;
pub use pipeline::{RestoreOptions, RestorePipeline, RestoreReport};
