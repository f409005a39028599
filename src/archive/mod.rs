//! Archive container: wire framing, the writer-side multiplexer, and the
//! reader-side demultiplexer (spec §4.1, §5, §6).

mod codec;
mod demux;
mod multiplexer;

pub use codec::{ArchiveMessage, Prelude, PreludeEntry};
pub use demux::{ArchiveDemux, NamespaceReader};
pub use multiplexer::{ArchiveMultiplexer, NamespaceWriter};
