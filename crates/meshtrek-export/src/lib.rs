//! Output for correlated traces
//!
//! - **Chunked**: span and metadata chunk files written as a run progresses
//! - **Rechunk**: merge an existing chunk set and rewrite it in larger chunks
//! - **Report**: request-time percentiles over a chunk set

pub mod chunked;
pub mod error;
pub mod rechunk;
pub mod report;

pub use chunked::{ChunkedWriter, ChunkedWriterConfig, FlushSummary};
pub use error::{ExportError, ExportResult};
pub use rechunk::{rechunk_directory, RechunkSummary};
pub use report::{report_directory, LatencyReport};
