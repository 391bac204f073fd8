//! Cross-hop correlation and latency decomposition
//!
//! Joins request, response and connection fragments from every proxy log of
//! a capture run into per-request traces, and splits each hop's latency into
//! wait, parse and filter time.

pub mod correlator;
pub mod engine;
pub mod error;
pub mod index;
pub mod merger;
pub mod sink;
pub mod stats;
pub mod timing;
pub mod topology;
pub mod trace;

pub use correlator::{correlate, Correlator};
pub use engine::{EngineConfig, TraceEngine};
pub use error::{DiscardReason, EngineError, EngineResult, Side};
pub use index::{DirectoryIndex, IndexedStore, LogDirectory};
pub use sink::{MemorySink, TraceSink};
pub use stats::RunStats;
pub use timing::{HopTimings, Metric};
pub use topology::{Topology, TopologyError};
pub use trace::{Hop, RequestTrace, TraceMetadata};
