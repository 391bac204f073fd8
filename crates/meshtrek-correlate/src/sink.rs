//! Destinations for accepted traces

use crate::trace::{RequestTrace, TraceMetadata};
use std::convert::Infallible;

/// Receives every accepted trace of a run
pub trait TraceSink {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Take one trace and its metadata
    fn accept(&mut self, trace: RequestTrace, metadata: TraceMetadata) -> Result<(), Self::Error>;

    /// Persist anything still buffered
    fn finish(&mut self) -> Result<(), Self::Error>;
}

/// Keeps accepted traces in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    pub traces: Vec<(RequestTrace, TraceMetadata)>,
    pub finished: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefixes(&self) -> Vec<&str> {
        self.traces.iter().map(|(t, _)| t.prefix.as_str()).collect()
    }

    pub fn get(&self, prefix: &str) -> Option<&(RequestTrace, TraceMetadata)> {
        self.traces.iter().find(|(t, _)| t.prefix == prefix)
    }
}

impl TraceSink for MemorySink {
    type Error = Infallible;

    fn accept(&mut self, trace: RequestTrace, metadata: TraceMetadata) -> Result<(), Infallible> {
        self.traces.push((trace, metadata));
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Infallible> {
        self.finished = true;
        Ok(())
    }
}
