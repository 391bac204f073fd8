//! Chunked span and metadata files
//!
//! Accepted traces are buffered until `batch_size` of them are pending, then
//! written as a pair of JSON objects keyed by request-id prefix:
//!
//! - `spans_<n>.json`: prefix to ordered hop list
//! - `spans_meta_<n>.json`: prefix to metadata
//!
//! `<n>` is the cumulative number of traces written, so names increase
//! monotonically and a consumer merges every chunk to get the full set.

use crate::error::{ExportError, ExportResult};
use meshtrek_correlate::{Hop, RequestTrace, TraceMetadata, TraceSink};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const SPANS_PREFIX: &str = "spans_";
pub const META_PREFIX: &str = "spans_meta_";

/// Default traces per chunk
pub const DEFAULT_BATCH_SIZE: usize = 50;

pub fn spans_file_name(cumulative: usize) -> String {
    format!("{}{}.json", SPANS_PREFIX, cumulative)
}

pub fn meta_file_name(cumulative: usize) -> String {
    format!("{}{}.json", META_PREFIX, cumulative)
}

/// Write one JSON object to `path`.
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T, pretty: bool) -> ExportResult<()> {
    let file = File::create(path).map_err(ExportError::io(path))?;
    let mut writer = BufWriter::new(file);
    let encoded = if pretty {
        serde_json::to_writer_pretty(&mut writer, value)
    } else {
        serde_json::to_writer(&mut writer, value)
    };
    encoded.map_err(ExportError::serialization(path))?;
    writer.flush().map_err(ExportError::io(path))
}

/// Chunked writer configuration
#[derive(Debug, Clone)]
pub struct ChunkedWriterConfig {
    /// Output directory, created if missing
    pub dir: PathBuf,

    /// Traces per chunk
    pub batch_size: usize,

    /// Pretty print JSON
    pub pretty: bool,
}

impl Default for ChunkedWriterConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            batch_size: DEFAULT_BATCH_SIZE,
            pretty: true,
        }
    }
}

/// Files written so far
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushSummary {
    pub traces_written: usize,
    pub files: Vec<PathBuf>,
}

/// Buffers accepted traces and writes them in chunks
#[derive(Debug)]
pub struct ChunkedWriter {
    config: ChunkedWriterConfig,
    pending_spans: BTreeMap<String, Vec<Hop>>,
    pending_meta: BTreeMap<String, TraceMetadata>,
    summary: FlushSummary,
}

impl ChunkedWriter {
    pub fn new(config: ChunkedWriterConfig) -> ExportResult<Self> {
        if config.batch_size == 0 {
            return Err(ExportError::InvalidBatchSize(0));
        }
        fs::create_dir_all(&config.dir).map_err(ExportError::io(&config.dir))?;
        info!(
            "Writing span chunks of {} to {}",
            config.batch_size,
            config.dir.display()
        );
        Ok(Self {
            config,
            pending_spans: BTreeMap::new(),
            pending_meta: BTreeMap::new(),
            summary: FlushSummary::default(),
        })
    }

    /// Traces buffered but not yet written
    pub fn pending(&self) -> usize {
        self.pending_spans.len()
    }

    pub fn summary(&self) -> &FlushSummary {
        &self.summary
    }

    /// Write pending traces as one chunk pair and clear the buffers.
    ///
    /// Returns the number of traces written, 0 if nothing was pending.
    pub fn flush(&mut self) -> ExportResult<usize> {
        let count = self.pending();
        if count == 0 {
            return Ok(0);
        }

        let cumulative = self.summary.traces_written + count;
        let spans_path = self.config.dir.join(spans_file_name(cumulative));
        let meta_path = self.config.dir.join(meta_file_name(cumulative));

        write_json(&spans_path, &self.pending_spans, self.config.pretty)?;
        write_json(&meta_path, &self.pending_meta, self.config.pretty)?;
        self.pending_spans.clear();
        self.pending_meta.clear();

        info!("Flushed {} traces to {}", count, spans_path.display());
        self.summary.traces_written = cumulative;
        self.summary.files.push(spans_path);
        self.summary.files.push(meta_path);
        Ok(count)
    }
}

impl TraceSink for ChunkedWriter {
    type Error = ExportError;

    fn accept(&mut self, trace: RequestTrace, metadata: TraceMetadata) -> ExportResult<()> {
        debug!("Buffering {} ({} hops)", trace.prefix, trace.len());
        self.pending_meta.insert(trace.prefix.clone(), metadata);
        self.pending_spans.insert(trace.prefix, trace.hops);
        if self.pending() >= self.config.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn finish(&mut self) -> ExportResult<()> {
        self.flush()?;
        Ok(())
    }
}
