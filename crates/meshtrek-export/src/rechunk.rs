//! Re-chunking of an existing span set
//!
//! Runs write many small chunks. This merges every span and metadata chunk
//! in a directory, orders entries by prefix and rewrites them in larger
//! chunks with the same cumulative naming.

use crate::chunked::{meta_file_name, spans_file_name, write_json, META_PREFIX, SPANS_PREFIX};
use crate::error::{ExportError, ExportResult};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default entries per re-chunked file
pub const DEFAULT_RECHUNK_SIZE: usize = 500;

/// Chunk family a file belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Spans,
    Meta,
}

impl ChunkKind {
    pub fn of(file_name: &str) -> Option<Self> {
        if !file_name.ends_with(".json") {
            None
        } else if file_name.starts_with(META_PREFIX) {
            Some(ChunkKind::Meta)
        } else if file_name.starts_with(SPANS_PREFIX) {
            Some(ChunkKind::Spans)
        } else {
            None
        }
    }

    fn file_name(&self, cumulative: usize) -> String {
        match self {
            ChunkKind::Spans => spans_file_name(cumulative),
            ChunkKind::Meta => meta_file_name(cumulative),
        }
    }
}

/// Files produced by a re-chunk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RechunkSummary {
    pub span_entries: usize,
    pub meta_entries: usize,
    pub spans_files: Vec<PathBuf>,
    pub meta_files: Vec<PathBuf>,
}

/// Chunk files of one kind under `dir`, sorted by name
pub fn list_chunks(dir: &Path, kind: ChunkKind) -> ExportResult<Vec<PathBuf>> {
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ExportError::io(dir)(e)),
    };

    let mut files = Vec::new();
    for item in read_dir {
        let path = item.map_err(ExportError::io(dir))?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(ChunkKind::of)
            == Some(kind);
        if matches && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Merge the objects of `files`; later files win on key collision.
///
/// Files that do not hold a JSON object are skipped with a warning.
pub fn merge_chunks(files: &[PathBuf]) -> ExportResult<BTreeMap<String, Value>> {
    let mut merged = BTreeMap::new();
    for path in files {
        let content = fs::read_to_string(path).map_err(ExportError::io(path))?;
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(entries)) => merged.extend(entries),
            Ok(_) => warn!("Skipping {}: not a JSON object", path.display()),
            Err(e) => warn!("Skipping malformed chunk {}: {}", path.display(), e),
        }
    }
    Ok(merged)
}

/// Write `entries` in key order, `chunk_size` per file.
pub fn write_chunks(
    entries: BTreeMap<String, Value>,
    out_dir: &Path,
    kind: ChunkKind,
    chunk_size: usize,
) -> ExportResult<Vec<PathBuf>> {
    if chunk_size == 0 {
        return Err(ExportError::InvalidBatchSize(chunk_size));
    }
    if entries.is_empty() {
        return Ok(Vec::new());
    }
    fs::create_dir_all(out_dir).map_err(ExportError::io(out_dir))?;

    let mut written = Vec::new();
    let mut cumulative = 0;
    let mut iter = entries.into_iter().peekable();
    while iter.peek().is_some() {
        let chunk: Map<String, Value> = iter.by_ref().take(chunk_size).collect();
        cumulative += chunk.len();
        let path = out_dir.join(kind.file_name(cumulative));
        write_json(&path, &chunk, false)?;
        written.push(path);
    }
    Ok(written)
}

/// Re-chunk every span and metadata chunk of `input_dir` into `output_dir`.
pub fn rechunk_directory(
    input_dir: &Path,
    output_dir: &Path,
    chunk_size: usize,
) -> ExportResult<RechunkSummary> {
    if chunk_size == 0 {
        return Err(ExportError::InvalidBatchSize(chunk_size));
    }

    let spans = merge_chunks(&list_chunks(input_dir, ChunkKind::Spans)?)?;
    let meta = merge_chunks(&list_chunks(input_dir, ChunkKind::Meta)?)?;
    let mut summary = RechunkSummary {
        span_entries: spans.len(),
        meta_entries: meta.len(),
        ..RechunkSummary::default()
    };

    summary.spans_files = write_chunks(spans, output_dir, ChunkKind::Spans, chunk_size)?;
    summary.meta_files = write_chunks(meta, output_dir, ChunkKind::Meta, chunk_size)?;
    info!(
        "Re-chunked {} span and {} meta entries into {} files under {}",
        summary.span_entries,
        summary.meta_entries,
        summary.spans_files.len() + summary.meta_files.len(),
        output_dir.display()
    );
    Ok(summary)
}
