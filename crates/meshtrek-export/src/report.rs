//! Request-time percentiles over a span set

use crate::error::{ExportError, ExportResult};
use crate::rechunk::{list_chunks, ChunkKind};
use meshtrek_correlate::TraceMetadata;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Median share of request time spent in each bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BucketShares {
    pub wait: f64,
    pub parse: f64,
    pub filter: f64,
    pub overhead: f64,
}

/// Summary of the matching traces
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyReport {
    /// Hop counts the report was restricted to (empty = all)
    pub lengths: Vec<usize>,
    pub count: usize,
    pub p50: f64,
    pub p99: f64,
    pub shares: BucketShares,
}

/// Median; the mean of the middle pair for even lengths. `sorted` must be
/// ascending.
pub fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    match n {
        0 => 0.0,
        _ if n % 2 == 1 => sorted[n / 2],
        _ => (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0,
    }
}

/// Nearest-rank percentile, `p` in [0, 1]. `sorted` must be ascending.
pub fn percentile_nearest_rank(sorted: &[f64], p: f64) -> f64 {
    let (Some(first), Some(last)) = (sorted.first(), sorted.last()) else {
        return 0.0;
    };
    if p <= 0.0 {
        return *first;
    }
    if p >= 1.0 {
        return *last;
    }
    let rank = ((p * sorted.len() as f64).ceil() as usize).max(1);
    sorted[rank - 1]
}

fn sorted(mut values: Vec<f64>) -> Vec<f64> {
    values.sort_by(f64::total_cmp);
    values
}

/// Metadata entries of every meta chunk under `dir`.
///
/// Entries that do not decode as metadata are skipped.
pub fn load_metadata(dir: &Path) -> ExportResult<Vec<TraceMetadata>> {
    let mut entries = Vec::new();
    for path in list_chunks(dir, ChunkKind::Meta)? {
        let content = fs::read_to_string(&path).map_err(ExportError::io(&path))?;
        let object: BTreeMap<String, Value> = match serde_json::from_str(&content) {
            Ok(object) => object,
            Err(e) => {
                warn!("Skipping malformed chunk {}: {}", path.display(), e);
                continue;
            }
        };
        for (prefix, value) in object {
            match serde_json::from_value::<TraceMetadata>(value) {
                Ok(meta) => entries.push(meta),
                Err(e) => debug!("Skipping metadata for {}: {}", prefix, e),
            }
        }
    }
    Ok(entries)
}

/// Percentiles and bucket shares of the entries whose hop count is in
/// `lengths`.
pub fn summarize(entries: &[TraceMetadata], lengths: &[usize]) -> LatencyReport {
    let selected: Vec<&TraceMetadata> = entries
        .iter()
        .filter(|m| lengths.is_empty() || lengths.contains(&m.total_sub_requests))
        .collect();

    let times = sorted(selected.iter().map(|m| m.request_time).collect());
    let share = |bucket: fn(&TraceMetadata) -> f64| {
        let ratios = selected
            .iter()
            .filter(|m| m.request_time > 0.0)
            .map(|m| bucket(m) / m.request_time)
            .collect();
        median(&sorted(ratios))
    };

    LatencyReport {
        lengths: lengths.to_vec(),
        count: times.len(),
        p50: median(&times),
        p99: percentile_nearest_rank(&times, 0.99),
        shares: BucketShares {
            wait: share(|m| m.wait),
            parse: share(|m| m.parse),
            filter: share(|m| m.filter),
            overhead: share(|m| m.overhead),
        },
    }
}

/// [`summarize`] over every meta chunk under `dir`.
pub fn report_directory(dir: &Path, lengths: &[usize]) -> ExportResult<LatencyReport> {
    let entries = load_metadata(dir)?;
    Ok(summarize(&entries, lengths))
}
