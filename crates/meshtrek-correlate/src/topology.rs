//! Fan-out aware aggregation
//!
//! A topology lists, layer by layer, the services expected to run
//! concurrently at the same depth of the request graph. Summing hop
//! timings naively counts the overhead of concurrent branches once per
//! branch; aggregating per layer counts the wall-clock share only once.
//!
//! Accepted file forms:
//!
//! ```json
//! { "0": ["productpage"], "1": ["details", "reviews"], "2": ["ratings"] }
//! [["productpage"], ["details", "reviews"], ["ratings"]]
//! ```

use crate::timing::{request_time_ns, HopTimings, Metric};
use crate::trace::{Hop, RequestTrace, TraceMetadata};
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Topology errors
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("failed to read topology file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse topology: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("topology declares no services")]
    Empty,
}

pub type TopologyResult<T> = Result<T, TopologyError>;

#[derive(Deserialize)]
#[serde(untagged)]
enum TopologyFile {
    Layers(Vec<Vec<String>>),
    Keyed(BTreeMap<String, Vec<String>>),
}

/// Numeric keys first in numeric order, then the rest lexically.
fn layer_key_order(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Ordered service layers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    layers: Vec<Vec<String>>,
}

/// Hops grouped by layer after greedy assignment
#[derive(Debug, Default)]
pub struct Assignment<'a> {
    pub layers: Vec<Vec<&'a Hop>>,
    pub unassigned: Vec<&'a Hop>,
}

impl Topology {
    pub fn new(layers: Vec<Vec<String>>) -> TopologyResult<Self> {
        if layers.iter().all(Vec::is_empty) {
            return Err(TopologyError::Empty);
        }
        Ok(Self { layers })
    }

    pub fn from_json(content: &str) -> TopologyResult<Self> {
        let layers = match serde_json::from_str::<TopologyFile>(content)? {
            TopologyFile::Layers(layers) => layers,
            TopologyFile::Keyed(keyed) => {
                let mut entries: Vec<(String, Vec<String>)> = keyed.into_iter().collect();
                entries.sort_by(|(a, _), (b, _)| layer_key_order(a, b));
                entries.into_iter().map(|(_, services)| services).collect()
            }
        };
        Self::new(layers)
    }

    pub fn load(path: &Path) -> TopologyResult<Self> {
        let content = fs::read_to_string(path).map_err(|source| TopologyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let topology = Self::from_json(&content)?;
        debug!(
            "Loaded topology with {} layers from {}",
            topology.layers.len(),
            path.display()
        );
        Ok(topology)
    }

    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    /// Greedy layer assignment.
    ///
    /// Layers are filled in order. Each declared service slot takes the
    /// not-yet-assigned hop of that service with the earliest downstream
    /// parse start. Hops left over match no slot.
    pub fn assign<'a>(&self, hops: &'a [Hop]) -> Assignment<'a> {
        let mut pool: Vec<&'a Hop> = hops.iter().collect();
        let mut layers = Vec::with_capacity(self.layers.len());

        for services in &self.layers {
            let mut layer = Vec::new();
            for service in services {
                let pick = pool
                    .iter()
                    .enumerate()
                    .filter(|(_, hop)| hop.service_name == *service)
                    .min_by_key(|(_, hop)| hop.start())
                    .map(|(idx, _)| idx);
                if let Some(idx) = pick {
                    layer.push(pool.remove(idx));
                }
            }
            layers.push(layer);
        }

        Assignment {
            layers,
            unassigned: pool,
        }
    }

    /// Sum of per-layer contributions for the hops of one trace.
    pub fn aggregate(&self, hops: &[Hop]) -> HopTimings {
        let assignment = self.assign(hops);
        for hop in &assignment.unassigned {
            debug!(
                "Hop of service {} matches no topology slot, excluded from aggregation",
                hop.service_name
            );
        }
        assignment.layers.iter().map(|layer| layer_contribution(layer)).sum()
    }

    /// Metadata for a trace using layer aggregation.
    pub fn metadata(&self, trace: &RequestTrace) -> TraceMetadata {
        TraceMetadata::from_timings(
            trace.hops.len(),
            request_time_ns(&trace.hops),
            self.aggregate(&trace.hops),
        )
    }
}

/// Contribution of one layer to each bucket.
///
/// A lone hop contributes its own timings. For concurrent hops, each bucket
/// gets the latest end among the hops after removing the other buckets'
/// time, minus the latest end the same hops would have reached with no
/// proxy in the path.
pub fn layer_contribution(layer: &[&Hop]) -> HopTimings {
    match layer {
        [] => HopTimings::default(),
        [hop] => HopTimings::of_hop(hop),
        hops => {
            let timings: Vec<HopTimings> = hops.iter().map(|hop| HopTimings::of_hop(hop)).collect();
            let no_mesh_end = hops
                .iter()
                .map(|hop| no_mesh_end(hop))
                .max()
                .unwrap_or_default();

            let mut contribution = HopTimings::default();
            for metric in Metric::ALL {
                let end = hops
                    .iter()
                    .zip(&timings)
                    .map(|(hop, t)| hop.upstream_conn.parse_end as i64 - t.excluding(metric))
                    .max()
                    .unwrap_or_default();
                contribution.set(metric, end - no_mesh_end);
            }
            contribution
        }
    }
}

/// Upstream end a hop would reach if the proxy added no time
fn no_mesh_end(hop: &Hop) -> i64 {
    hop.conn.parse_start as i64 + (hop.upstream_conn.parse_start as i64 - hop.conn.parse_end as i64)
}
