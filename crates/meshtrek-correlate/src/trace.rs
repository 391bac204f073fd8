//! Correlated request traces
//!
//! A [`RequestTrace`] collects every [`Hop`] of one end-user request, joined
//! across log files by the request-id prefix.

use meshtrek_core::{ConnectionFragment, RequestFragment, ResponseFragment};
use serde::{Deserialize, Serialize};

/// One proxy hop: both stream records plus the connection on each side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    /// Request as seen on the downstream side
    pub req: RequestFragment,

    /// Same stream as forwarded upstream
    pub resp: ResponseFragment,

    /// Downstream connection I/O window
    pub conn: ConnectionFragment,

    /// Upstream connection I/O window
    pub upstream_conn: ConnectionFragment,

    /// Service whose proxy logged this hop
    #[serde(rename = "service")]
    pub service_name: String,
}

impl Hop {
    /// Hops order by the start of their downstream parse.
    pub fn start(&self) -> u64 {
        self.conn.parse_start
    }
}

/// Every hop of one logical request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTrace {
    /// 16-character request-id prefix
    pub prefix: String,

    /// Hops sorted by downstream parse start
    pub hops: Vec<Hop>,
}

impl RequestTrace {
    pub fn new(prefix: impl Into<String>, mut hops: Vec<Hop>) -> Self {
        hops.sort_by_key(Hop::start);
        Self {
            prefix: prefix.into(),
            hops,
        }
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }
}

/// Per-request summary written alongside the hops (milliseconds)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceMetadata {
    pub total_sub_requests: usize,
    pub request_time: f64,
    pub wait: f64,
    pub parse: f64,
    pub filter: f64,
    pub overhead: f64,
}
