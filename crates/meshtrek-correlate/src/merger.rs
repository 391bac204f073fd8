//! HTTP/1 connection merging
//!
//! An HTTP/1 proxy logs one connection fragment per I/O window, so a request
//! whose body arrived in a separate read shows up as two fragments on the
//! same connection. They are folded into one fragment covering both windows,
//! and their parse starts are written back as the header and data parse
//! starts of the stream record, which HTTP/1 probes cannot observe directly.

use crate::error::{DiscardReason, Side};
use meshtrek_core::{ConnectionFragment, Protocol, StreamTimes};

/// Most fragments one HTTP/1 stream side can be merged from
pub const MAX_HTTP1_FRAGMENTS: usize = 2;

/// Reduce connection candidates for one hop side to exactly one fragment.
///
/// `times` belongs to the request (downstream side) or the response
/// (upstream side) and receives the HTTP/1 parse-start write-back.
pub fn resolve_connection(
    candidates: &[&ConnectionFragment],
    protocol: Protocol,
    side: Side,
    service: &str,
    connection_id: u32,
    times: &mut StreamTimes,
) -> Result<ConnectionFragment, DiscardReason> {
    match (protocol, candidates) {
        (_, []) => Err(DiscardReason::missing_connection(side, service, connection_id)),
        (Protocol::Http2, [first, ..]) => Ok((*first).clone()),
        (Protocol::Http1, fragments) if fragments.len() <= MAX_HTTP1_FRAGMENTS => {
            Ok(merge_http1(fragments, times))
        }
        (Protocol::Http1, fragments) => Err(DiscardReason::UnsupportedMultiConnection {
            side,
            count: fragments.len(),
        }),
    }
}

/// Merge one or two HTTP/1 fragments and write their parse starts back.
///
/// Panics on an empty slice; [`resolve_connection`] guards that case.
fn merge_http1(fragments: &[&ConnectionFragment], times: &mut StreamTimes) -> ConnectionFragment {
    let mut sorted: Vec<&ConnectionFragment> = fragments.to_vec();
    sorted.sort_by_key(|f| f.parse_start);

    let first = sorted[0];
    times.header_parse_start = first.parse_start;
    if let Some(second) = sorted.get(1) {
        times.data_parse_start = second.parse_start;
    }

    let mut merged = first.clone();
    for other in &sorted[1..] {
        merged.read_ready_start = merged.read_ready_start.min(other.read_ready_start);
        merged.write_ready_start = merged.write_ready_start.min(other.write_ready_start);
        merged.parse_end = merged.parse_end.max(other.parse_end);
    }
    merged
}
