//! Cross-file hop resolution
//!
//! For every request fragment carrying the prefix, the same file must hold
//! its response and a connection fragment on each side. The first missing
//! piece discards the whole trace: a partial trace is never written.

use crate::error::{DiscardReason, Side};
use crate::merger::resolve_connection;
use crate::trace::{Hop, RequestTrace};
use meshtrek_core::{FragmentSource, RequestFragment};
use tracing::trace;

/// Accumulates the hops of one prefix across log files
#[derive(Debug)]
pub struct Correlator {
    prefix: String,
    hops: Vec<Hop>,
}

impl Correlator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            hops: Vec::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Resolve every request fragment of the prefix found in `source`.
    pub fn scan<S: FragmentSource + ?Sized>(&mut self, source: &S) -> Result<(), DiscardReason> {
        for req in source.find_by_identifier_prefix(&self.prefix) {
            let hop = resolve_hop(source, req)?;
            trace!(
                "Resolved hop for {} in {} (stream {})",
                self.prefix,
                hop.service_name,
                hop.req.stream_id
            );
            self.hops.push(hop);
        }
        Ok(())
    }

    pub fn finish(self) -> RequestTrace {
        RequestTrace::new(self.prefix, self.hops)
    }
}

/// Correlate one prefix over `sources`, entry file first.
pub fn correlate<'a, S, I>(prefix: &str, sources: I) -> Result<RequestTrace, DiscardReason>
where
    S: FragmentSource + ?Sized + 'a,
    I: IntoIterator<Item = &'a S>,
{
    let mut correlator = Correlator::new(prefix);
    for source in sources {
        correlator.scan(source)?;
    }
    Ok(correlator.finish())
}

/// Build the hop for one request fragment from a single file.
pub fn resolve_hop<S: FragmentSource + ?Sized>(
    source: &S,
    req: &RequestFragment,
) -> Result<Hop, DiscardReason> {
    let service = source.service_name();
    let mut req = req.clone();

    let mut resp = source
        .find_response_by_stream(req.stream_id)
        .ok_or_else(|| DiscardReason::MissingResponse {
            service: service.to_string(),
            stream_id: req.stream_id,
        })?
        .clone();

    let downstream = source.find_connections(
        req.connection_id,
        req.plain_stream_id,
        req.protocol,
        req.stream_id,
    );
    let conn = resolve_connection(
        &downstream,
        req.protocol,
        Side::Downstream,
        service,
        req.connection_id,
        &mut req.times,
    )?;

    let upstream = source.find_connections(
        resp.upstream_connection_id,
        resp.stream.plain_stream_id,
        resp.stream.protocol,
        resp.stream.stream_id,
    );
    let upstream_conn = resolve_connection(
        &upstream,
        resp.stream.protocol,
        Side::Upstream,
        service,
        resp.upstream_connection_id,
        &mut resp.stream.times,
    )?;

    Ok(Hop {
        req,
        resp,
        conn,
        upstream_conn,
        service_name: service.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! JSON line builders for synthetic capture directories.
    //!
    //! Each HTTP/1 hop `n` uses downstream connection `n`, upstream
    //! connection `100 + n` and stream id `1000 + n`, with the timings of a
    //! header-only exchange starting at `offset` ms.

    use serde_json::json;

    pub const MS: u64 = 1_000_000;

    pub struct HopLines {
        pub request: String,
        pub response: String,
        pub downstream: Vec<String>,
        pub upstream: Vec<String>,
    }

    impl HopLines {
        pub fn all(&self) -> Vec<String> {
            let mut lines = vec![self.request.clone(), self.response.clone()];
            lines.extend(self.downstream.iter().cloned());
            lines.extend(self.upstream.iter().cloned());
            lines
        }
    }

    pub fn connection_line(connection_id: u32, stream_id: u64, start: u64, end: u64) -> String {
        json!({
            "Connection ID": connection_id,
            "Stream ID": stream_id,
            "Read Ready Start Time": start,
            "Write Ready Start Time": start,
            "Parse Start Time": start,
            "Parse End Time": end,
        })
        .to_string()
    }

    pub fn http1_hop(request_id: &str, n: u32, offset_ms: u64) -> HopLines {
        let base = offset_ms * MS;
        let stream_id = 1000 + n as u64;
        let upstream_id = 100 + n;
        HopLines {
            request: json!({
                "Request ID": request_id,
                "Connection ID": n,
                "Stream ID": stream_id,
                "Header Filter Start Time": base + 2 * MS,
                "Header Filter End Time": base + 5 * MS,
                "Stream End Time": base + 5 * MS,
            })
            .to_string(),
            response: json!({
                "Connection ID": n,
                "Stream ID": stream_id,
                "Upstream Connection ID": upstream_id,
                "Header Filter Start Time": base + 7 * MS,
                "Header Filter End Time": base + 9 * MS,
                "Stream End Time": base + 9 * MS,
            })
            .to_string(),
            downstream: vec![connection_line(n, stream_id, base, base + 5 * MS)],
            upstream: vec![connection_line(upstream_id, stream_id, base + 6 * MS, base + 9 * MS)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{connection_line, http1_hop, MS};
    use super::*;
    use crate::timing::HopTimings;
    use meshtrek_core::codec::{join_key, pack_stream_ids};
    use meshtrek_core::{Fragment, FragmentStore};
    use serde_json::json;

    const ID: &str = "735621ec83e08746-0001";
    const PREFIX: &str = "735621ec83e08746";

    fn store(service: &str, lines: &[String]) -> FragmentStore {
        let fragments = lines
            .iter()
            .map(|l| Fragment::parse_line(l).unwrap().unwrap())
            .collect();
        FragmentStore::from_fragments(format!("{service}.log"), service, fragments)
    }

    #[test]
    fn test_http1_hop_resolves_with_write_back() {
        let lines = http1_hop(ID, 1, 0).all();
        let trace = correlate(PREFIX, [&store("productpage", &lines)]).unwrap();

        assert_eq!(trace.prefix, PREFIX);
        assert_eq!(trace.len(), 1);
        let hop = &trace.hops[0];
        assert_eq!(hop.service_name, "productpage");
        assert_eq!(hop.resp.upstream_connection_id, 101);
        assert_eq!(hop.resp.stream.times.header_parse_start, 6 * MS);

        let timings = HopTimings::of_hop(hop);
        assert_eq!(timings.wait, 0);
        assert_eq!(timings.parse, 3 * MS as i64);
        assert_eq!(timings.filter, 5 * MS as i64);
    }

    #[test]
    fn test_hops_from_several_files_sorted_by_start() {
        let entry = store("productpage", &http1_hop(ID, 1, 4).all());
        let reviews = store("reviews", &http1_hop(ID, 2, 1).all());
        let sources: Vec<&FragmentStore> = vec![&entry, &reviews];
        let trace = correlate(PREFIX, sources).unwrap();

        let services: Vec<&str> = trace.hops.iter().map(|h| h.service_name.as_str()).collect();
        assert_eq!(services, vec!["reviews", "productpage"]);
    }

    #[test]
    fn test_each_missing_piece_discards() {
        let hop = http1_hop(ID, 1, 0);

        let no_response = store(
            "a",
            &[&[hop.request.clone()], &hop.downstream[..], &hop.upstream[..]].concat(),
        );
        assert_eq!(
            correlate(PREFIX, [&no_response]).unwrap_err().label(),
            "missing_response"
        );

        let no_downstream = store(
            "a",
            &[&[hop.request.clone(), hop.response.clone()], &hop.upstream[..]].concat(),
        );
        assert_eq!(
            correlate(PREFIX, [&no_downstream]).unwrap_err().label(),
            "missing_connection"
        );

        let no_upstream = store(
            "a",
            &[&[hop.request.clone(), hop.response.clone()], &hop.downstream[..]].concat(),
        );
        assert_eq!(
            correlate(PREFIX, [&no_upstream]).unwrap_err().label(),
            "missing_upstream_connection"
        );
    }

    #[test]
    fn test_incomplete_later_file_discards_whole_trace() {
        let entry = store("productpage", &http1_hop(ID, 1, 0).all());
        let broken = http1_hop(ID, 2, 1);
        let reviews = store("reviews", &[broken.request, broken.response]);
        let result = correlate(PREFIX, [&entry, &reviews]);
        assert!(matches!(result, Err(DiscardReason::MissingConnection { .. })));
    }

    #[test]
    fn test_three_downstream_fragments_discard() {
        let mut hop = http1_hop(ID, 1, 0);
        hop.downstream.push(connection_line(1, 1001, MS, 2 * MS));
        hop.downstream.push(connection_line(1, 1001, 3 * MS, 4 * MS));
        let result = correlate(PREFIX, [&store("a", &hop.all())]);
        assert!(matches!(
            result,
            Err(DiscardReason::UnsupportedMultiConnection {
                side: Side::Downstream,
                count: 3
            })
        ));
    }

    #[test]
    fn test_http2_hop_uses_packed_membership() {
        let packed = pack_stream_ids(&[1, 3, 5]).unwrap();
        let upstream_packed = pack_stream_ids(&[7]).unwrap();
        let lines = vec![
            json!({"Request ID": ID, "Key": join_key(9, 3), "Stream ID": 500,
                   "Header Parse Start Time": 10, "Header Parse End Time": 20,
                   "Header Process End Time": 30, "Stream End Time": 30})
            .to_string(),
            json!({"Key": join_key(44, 7), "Stream ID": 500, "Upstream Connection ID": 44,
                   "Header Parse Start Time": 50, "Header Parse End Time": 60,
                   "Header Process End Time": 70, "Stream End Time": 70})
            .to_string(),
            json!({"Connection ID": 9, "Parse Start Time": 5, "Parse End Time": 35,
                   "Stream IDs": packed.inline})
            .to_string(),
            json!({"Connection ID": 44, "Parse Start Time": 45, "Parse End Time": 75,
                   "Stream IDs": upstream_packed.inline})
            .to_string(),
        ];
        let source = store("details", &lines);
        let hop = correlate(PREFIX, [&source]).unwrap().hops.remove(0);
        assert_eq!(hop.conn.connection_id, 9);
        assert_eq!(hop.upstream_conn.connection_id, 44);
        // HTTP/2 stream times are taken as logged
        assert_eq!(hop.req.times.header_parse_start, 10);
    }

    #[test]
    fn test_no_matching_requests_gives_empty_trace() {
        let source = store("a", &http1_hop(ID, 1, 0).all());
        let trace = correlate("ffffffffffffffff", [&source]).unwrap();
        assert!(trace.is_empty());
    }
}
