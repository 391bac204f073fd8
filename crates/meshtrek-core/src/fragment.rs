//! Fragment records emitted by the per-hop probes
//!
//! Each log line is one JSON object. Field presence, not a type tag,
//! distinguishes the three kinds:
//!
//! - `Upstream Connection ID` (non-zero) marks a response fragment
//! - a non-empty `Request ID` marks a request fragment
//! - `Connection ID` without either of the above marks a connection fragment
//!
//! Protocol-specific field names are normalized while deserializing: HTTP/2
//! probes report `* Parse End Time` where the filters start, HTTP/1 probes
//! report `* Filter End Time` where processing ends. Missing instants are 0,
//! which means the phase did not occur.

use crate::codec::{split_key, PackedStreamIds, Protocol};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of the request-id prefix used as the cross-file join key
pub const PREFIX_LEN: usize = 16;

/// Truncate a request id to its join prefix.
pub fn id_prefix(request_id: &str) -> &str {
    match request_id.char_indices().nth(PREFIX_LEN) {
        Some((idx, _)) => &request_id[..idx],
        None => request_id,
    }
}

/// Validation failures for a syntactically valid line
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FragmentError {
    #[error("{kind} fragment is missing field `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

/// Named instants of one request or response stream (ns, capture-local)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamTimes {
    #[serde(rename = "Header Parse Start Time")]
    pub header_parse_start: u64,

    #[serde(rename = "Header Filter Start Time", alias = "Header Parse End Time")]
    pub header_filter_start: u64,

    #[serde(rename = "Header Process End Time", alias = "Header Filter End Time")]
    pub header_process_end: u64,

    #[serde(rename = "Data Parse Start Time")]
    pub data_parse_start: u64,

    #[serde(rename = "Data Filter Start Time", alias = "Data Parse End Time")]
    pub data_filter_start: u64,

    #[serde(rename = "Data Process End Time", alias = "Data Filter End Time")]
    pub data_process_end: u64,

    #[serde(rename = "Trailer Parse Start Time")]
    pub trailer_parse_start: u64,

    #[serde(rename = "Trailer Filter Start Time", alias = "Trailer Parse End Time")]
    pub trailer_filter_start: u64,

    #[serde(rename = "Stream End Time")]
    pub stream_end: u64,
}

impl StreamTimes {
    pub fn has_data_phase(&self) -> bool {
        self.data_parse_start != 0
    }

    pub fn has_trailer_phase(&self) -> bool {
        self.trailer_parse_start != 0
    }
}

/// Downstream-side record of one request stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFragment {
    #[serde(rename = "Request ID", default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,

    #[serde(rename = "Connection ID")]
    pub connection_id: u32,

    /// Per-connection ordinal, HTTP/2 only
    #[serde(rename = "Plain Stream ID", default, skip_serializing_if = "Option::is_none")]
    pub plain_stream_id: Option<u32>,

    #[serde(rename = "Stream ID")]
    pub stream_id: u64,

    #[serde(rename = "Protocol")]
    pub protocol: Protocol,

    #[serde(flatten)]
    pub times: StreamTimes,
}

impl StreamFragment {
    pub fn prefix(&self) -> &str {
        id_prefix(&self.request_id)
    }
}

pub type RequestFragment = StreamFragment;

/// Upstream-side record of the same stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFragment {
    #[serde(flatten)]
    pub stream: StreamFragment,

    #[serde(rename = "Upstream Connection ID")]
    pub upstream_connection_id: u32,
}

/// Transport-level I/O record of one connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionFragment {
    #[serde(rename = "Connection ID")]
    pub connection_id: u32,

    /// Stream served by this I/O window, HTTP/1 only
    #[serde(rename = "Stream ID", default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<u64>,

    #[serde(rename = "Read Ready Start Time", default)]
    pub read_ready_start: u64,

    #[serde(rename = "Write Ready Start Time", default)]
    pub write_ready_start: u64,

    #[serde(rename = "Parse Start Time", default)]
    pub parse_start: u64,

    #[serde(rename = "Parse End Time", default)]
    pub parse_end: u64,

    /// Multiplexed plain stream ids, HTTP/2 only
    #[serde(rename = "Stream IDs", default, skip_serializing_if = "Option::is_none")]
    pub stream_ids: Option<u64>,

    #[serde(rename = "Extra Stream IDs", default, skip_serializing_if = "Option::is_none")]
    pub extra_stream_ids: Option<u64>,
}

impl ConnectionFragment {
    pub fn is_http2_capable(&self) -> bool {
        self.stream_ids.is_some()
    }

    pub fn packed_stream_ids(&self) -> Option<PackedStreamIds> {
        self.stream_ids
            .map(|inline| PackedStreamIds::new(inline, self.extra_stream_ids.unwrap_or(0)))
    }

    /// Whether this fragment carried the given stream on `connection_id`.
    ///
    /// HTTP/2 unpacks the multiplexed set and tests membership of the plain
    /// stream id; HTTP/1 compares the stream id directly.
    pub fn serves(
        &self,
        connection_id: u32,
        plain_stream_id: Option<u32>,
        protocol: Protocol,
        stream_id: u64,
    ) -> bool {
        if self.connection_id != connection_id {
            return false;
        }
        match protocol {
            Protocol::Http2 => match (plain_stream_id, self.packed_stream_ids()) {
                (Some(plain), Some(ids)) => ids.contains(plain),
                _ => false,
            },
            Protocol::Http1 => self.stream_id == Some(stream_id),
        }
    }
}

/// Line as written by the probes, every field optional
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFragment {
    #[serde(rename = "Request ID", default)]
    pub request_id: Option<String>,

    #[serde(rename = "Key", default)]
    pub key: Option<u64>,

    #[serde(rename = "Connection ID", default)]
    pub connection_id: Option<u32>,

    #[serde(rename = "Stream ID", default)]
    pub stream_id: Option<u64>,

    #[serde(rename = "Upstream Connection ID", default)]
    pub upstream_connection_id: Option<u32>,

    #[serde(rename = "Read Ready Start Time", default)]
    pub read_ready_start: Option<u64>,

    #[serde(rename = "Write Ready Start Time", default)]
    pub write_ready_start: Option<u64>,

    #[serde(rename = "Parse Start Time", default)]
    pub parse_start: Option<u64>,

    #[serde(rename = "Parse End Time", default)]
    pub parse_end: Option<u64>,

    #[serde(rename = "Stream IDs", default)]
    pub stream_ids: Option<u64>,

    #[serde(rename = "Extra Stream IDs", default)]
    pub extra_stream_ids: Option<u64>,

    #[serde(flatten)]
    pub times: StreamTimes,
}

/// A validated fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Request(RequestFragment),
    Response(ResponseFragment),
    Connection(ConnectionFragment),
    /// Nothing to correlate on (e.g. a request line with an empty id)
    Ignored,
}

impl Fragment {
    /// Parse and validate one JSON line.
    pub fn parse_line(
        line: impl AsRef<[u8]>,
    ) -> Result<Result<Self, FragmentError>, serde_json::Error> {
        let raw: RawFragment = serde_json::from_slice(line.as_ref())?;
        Ok(Self::from_raw(raw))
    }

    pub fn from_raw(raw: RawFragment) -> Result<Self, FragmentError> {
        let has_request_id = raw.request_id.as_deref().is_some_and(|id| !id.is_empty());
        let upstream = raw.upstream_connection_id.filter(|id| *id != 0);

        if let Some(upstream_connection_id) = upstream {
            let stream = Self::stream_from_raw(&raw, "response")?;
            return Ok(Fragment::Response(ResponseFragment {
                stream,
                upstream_connection_id,
            }));
        }

        if has_request_id {
            return Ok(Fragment::Request(Self::stream_from_raw(&raw, "request")?));
        }

        // A line that names a request but has no usable id is skipped,
        // as is a response line whose upstream id is zero.
        if raw.request_id.is_some() || raw.upstream_connection_id.is_some() || raw.key.is_some() {
            return Ok(Fragment::Ignored);
        }

        match raw.connection_id {
            Some(connection_id) => Ok(Fragment::Connection(ConnectionFragment {
                connection_id,
                stream_id: raw.stream_id,
                read_ready_start: raw.read_ready_start.unwrap_or(0),
                write_ready_start: raw.write_ready_start.unwrap_or(0),
                parse_start: raw.parse_start.unwrap_or(0),
                parse_end: raw.parse_end.unwrap_or(0),
                stream_ids: raw.stream_ids,
                extra_stream_ids: raw.extra_stream_ids,
            })),
            None => Ok(Fragment::Ignored),
        }
    }

    fn stream_from_raw(raw: &RawFragment, kind: &'static str) -> Result<StreamFragment, FragmentError> {
        let protocol = Protocol::classify(raw.key);
        let (connection_id, plain_stream_id) = match raw.key {
            Some(key) => {
                let (conn, plain) = split_key(key);
                (conn, Some(plain))
            }
            None => (
                raw.connection_id.ok_or(FragmentError::MissingField {
                    kind,
                    field: "Connection ID",
                })?,
                None,
            ),
        };
        let stream_id = raw.stream_id.ok_or(FragmentError::MissingField {
            kind,
            field: "Stream ID",
        })?;

        Ok(StreamFragment {
            request_id: raw.request_id.clone().unwrap_or_default(),
            connection_id,
            plain_stream_id,
            stream_id,
            protocol,
            times: raw.times,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::join_key;

    #[test]
    fn test_id_prefix() {
        assert_eq!(id_prefix("0123456789abcdef-rest-of-id"), "0123456789abcdef");
        assert_eq!(id_prefix("short"), "short");
    }

    #[test]
    fn test_http2_request_normalizes_parse_end() {
        let line = format!(
            r#"{{"Request ID":"735621ec83e08746aaaa","Key":{},"Stream ID":99,
                "Header Parse Start Time":10,"Header Parse End Time":20,
                "Header Process End Time":30,"Stream End Time":40}}"#,
            join_key(5, 3)
        );
        let fragment = Fragment::parse_line(&line).unwrap().unwrap();
        let Fragment::Request(req) = fragment else {
            panic!("expected request fragment");
        };
        assert_eq!(req.protocol, Protocol::Http2);
        assert_eq!(req.connection_id, 5);
        assert_eq!(req.plain_stream_id, Some(3));
        assert_eq!(req.prefix(), "735621ec83e08746");
        assert_eq!(req.times.header_filter_start, 20);
        assert_eq!(req.times.header_process_end, 30);
        assert!(!req.times.has_data_phase());
    }

    #[test]
    fn test_http1_request_sources_process_end_from_filter_end() {
        let line = r#"{"Request ID":"abcdefabcdefabcdef","Connection ID":8,"Stream ID":77,
            "Header Filter Start Time":15,"Header Filter End Time":25,
            "Data Filter Start Time":35,"Data Filter End Time":45,"Stream End Time":50}"#;
        let Fragment::Request(req) = Fragment::parse_line(line).unwrap().unwrap() else {
            panic!("expected request fragment");
        };
        assert_eq!(req.protocol, Protocol::Http1);
        assert_eq!(req.plain_stream_id, None);
        assert_eq!(req.times.header_parse_start, 0);
        assert_eq!(req.times.data_parse_start, 0);
        assert_eq!(req.times.header_process_end, 25);
        assert_eq!(req.times.data_process_end, 45);
    }

    #[test]
    fn test_response_needs_nonzero_upstream() {
        let line = r#"{"Connection ID":8,"Stream ID":77,"Upstream Connection ID":12}"#;
        let Fragment::Response(resp) = Fragment::parse_line(line).unwrap().unwrap() else {
            panic!("expected response fragment");
        };
        assert_eq!(resp.upstream_connection_id, 12);

        let line = r#"{"Connection ID":8,"Stream ID":77,"Upstream Connection ID":0}"#;
        assert_eq!(Fragment::parse_line(line).unwrap().unwrap(), Fragment::Ignored);
    }

    #[test]
    fn test_connection_fragment_with_packed_ids() {
        let line = r#"{"Connection ID":5,"Read Ready Start Time":1,"Parse Start Time":2,
            "Parse End Time":3,"Stream IDs":281474976710656,"Extra Stream IDs":7}"#;
        let Fragment::Connection(conn) = Fragment::parse_line(line).unwrap().unwrap() else {
            panic!("expected connection fragment");
        };
        assert!(conn.is_http2_capable());
        assert_eq!(conn.packed_stream_ids().unwrap().unpack(), vec![1, 7]);
        assert_eq!(conn.parse_end, 3);
    }

    #[test]
    fn test_empty_request_id_is_ignored() {
        let line = r#"{"Request ID":"","Connection ID":5,"Stream ID":1}"#;
        assert_eq!(Fragment::parse_line(line).unwrap().unwrap(), Fragment::Ignored);
    }

    #[test]
    fn test_http1_request_without_connection_is_invalid() {
        let line = r#"{"Request ID":"abcdefabcdefabcdef","Stream ID":1}"#;
        let err = Fragment::parse_line(line).unwrap().unwrap_err();
        assert_eq!(
            err,
            FragmentError::MissingField {
                kind: "request",
                field: "Connection ID"
            }
        );
    }

    #[test]
    fn test_malformed_json() {
        assert!(Fragment::parse_line("{not json").is_err());
    }
}
