//! In-memory fragment store for one log file
//!
//! A store is loaded once and then scanned as often as the correlator needs.
//! Lookups here are linear scans; `meshtrek-correlate` layers hash indexes on
//! top through the same [`FragmentSource`] trait.

use crate::codec::Protocol;
use crate::fragment::{
    ConnectionFragment, Fragment, FragmentError, RequestFragment, ResponseFragment,
};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record at {path}:{line}: {source}")]
    MalformedRecord {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid record at {path}:{line}: {source}")]
    InvalidRecord {
        path: PathBuf,
        line: usize,
        #[source]
        source: FragmentError,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Lookups the correlator needs from one log file
pub trait FragmentSource {
    /// Service that produced the file
    fn service_name(&self) -> &str;

    /// All request fragments whose id starts with `prefix`
    fn find_by_identifier_prefix(&self, prefix: &str) -> Vec<&RequestFragment>;

    /// First response for `stream_id` with a non-zero upstream connection
    fn find_response_by_stream(&self, stream_id: u64) -> Option<&ResponseFragment>;

    /// Connection fragments for one side of a hop.
    ///
    /// HTTP/2 yields at most one fragment whose packed stream-id set contains
    /// `plain_stream_id`. HTTP/1 yields every fragment on `connection_id`
    /// that served `stream_id`.
    fn find_connections(
        &self,
        connection_id: u32,
        plain_stream_id: Option<u32>,
        protocol: Protocol,
        stream_id: u64,
    ) -> Vec<&ConnectionFragment>;
}

/// Fragments parsed from one log file, in line order
#[derive(Debug, Clone, Default)]
pub struct FragmentStore {
    path: PathBuf,
    service_name: String,
    fragments: Vec<Fragment>,
    skipped_lines: usize,
}

impl FragmentStore {
    /// Load a newline-delimited JSON log.
    ///
    /// With `strict` set, the first malformed or invalid line aborts the load.
    /// Otherwise such lines are logged, counted and skipped.
    pub fn load(path: &Path, strict: bool) -> StoreResult<Self> {
        let io_error = |source: std::io::Error| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        let reader = BufReader::new(File::open(path).map_err(io_error)?);

        // Lines are split as raw bytes so a bad encoding on one line is a
        // malformed record rather than a failed read of the whole file.
        let mut store = Self::new(path, service_name_for(path));
        for (idx, line) in reader.split(b'\n').enumerate() {
            let line_number = idx + 1;
            let line = line.map_err(io_error)?;
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }

            match Fragment::parse_line(line) {
                Ok(Ok(fragment)) => store.fragments.push(fragment),
                Ok(Err(source)) => {
                    if strict {
                        return Err(StoreError::InvalidRecord {
                            path: path.to_path_buf(),
                            line: line_number,
                            source,
                        });
                    }
                    warn!("Skipping invalid record at {}:{}: {}", path.display(), line_number, source);
                    store.skipped_lines += 1;
                }
                Err(source) => {
                    if strict {
                        return Err(StoreError::MalformedRecord {
                            path: path.to_path_buf(),
                            line: line_number,
                            source,
                        });
                    }
                    warn!("Skipping malformed record at {}:{}: {}", path.display(), line_number, source);
                    store.skipped_lines += 1;
                }
            }
        }

        debug!(
            "Loaded {} fragments from {} ({} skipped)",
            store.fragments.len(),
            path.display(),
            store.skipped_lines
        );
        Ok(store)
    }

    /// Build a store from already-parsed fragments.
    pub fn from_fragments(
        path: impl Into<PathBuf>,
        service_name: impl Into<String>,
        fragments: Vec<Fragment>,
    ) -> Self {
        Self {
            path: path.into(),
            service_name: service_name.into(),
            fragments,
            skipped_lines: 0,
        }
    }

    fn new(path: &Path, service_name: String) -> Self {
        Self {
            path: path.to_path_buf(),
            service_name,
            fragments: Vec::new(),
            skipped_lines: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Lines dropped as malformed or invalid
    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    pub fn requests(&self) -> impl Iterator<Item = &RequestFragment> {
        self.fragments.iter().filter_map(|f| match f {
            Fragment::Request(req) => Some(req),
            _ => None,
        })
    }

    pub fn responses(&self) -> impl Iterator<Item = &ResponseFragment> {
        self.fragments.iter().filter_map(|f| match f {
            Fragment::Response(resp) => Some(resp),
            _ => None,
        })
    }

    pub fn connections(&self) -> impl Iterator<Item = &ConnectionFragment> {
        self.fragments.iter().filter_map(|f| match f {
            Fragment::Connection(conn) => Some(conn),
            _ => None,
        })
    }
}

impl FragmentSource for FragmentStore {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn find_by_identifier_prefix(&self, prefix: &str) -> Vec<&RequestFragment> {
        self.requests().filter(|req| req.prefix() == prefix).collect()
    }

    fn find_response_by_stream(&self, stream_id: u64) -> Option<&ResponseFragment> {
        self.responses()
            .find(|resp| resp.stream.stream_id == stream_id && resp.upstream_connection_id != 0)
    }

    fn find_connections(
        &self,
        connection_id: u32,
        plain_stream_id: Option<u32>,
        protocol: Protocol,
        stream_id: u64,
    ) -> Vec<&ConnectionFragment> {
        let mut matches = self
            .connections()
            .filter(|conn| conn.serves(connection_id, plain_stream_id, protocol, stream_id));
        match protocol {
            Protocol::Http2 => matches.next().into_iter().collect(),
            Protocol::Http1 => matches.collect(),
        }
    }
}

/// Service name for a log file: its file stem.
pub fn service_name_for(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{join_key, pack_stream_ids};
    use std::fs;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_log(dir: &Path, name: &str, lines: &[String]) -> PathBuf {
        let path = dir.join(name);
        let mut file = fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        path
    }

    fn sample_lines() -> Vec<String> {
        let packed = pack_stream_ids(&[1, 3, 5]).unwrap();
        vec![
            format!(
                r#"{{"Request ID":"aaaaaaaaaaaaaaaa-1","Key":{},"Stream ID":100}}"#,
                join_key(9, 3)
            ),
            format!(
                r#"{{"Request ID":"aaaaaaaaaaaaaaaa-2","Key":{},"Stream ID":101}}"#,
                join_key(9, 5)
            ),
            r#"{"Request ID":"bbbbbbbbbbbbbbbb","Connection ID":4,"Stream ID":200}"#.to_string(),
            r#"{"Connection ID":4,"Stream ID":100,"Upstream Connection ID":0}"#.to_string(),
            r#"{"Connection ID":4,"Stream ID":100,"Upstream Connection ID":12}"#.to_string(),
            format!(
                r#"{{"Connection ID":9,"Parse Start Time":5,"Parse End Time":9,"Stream IDs":{}}}"#,
                packed.inline
            ),
            r#"{"Connection ID":4,"Stream ID":200,"Parse Start Time":1}"#.to_string(),
            r#"{"Connection ID":4,"Stream ID":200,"Parse Start Time":2}"#.to_string(),
            r#"{"Connection ID":4,"Stream ID":201,"Parse Start Time":3}"#.to_string(),
        ]
    }

    #[test]
    fn test_load_and_lookups() {
        let dir = tempdir().unwrap();
        let path = write_log(dir.path(), "productpage.log", &sample_lines());
        let store = FragmentStore::load(&path, false).unwrap();

        assert_eq!(store.service_name(), "productpage");
        assert_eq!(store.find_by_identifier_prefix("aaaaaaaaaaaaaaaa").len(), 2);
        assert_eq!(store.find_by_identifier_prefix("bbbbbbbbbbbbbbbb").len(), 1);

        let resp = store.find_response_by_stream(100).unwrap();
        assert_eq!(resp.upstream_connection_id, 12);
        assert!(store.find_response_by_stream(999).is_none());

        let h2 = store.find_connections(9, Some(5), Protocol::Http2, 0);
        assert_eq!(h2.len(), 1);
        assert!(store.find_connections(9, Some(4), Protocol::Http2, 0).is_empty());
        assert!(store.find_connections(9, None, Protocol::Http2, 0).is_empty());

        let h1 = store.find_connections(4, None, Protocol::Http1, 200);
        assert_eq!(h1.len(), 2);
    }

    #[test]
    fn test_malformed_line_is_skipped_by_default() {
        let dir = tempdir().unwrap();
        let mut lines = sample_lines();
        lines.insert(1, "{broken".to_string());
        let path = write_log(dir.path(), "svc.log", &lines);

        let store = FragmentStore::load(&path, false).unwrap();
        assert_eq!(store.skipped_lines(), 1);
        assert_eq!(store.len(), sample_lines().len());
    }

    #[test]
    fn test_invalid_utf8_line_is_skipped_by_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("svc.log");
        let mut content = Vec::new();
        content.extend_from_slice(br#"{"Request ID":"bbbbbbbbbbbbbbbb","Connection ID":4,"Stream ID":200}"#);
        content.extend_from_slice(b"\n{\"Request ID\":\"\xff\xfe\"}\n");
        content.extend_from_slice(br#"{"Connection ID":4,"Stream ID":200,"Parse Start Time":1}"#);
        content.push(b'\n');
        fs::write(&path, content).unwrap();

        let store = FragmentStore::load(&path, false).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.skipped_lines(), 1);

        match FragmentStore::load(&path, true) {
            Err(StoreError::MalformedRecord { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected malformed record error, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_line_is_fatal_in_strict_mode() {
        let dir = tempdir().unwrap();
        let mut lines = sample_lines();
        lines.insert(1, "{broken".to_string());
        let path = write_log(dir.path(), "svc.log", &lines);

        match FragmentStore::load(&path, true) {
            Err(StoreError::MalformedRecord { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected malformed record error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let result = FragmentStore::load(&dir.path().join("absent.log"), false);
        assert!(matches!(result, Err(StoreError::Io { .. })));
    }
}
