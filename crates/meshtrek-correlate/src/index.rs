//! Log directory layout and hashed fragment lookups
//!
//! [`LogDirectory`] decides which files take part in a run. [`IndexedStore`]
//! builds hash maps over one [`FragmentStore`] in a single pass, and
//! [`DirectoryIndex`] records which files mention each request-id prefix so
//! correlation only visits those.

use crate::error::{EngineError, EngineResult};
use meshtrek_core::{
    ConnectionFragment, Fragment, FragmentSource, FragmentStore, Protocol, RequestFragment,
    ResponseFragment,
};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Files of one capture run, entry file first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDirectory {
    pub entry: PathBuf,
    pub others: Vec<PathBuf>,
}

impl LogDirectory {
    /// List the log files under `dir`.
    ///
    /// `entry_file` may be a bare name inside `dir` or a path. Other files
    /// are the direct children of `dir` with the given extension, sorted by
    /// name.
    pub fn scan(dir: &Path, entry_file: &Path, extension: &str) -> EngineResult<Self> {
        let entry = if entry_file.is_absolute() || !dir.join(entry_file).is_file() {
            entry_file.to_path_buf()
        } else {
            dir.join(entry_file)
        };
        if !entry.is_file() {
            return Err(EngineError::EntryNotFound(entry));
        }

        let read_dir = fs::read_dir(dir).map_err(|source| EngineError::Directory {
            path: dir.to_path_buf(),
            source,
        })?;

        let entry_canonical = fs::canonicalize(&entry).unwrap_or_else(|_| entry.clone());
        let mut others = Vec::new();
        for item in read_dir {
            let path = item
                .map_err(|source| EngineError::Directory {
                    path: dir.to_path_buf(),
                    source,
                })?
                .path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(extension) {
                continue;
            }
            if fs::canonicalize(&path).unwrap_or_else(|_| path.clone()) == entry_canonical {
                continue;
            }
            others.push(path);
        }
        others.sort();

        debug!(
            "Scanned {}: entry {}, {} other log files",
            dir.display(),
            entry.display(),
            others.len()
        );
        Ok(Self { entry, others })
    }

    /// Number of files taking part
    pub fn file_count(&self) -> usize {
        1 + self.others.len()
    }
}

/// A fragment store with hashed lookups
#[derive(Debug, Clone)]
pub struct IndexedStore {
    store: FragmentStore,
    by_prefix: HashMap<String, Vec<usize>>,
    response_by_stream: HashMap<u64, usize>,
    connections_by_id: HashMap<u32, Vec<usize>>,
}

impl IndexedStore {
    pub fn new(store: FragmentStore) -> Self {
        let mut by_prefix: HashMap<String, Vec<usize>> = HashMap::new();
        let mut response_by_stream = HashMap::new();
        let mut connections_by_id: HashMap<u32, Vec<usize>> = HashMap::new();

        for (idx, fragment) in store.fragments().iter().enumerate() {
            match fragment {
                Fragment::Request(req) => {
                    by_prefix.entry(req.prefix().to_string()).or_default().push(idx);
                }
                Fragment::Response(resp) => {
                    response_by_stream.entry(resp.stream.stream_id).or_insert(idx);
                }
                Fragment::Connection(conn) => {
                    connections_by_id.entry(conn.connection_id).or_default().push(idx);
                }
                Fragment::Ignored => {}
            }
        }

        Self {
            store,
            by_prefix,
            response_by_stream,
            connections_by_id,
        }
    }

    /// Prefixes with at least one request fragment in this file
    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.by_prefix.keys().map(String::as_str)
    }
}

impl FragmentSource for IndexedStore {
    fn service_name(&self) -> &str {
        self.store.service_name()
    }

    fn find_by_identifier_prefix(&self, prefix: &str) -> Vec<&RequestFragment> {
        let fragments = self.store.fragments();
        self.by_prefix
            .get(prefix)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|&idx| match &fragments[idx] {
                        Fragment::Request(req) => Some(req),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn find_response_by_stream(&self, stream_id: u64) -> Option<&ResponseFragment> {
        let idx = *self.response_by_stream.get(&stream_id)?;
        match &self.store.fragments()[idx] {
            Fragment::Response(resp) => Some(resp),
            _ => None,
        }
    }

    fn find_connections(
        &self,
        connection_id: u32,
        plain_stream_id: Option<u32>,
        protocol: Protocol,
        stream_id: u64,
    ) -> Vec<&ConnectionFragment> {
        let fragments = self.store.fragments();
        let Some(indices) = self.connections_by_id.get(&connection_id) else {
            return Vec::new();
        };
        let mut matches = indices
            .iter()
            .filter_map(|&idx| match &fragments[idx] {
                Fragment::Connection(conn) => Some(conn),
                _ => None,
            })
            .filter(|conn| conn.serves(connection_id, plain_stream_id, protocol, stream_id));
        match protocol {
            Protocol::Http2 => matches.next().into_iter().collect(),
            Protocol::Http1 => matches.collect(),
        }
    }
}

/// Every file of a run loaded and indexed once
#[derive(Debug, Clone)]
pub struct DirectoryIndex {
    stores: Vec<IndexedStore>,
    files_by_prefix: HashMap<String, Vec<usize>>,
}

impl DirectoryIndex {
    /// Index the entry store followed by the others, keeping that order.
    pub fn build(stores: Vec<FragmentStore>) -> Self {
        let stores: Vec<IndexedStore> = stores.into_iter().map(IndexedStore::new).collect();
        let mut files_by_prefix: HashMap<String, Vec<usize>> = HashMap::new();
        for (file_idx, store) in stores.iter().enumerate() {
            for prefix in store.prefixes() {
                files_by_prefix.entry(prefix.to_string()).or_default().push(file_idx);
            }
        }
        for files in files_by_prefix.values_mut() {
            files.sort_unstable();
        }
        Self {
            stores,
            files_by_prefix,
        }
    }

    pub fn stores(&self) -> &[IndexedStore] {
        &self.stores
    }

    /// Files mentioning `prefix`, in run order
    pub fn sources_for(&self, prefix: &str) -> Vec<&IndexedStore> {
        self.files_by_prefix
            .get(prefix)
            .map(|files| files.iter().map(|&idx| &self.stores[idx]).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshtrek_core::codec::{join_key, pack_stream_ids};
    use tempfile::tempdir;

    fn sample_store() -> FragmentStore {
        let packed = pack_stream_ids(&[1, 3]).unwrap();
        let lines = [
            format!(
                r#"{{"Request ID":"aaaaaaaaaaaaaaaa-1","Key":{},"Stream ID":100}}"#,
                join_key(9, 3)
            ),
            r#"{"Connection ID":4,"Stream ID":100,"Upstream Connection ID":12}"#.to_string(),
            r#"{"Connection ID":4,"Stream ID":100,"Upstream Connection ID":13}"#.to_string(),
            format!(r#"{{"Connection ID":9,"Parse Start Time":5,"Stream IDs":{}}}"#, packed.inline),
            r#"{"Connection ID":12,"Stream ID":100,"Parse Start Time":1}"#.to_string(),
            r#"{"Connection ID":12,"Stream ID":100,"Parse Start Time":2}"#.to_string(),
        ];
        let fragments = lines
            .iter()
            .map(|l| Fragment::parse_line(l).unwrap().unwrap())
            .collect();
        FragmentStore::from_fragments("productpage.log", "productpage", fragments)
    }

    #[test]
    fn test_indexed_matches_linear_store() {
        let store = sample_store();
        let indexed = IndexedStore::new(store.clone());

        assert_eq!(
            indexed.find_by_identifier_prefix("aaaaaaaaaaaaaaaa"),
            store.find_by_identifier_prefix("aaaaaaaaaaaaaaaa")
        );
        assert_eq!(
            indexed.find_response_by_stream(100),
            store.find_response_by_stream(100)
        );
        assert_eq!(indexed.find_response_by_stream(100).unwrap().upstream_connection_id, 12);
        assert_eq!(
            indexed.find_connections(9, Some(3), Protocol::Http2, 100),
            store.find_connections(9, Some(3), Protocol::Http2, 100)
        );
        assert_eq!(indexed.find_connections(12, None, Protocol::Http1, 100).len(), 2);
        assert!(indexed.find_connections(77, None, Protocol::Http1, 100).is_empty());
        assert!(indexed.find_by_identifier_prefix("zzzzzzzzzzzzzzzz").is_empty());
    }

    #[test]
    fn test_directory_index_sources_for() {
        let other = FragmentStore::from_fragments("reviews.log", "reviews", Vec::new());
        let index = DirectoryIndex::build(vec![sample_store(), other]);
        assert_eq!(index.stores().len(), 2);
        let sources = index.sources_for("aaaaaaaaaaaaaaaa");
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].service_name(), "productpage");
        assert!(index.sources_for("bbbbbbbbbbbbbbbb").is_empty());
    }

    #[test]
    fn test_scan_lists_logs_entry_first() {
        let dir = tempdir().unwrap();
        for name in ["reviews.log", "details.log", "productpage.log", "notes.txt"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        fs::create_dir(dir.path().join("nested.log")).unwrap();

        let layout = LogDirectory::scan(dir.path(), Path::new("productpage.log"), "log").unwrap();
        assert_eq!(layout.entry, dir.path().join("productpage.log"));
        assert_eq!(
            layout.others,
            vec![dir.path().join("details.log"), dir.path().join("reviews.log")]
        );
        assert_eq!(layout.file_count(), 3);
    }

    #[test]
    fn test_scan_missing_entry() {
        let dir = tempdir().unwrap();
        let result = LogDirectory::scan(dir.path(), Path::new("absent.log"), "log");
        assert!(matches!(result, Err(EngineError::EntryNotFound(_))));
    }
}
