//! Correlation run driver
//!
//! The engine walks the entry file's request fragments in line order, builds
//! one trace per unseen prefix, filters it and hands it to a [`TraceSink`].
//! Prefixes are remembered across runs, so feeding the same directory twice
//! never emits or re-evaluates a trace.

use crate::correlator::Correlator;
use crate::error::{DiscardReason, EngineError, EngineResult};
use crate::index::{DirectoryIndex, IndexedStore, LogDirectory};
use crate::sink::TraceSink;
use crate::stats::RunStats;
use crate::topology::Topology;
use crate::trace::{RequestTrace, TraceMetadata};
use meshtrek_core::config::CorrelationSettings;
use meshtrek_core::{FragmentStore, RequestFragment, ScanMode};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Engine settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub log_extension: String,
    pub required_span_lengths: Vec<usize>,
    pub trim_fraction: f64,
    pub scan_mode: ScanMode,
    pub strict_parse: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&CorrelationSettings::default())
    }
}

impl From<&CorrelationSettings> for EngineConfig {
    fn from(settings: &CorrelationSettings) -> Self {
        Self {
            log_extension: settings.log_extension.clone(),
            required_span_lengths: settings.required_span_lengths.clone(),
            trim_fraction: settings.trim_fraction,
            scan_mode: settings.scan_mode,
            strict_parse: settings.strict_parse,
        }
    }
}

enum Lookup {
    Indexed(DirectoryIndex),
    Rescan {
        entry: IndexedStore,
        others: Vec<PathBuf>,
        counted: Vec<bool>,
    },
}

/// Correlates capture directories into request traces
pub struct TraceEngine {
    config: EngineConfig,
    topology: Option<Topology>,
    processed: HashSet<String>,
}

impl TraceEngine {
    pub fn new(config: EngineConfig, topology: Option<Topology>) -> Self {
        Self {
            config,
            topology,
            processed: HashSet::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Prefixes evaluated so far, accepted or discarded
    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    pub fn is_processed(&self, prefix: &str) -> bool {
        self.processed.contains(prefix)
    }

    /// Correlate one capture directory into `sink`.
    ///
    /// The sink is not finished here so several directories can share it.
    pub fn run_directory<S: TraceSink>(
        &mut self,
        dir: &Path,
        entry_file: &Path,
        sink: &mut S,
    ) -> EngineResult<RunStats> {
        let layout = LogDirectory::scan(dir, entry_file, &self.config.log_extension)?;
        info!(
            "Correlating {} log files under {} (entry {}, {:?} scan)",
            layout.file_count(),
            dir.display(),
            layout.entry.display(),
            self.config.scan_mode
        );

        let mut stats = RunStats {
            files: layout.file_count(),
            ..RunStats::default()
        };

        let entry = FragmentStore::load(&layout.entry, self.config.strict_parse)?;
        stats.skipped_lines += entry.skipped_lines() as u64;
        let prefixes = self.entry_prefixes(&entry, &mut stats);

        let mut lookup = match self.config.scan_mode {
            ScanMode::Indexed => {
                let mut stores = Vec::with_capacity(layout.file_count());
                stores.push(entry);
                for path in &layout.others {
                    let store = FragmentStore::load(path, self.config.strict_parse)?;
                    stats.skipped_lines += store.skipped_lines() as u64;
                    stores.push(store);
                }
                Lookup::Indexed(DirectoryIndex::build(stores))
            }
            ScanMode::Rescan => Lookup::Rescan {
                entry: IndexedStore::new(entry),
                counted: vec![false; layout.others.len()],
                others: layout.others,
            },
        };

        for prefix in prefixes {
            if !self.processed.insert(prefix.clone()) {
                stats.duplicate_entries += 1;
                continue;
            }

            let outcome = match &mut lookup {
                Lookup::Indexed(index) => {
                    let mut correlator = Correlator::new(prefix.as_str());
                    index
                        .sources_for(&prefix)
                        .into_iter()
                        .try_for_each(|source| correlator.scan(source))
                        .map(|()| correlator.finish())
                }
                Lookup::Rescan {
                    entry,
                    others,
                    counted,
                } => self.rescan(&prefix, entry, others, counted, &mut stats)?,
            };

            match outcome.and_then(|trace| self.check_length(trace)) {
                Ok(trace) => {
                    let metadata = self.metadata(&trace);
                    debug!(
                        "Accepted {} with {} hops, overhead {:.3}ms",
                        trace.prefix,
                        trace.len(),
                        metadata.overhead
                    );
                    sink.accept(trace, metadata).map_err(EngineError::sink)?;
                    stats.accepted += 1;
                }
                Err(reason) => {
                    debug!("Discarding {}: {}", prefix, reason);
                    stats.record_discard(&reason);
                }
            }
        }

        stats.log_summary();
        Ok(stats)
    }

    /// Request prefixes of the entry file in line order, after dropping
    /// `floor(n * trim_fraction)` requests from each end.
    fn entry_prefixes(&self, entry: &FragmentStore, stats: &mut RunStats) -> Vec<String> {
        let requests: Vec<&RequestFragment> = entry.requests().collect();
        let trim = (requests.len() as f64 * self.config.trim_fraction).floor() as usize;
        let keep = requests
            .get(trim..requests.len().saturating_sub(trim))
            .unwrap_or_default();

        stats.entries_seen += keep.len() as u64;
        stats.trimmed_entries += (requests.len() - keep.len()) as u64;
        if trim > 0 {
            debug!(
                "Trimmed {} requests at each end of {}",
                trim,
                entry.path().display()
            );
        }
        keep.iter().map(|req| req.prefix().to_string()).collect()
    }

    /// Resolve one prefix by re-reading every other file.
    fn rescan(
        &self,
        prefix: &str,
        entry: &IndexedStore,
        others: &[PathBuf],
        counted: &mut [bool],
        stats: &mut RunStats,
    ) -> EngineResult<Result<RequestTrace, DiscardReason>> {
        let mut correlator = Correlator::new(prefix);
        if let Err(reason) = correlator.scan(entry) {
            return Ok(Err(reason));
        }
        for (path, counted) in others.iter().zip(counted.iter_mut()) {
            let store = FragmentStore::load(path, self.config.strict_parse)?;
            if !*counted {
                stats.skipped_lines += store.skipped_lines() as u64;
                *counted = true;
            }
            if let Err(reason) = correlator.scan(&store) {
                return Ok(Err(reason));
            }
        }
        Ok(Ok(correlator.finish()))
    }

    fn check_length(&self, trace: RequestTrace) -> Result<RequestTrace, DiscardReason> {
        let expected = &self.config.required_span_lengths;
        if expected.is_empty() || expected.contains(&trace.len()) {
            Ok(trace)
        } else {
            Err(DiscardReason::LengthMismatch {
                found: trace.len(),
                expected: expected.clone(),
            })
        }
    }

    fn metadata(&self, trace: &RequestTrace) -> TraceMetadata {
        match &self.topology {
            Some(topology) => topology.metadata(trace),
            None => TraceMetadata::naive(&trace.hops),
        }
    }
}
