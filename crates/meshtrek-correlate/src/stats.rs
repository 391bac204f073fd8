//! Run statistics

use crate::error::DiscardReason;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

/// Counters for one or more correlation runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Log files taking part
    pub files: usize,

    /// Request fragments read from the entry file after trimming
    pub entries_seen: u64,

    /// Request fragments dropped by the warm-up/cool-down trim
    pub trimmed_entries: u64,

    /// Entries whose prefix had already been processed
    pub duplicate_entries: u64,

    /// Traces handed to the sink
    pub accepted: u64,

    /// Discarded traces per reason
    pub discarded: BTreeMap<&'static str, u64>,

    /// Malformed or invalid lines skipped while loading
    pub skipped_lines: u64,
}

impl RunStats {
    pub fn record_discard(&mut self, reason: &DiscardReason) {
        *self.discarded.entry(reason.label()).or_insert(0) += 1;
    }

    pub fn discarded_total(&self) -> u64 {
        self.discarded.values().sum()
    }

    /// Prefixes evaluated, accepted or not
    pub fn prefixes_processed(&self) -> u64 {
        self.accepted + self.discarded_total()
    }

    pub fn merge(&mut self, other: &RunStats) {
        self.files += other.files;
        self.entries_seen += other.entries_seen;
        self.trimmed_entries += other.trimmed_entries;
        self.duplicate_entries += other.duplicate_entries;
        self.accepted += other.accepted;
        self.skipped_lines += other.skipped_lines;
        for (reason, count) in &other.discarded {
            *self.discarded.entry(*reason).or_insert(0) += *count;
        }
    }

    pub fn log_summary(&self) {
        info!(
            "Correlation finished: {} accepted, {} discarded, {} duplicate entries, {} files, {} skipped lines",
            self.accepted,
            self.discarded_total(),
            self.duplicate_entries,
            self.files,
            self.skipped_lines
        );
        for (reason, count) in &self.discarded {
            info!("  discarded ({}): {}", reason, count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Side;

    #[test]
    fn test_discards_counted_by_label() {
        let mut stats = RunStats::default();
        stats.record_discard(&DiscardReason::LengthMismatch {
            found: 3,
            expected: vec![4],
        });
        stats.record_discard(&DiscardReason::LengthMismatch {
            found: 2,
            expected: vec![4],
        });
        stats.record_discard(&DiscardReason::UnsupportedMultiConnection {
            side: Side::Downstream,
            count: 3,
        });
        stats.accepted = 5;

        assert_eq!(stats.discarded["length_mismatch"], 2);
        assert_eq!(stats.discarded_total(), 3);
        assert_eq!(stats.prefixes_processed(), 8);
    }

    #[test]
    fn test_merge_and_serialize() {
        let mut a = RunStats {
            accepted: 1,
            files: 2,
            ..RunStats::default()
        };
        let mut b = RunStats {
            accepted: 2,
            skipped_lines: 4,
            ..RunStats::default()
        };
        b.discarded.insert("missing_response", 1);
        a.merge(&b);

        assert_eq!(a.accepted, 3);
        assert_eq!(a.skipped_lines, 4);
        assert_eq!(a.discarded_total(), 1);

        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["discarded"]["missing_response"], 1);
    }
}
