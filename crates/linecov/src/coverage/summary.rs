//! Coverage summaries
//!
//! Percentages are integers, floor-divided, and computed the same way for a
//! single file and for the whole store so that the two always agree.

use super::line::FileRecord;
use super::store::DataStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Line counters for one file or a whole store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LineTotals {
    /// Executable lines known
    pub total_lines: u64,
    /// Executable lines executed at least once
    pub executed_lines: u64,
    /// Executable lines verified by an assertion
    pub covered_lines: u64,
}

impl LineTotals {
    /// Count a file's lines
    #[must_use]
    pub fn of_file(file: &FileRecord) -> Self {
        let mut totals = Self::default();
        for record in file.lines.values().filter(|r| r.is_executable) {
            totals.total_lines += 1;
            if record.count > 0 {
                totals.executed_lines += 1;
            }
            if record.state == super::LineState::Covered {
                totals.covered_lines += 1;
            }
        }
        totals
    }

    /// Executed share of executable lines, floored
    #[must_use]
    pub fn line_percent(&self) -> u8 {
        percent(self.executed_lines, self.total_lines)
    }

    /// Verified share of executable lines, floored
    #[must_use]
    pub fn covered_percent(&self) -> u8 {
        percent(self.covered_lines, self.total_lines)
    }

    fn add(&mut self, other: &Self) {
        self.total_lines += other.total_lines;
        self.executed_lines += other.executed_lines;
        self.covered_lines += other.covered_lines;
    }
}

/// Coverage summary statistics
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CoverageSummary {
    /// Files in the store
    pub total_files: usize,
    /// Files with at least one executed line
    pub files_touched: usize,
    /// Line counters over all files
    pub totals: LineTotals,
    /// Per-file counters
    pub files: BTreeMap<String, LineTotals>,
}

impl CoverageSummary {
    /// Summarize a store
    #[must_use]
    pub fn calculate(store: &DataStore) -> Self {
        let mut summary = Self::default();
        for (path, file) in store.files() {
            let totals = LineTotals::of_file(file);
            summary.total_files += 1;
            if totals.executed_lines > 0 {
                summary.files_touched += 1;
            }
            summary.totals.add(&totals);
            summary.files.insert(path.to_string(), totals);
        }
        summary
    }

    /// Overall line coverage percentage
    #[must_use]
    pub fn line_percent(&self) -> u8 {
        self.totals.line_percent()
    }

    /// Overall verified-line percentage
    #[must_use]
    pub fn covered_percent(&self) -> u8 {
        self.totals.covered_percent()
    }

    /// Share of files with any executed line
    #[must_use]
    pub fn file_percent(&self) -> u8 {
        percent(self.files_touched as u64, self.total_files as u64)
    }

    /// Whether line coverage reaches `threshold` percent
    #[must_use]
    pub fn meets_threshold(&self, threshold: u8) -> bool {
        self.line_percent() >= threshold
    }
}

/// Summarize a store
#[must_use]
pub fn calculate_summary(store: &DataStore) -> CoverageSummary {
    CoverageSummary::calculate(store)
}

fn percent(part: u64, whole: u64) -> u8 {
    if whole == 0 {
        return 0;
    }
    (part.min(whole) * 100 / whole) as u8
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::coverage::LineRecord;

    fn file_with(lines: &[(u32, u64, bool)]) -> FileRecord {
        let mut file = FileRecord::new();
        for &(line, hits, executable) in lines {
            let mut record = LineRecord::default();
            record.add_hits(hits);
            if !executable {
                record.clear_non_executable();
            }
            file.lines.insert(line, record);
        }
        file.recompute_bounds();
        file
    }

    #[test]
    fn test_floor_division() {
        let mut store = DataStore::new();
        *store.file_entry("/a.lua") = file_with(&[(1, 1, true), (2, 0, true), (3, 0, true)]);
        let summary = calculate_summary(&store);
        // 1/3 = 33.33 -> 33
        assert_eq!(summary.line_percent(), 33);
        assert_eq!(summary.files["/a.lua"].line_percent(), 33);
    }

    #[test]
    fn test_non_executable_lines_ignored() {
        let mut store = DataStore::new();
        *store.file_entry("/a.lua") = file_with(&[(1, 0, false), (2, 4, true)]);
        let summary = calculate_summary(&store);
        assert_eq!(summary.totals.total_lines, 1);
        assert_eq!(summary.line_percent(), 100);
    }

    #[test]
    fn test_store_totals_consistent_with_files() {
        let mut store = DataStore::new();
        *store.file_entry("/a.lua") = file_with(&[(1, 1, true), (2, 0, true)]);
        *store.file_entry("/b.lua") = file_with(&[(1, 0, true), (2, 0, true), (3, 0, true)]);
        let summary = calculate_summary(&store);
        assert_eq!(summary.totals.total_lines, 5);
        assert_eq!(summary.totals.executed_lines, 1);
        assert_eq!(summary.line_percent(), 20);
        assert_eq!(summary.total_files, 2);
        assert_eq!(summary.files_touched, 1);
        assert_eq!(summary.file_percent(), 50);
    }

    #[test]
    fn test_empty_store_is_zero() {
        let summary = calculate_summary(&DataStore::new());
        assert_eq!(summary.line_percent(), 0);
        assert!(!summary.meets_threshold(1));
        assert!(summary.meets_threshold(0));
    }

    #[test]
    fn test_covered_percent() {
        let mut store = DataStore::new();
        store.record_coverage("/a.lua", 1);
        store.record_execution("/a.lua", 2);
        let summary = calculate_summary(&store);
        assert_eq!(summary.line_percent(), 100);
        assert_eq!(summary.covered_percent(), 50);
    }
}
