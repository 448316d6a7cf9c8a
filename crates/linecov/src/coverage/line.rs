//! Per-line and per-file coverage records
//!
//! A line only ever moves upward through its states:
//! `NotCovered -> Executed -> Covered`. Counts never decrease within a
//! session; the only thing allowed to wipe a line is patch-up deciding the line
//! is not executable at all.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Coverage state of a single line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineState {
    /// Never executed
    #[default]
    NotCovered,
    /// Executed at least once
    Executed,
    /// Executed and verified by a passing assertion
    Covered,
}

impl LineState {
    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotCovered => "not_covered",
            Self::Executed => "executed",
            Self::Covered => "covered",
        }
    }

    /// Move to `target` unless that would be a downgrade
    #[inline]
    #[must_use]
    pub fn upgrade(self, target: Self) -> Self {
        self.max(target)
    }
}

/// Coverage data for one line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRecord {
    /// Number of times the line executed
    pub count: u64,
    /// Coverage state
    pub state: LineState,
    /// Whether patch-up considers this line executable
    pub is_executable: bool,
}

impl Default for LineRecord {
    fn default() -> Self {
        Self {
            count: 0,
            state: LineState::NotCovered,
            is_executable: true,
        }
    }
}

impl LineRecord {
    /// Record one execution
    #[inline]
    pub fn execute(&mut self) {
        self.count = self.count.saturating_add(1);
        self.state = self.state.upgrade(LineState::Executed);
    }

    /// Record a passing assertion on this line (also an execution)
    #[inline]
    pub fn cover(&mut self) {
        self.count = self.count.saturating_add(1);
        self.state = self.state.upgrade(LineState::Covered);
    }

    /// Add `hits` executions in one step
    pub fn add_hits(&mut self, hits: u64) {
        if hits > 0 {
            self.count = self.count.saturating_add(hits);
            self.state = self.state.upgrade(LineState::Executed);
        }
    }

    /// Mark the line non-executable, dropping whatever was recorded
    pub fn clear_non_executable(&mut self) {
        self.count = 0;
        self.state = LineState::NotCovered;
        self.is_executable = false;
    }

    /// Combine another record for the same line into this one
    pub fn absorb(&mut self, other: &Self) {
        self.count = self.count.saturating_add(other.count);
        self.state = self.state.upgrade(other.state);
        self.is_executable = self.is_executable && other.is_executable;
        if !self.is_executable {
            self.count = 0;
            self.state = LineState::NotCovered;
        }
    }

    /// Executed at least once and still counted
    #[must_use]
    pub fn is_hit(&self) -> bool {
        self.is_executable && self.count > 0
    }
}

/// Coverage data for one source file
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileRecord {
    /// Highest line number observed
    pub max_line: u32,
    /// Highest single-line hit count observed
    pub max_hits: u64,
    /// Per-line records
    pub lines: BTreeMap<u32, LineRecord>,
}

impl FileRecord {
    /// Create an empty record
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one execution of `line`
    pub fn execute(&mut self, line: u32) -> &LineRecord {
        let record = self.lines.entry(line).or_default();
        record.execute();
        let count = record.count;
        self.bump_bounds(line, count);
        &self.lines[&line]
    }

    /// Record a passing assertion on `line`
    pub fn cover(&mut self, line: u32) -> &LineRecord {
        let record = self.lines.entry(line).or_default();
        record.cover();
        let count = record.count;
        self.bump_bounds(line, count);
        &self.lines[&line]
    }

    /// Add a batch of hits to `line`
    pub fn add_hits(&mut self, line: u32, hits: u64) {
        let record = self.lines.entry(line).or_default();
        record.add_hits(hits);
        let count = record.count;
        self.bump_bounds(line, count);
    }

    /// Get a line record
    #[must_use]
    pub fn line(&self, line: u32) -> Option<&LineRecord> {
        self.lines.get(&line)
    }

    /// Hit count of a line (0 when unknown)
    #[must_use]
    pub fn hits(&self, line: u32) -> u64 {
        self.lines.get(&line).map(|r| r.count).unwrap_or(0)
    }

    /// Combine another file's data into this one
    pub fn absorb(&mut self, other: &Self) {
        for (line, record) in &other.lines {
            self.lines
                .entry(*line)
                .and_modify(|mine| mine.absorb(record))
                .or_insert(*record);
        }
        self.max_line = self.max_line.max(other.max_line);
        self.recompute_bounds();
    }

    /// Recompute `max_hits` and raise `max_line` from the line map
    pub fn recompute_bounds(&mut self) {
        if let Some((&last, _)) = self.lines.iter().next_back() {
            self.max_line = self.max_line.max(last);
        }
        self.max_hits = self.lines.values().map(|r| r.count).max().unwrap_or(0);
    }

    #[inline]
    fn bump_bounds(&mut self, line: u32, count: u64) {
        if line > self.max_line {
            self.max_line = line;
        }
        if count > self.max_hits {
            self.max_hits = count;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering() {
        assert!(LineState::NotCovered < LineState::Executed);
        assert!(LineState::Executed < LineState::Covered);
        assert_eq!(LineState::Covered.upgrade(LineState::Executed), LineState::Covered);
    }

    #[test]
    fn test_execute_then_cover() {
        let mut record = LineRecord::default();
        record.execute();
        assert_eq!(record.state, LineState::Executed);
        record.cover();
        record.execute();
        assert_eq!(record.state, LineState::Covered);
        assert_eq!(record.count, 3);
    }

    #[test]
    fn test_clear_non_executable() {
        let mut record = LineRecord::default();
        record.cover();
        record.clear_non_executable();
        assert_eq!(record.count, 0);
        assert_eq!(record.state, LineState::NotCovered);
        assert!(!record.is_executable);
        assert!(!record.is_hit());
    }

    #[test]
    fn test_file_bounds() {
        let mut file = FileRecord::new();
        file.execute(4);
        file.execute(4);
        file.execute(2);
        assert_eq!(file.max_line, 4);
        assert_eq!(file.max_hits, 2);
        assert_eq!(file.hits(2), 1);
        assert_eq!(file.hits(9), 0);
    }

    #[test]
    fn test_absorb_non_executable_wins() {
        let mut a = FileRecord::new();
        a.execute(1);
        let mut b = FileRecord::new();
        b.lines.insert(
            1,
            LineRecord {
                count: 0,
                state: LineState::NotCovered,
                is_executable: false,
            },
        );
        a.absorb(&b);
        let line = a.line(1).unwrap();
        assert!(!line.is_executable);
        assert_eq!(line.count, 0);
        assert_eq!(a.max_hits, 0);
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&LineState::NotCovered).unwrap();
        assert_eq!(json, "\"not_covered\"");
    }
}
