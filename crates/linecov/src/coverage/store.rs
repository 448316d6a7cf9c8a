//! In-memory coverage data store
//!
//! Both trackers write here: the hook tracker through
//! [`Session::handle_line_event`](super::Session::handle_line_event) and
//! instrumented code through the runtime recorder. Keys are normalized,
//! symlink-resolved paths (or `[string]` chunk names).

use super::line::{FileRecord, LineRecord};
use crate::result::{CoverageError, CoverageResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DATA_FORMAT: &str = "linecov-data";
const DATA_VERSION: u32 = 1;

/// Coverage data for every tracked file
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataStore {
    files: BTreeMap<String, FileRecord>,
}

impl DataStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no file has been recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Number of files
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Record for one file
    #[must_use]
    pub fn file(&self, path: &str) -> Option<&FileRecord> {
        self.files.get(path)
    }

    /// Mutable record for one file
    pub fn file_mut(&mut self, path: &str) -> Option<&mut FileRecord> {
        self.files.get_mut(path)
    }

    /// Record for one file, created on first use
    pub fn file_entry(&mut self, path: &str) -> &mut FileRecord {
        self.files.entry(path.to_owned()).or_default()
    }

    /// Iterate files in path order
    pub fn files(&self) -> impl Iterator<Item = (&str, &FileRecord)> {
        self.files.iter().map(|(path, record)| (path.as_str(), record))
    }

    /// Iterate files mutably
    pub fn files_mut(&mut self) -> impl Iterator<Item = (&str, &mut FileRecord)> {
        self.files
            .iter_mut()
            .map(|(path, record)| (path.as_str(), record))
    }

    /// Record one execution of `line` in `path`
    pub fn record_execution(&mut self, path: &str, line: u32) -> LineRecord {
        *self.file_entry(path).execute(line)
    }

    /// Record a verified line in `path`
    pub fn record_coverage(&mut self, path: &str, line: u32) -> LineRecord {
        *self.file_entry(path).cover(line)
    }

    /// Add a batch of hits
    pub fn add_hits(&mut self, path: &str, line: u32, hits: u64) {
        self.file_entry(path).add_hits(line, hits);
    }

    /// Drop all data
    pub fn clear(&mut self) {
        self.files.clear();
    }

    /// Combine `other` into this store
    pub fn merge_from(&mut self, other: &Self) {
        for (path, record) in &other.files {
            match self.files.get_mut(path) {
                Some(mine) => mine.absorb(record),
                None => {
                    self.files.insert(path.clone(), record.clone());
                }
            }
        }
    }

    /// Combine two stores into a new one: counts add up, coverage ORs
    #[must_use]
    pub fn merge(a: &Self, b: &Self) -> Self {
        let mut merged = a.clone();
        merged.merge_from(b);
        merged
    }

    /// Encode the whole store as JSON text
    pub fn serialize(&self) -> CoverageResult<String> {
        let wire = WireStoreRef {
            format: DATA_FORMAT,
            version: DATA_VERSION,
            files: &self.files,
        };
        Ok(serde_json::to_string_pretty(&wire)?)
    }

    /// Decode a store produced by [`DataStore::serialize`]
    ///
    /// Rejects wrong types, non-positive line numbers, records whose state
    /// claims an execution that the count does not back up, and
    /// non-executable lines carrying hits.
    pub fn deserialize(text: &str) -> CoverageResult<Self> {
        let wire: WireStore = serde_json::from_str(text)?;
        if wire.format != DATA_FORMAT {
            return Err(CoverageError::validation(format!(
                "unexpected data format {:?}",
                wire.format
            )));
        }
        if wire.version != DATA_VERSION {
            return Err(CoverageError::validation(format!(
                "unsupported data version {}",
                wire.version
            )));
        }

        let mut files = BTreeMap::new();
        for (path, wire_file) in wire.files {
            if path.is_empty() {
                return Err(CoverageError::validation("empty file path in coverage data"));
            }
            let mut record = FileRecord {
                max_line: wire_file.max_line,
                max_hits: wire_file.max_hits,
                lines: BTreeMap::new(),
            };
            for (line, line_record) in wire_file.lines {
                let line = u32::try_from(line)
                    .ok()
                    .filter(|l| *l > 0)
                    .ok_or_else(|| {
                        CoverageError::validation(format!(
                            "{path}: line number {line} is not a positive integer"
                        ))
                    })?;
                if line_record.count == 0 && line_record.state != super::LineState::NotCovered {
                    return Err(CoverageError::validation(format!(
                        "{path}:{line}: state {} with zero count",
                        line_record.state.as_str()
                    )));
                }
                if !line_record.is_executable
                    && (line_record.count > 0 || line_record.state != super::LineState::NotCovered)
                {
                    return Err(CoverageError::validation(format!(
                        "{path}:{line}: non-executable line carries {} hits in state {}",
                        line_record.count,
                        line_record.state.as_str()
                    )));
                }
                record.lines.insert(line, line_record);
            }
            record.recompute_bounds();
            files.insert(path, record);
        }
        Ok(Self { files })
    }
}

#[derive(Serialize)]
struct WireStoreRef<'a> {
    format: &'a str,
    version: u32,
    files: &'a BTreeMap<String, FileRecord>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WireStore {
    format: String,
    version: u32,
    files: BTreeMap<String, WireFile>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WireFile {
    max_line: u32,
    max_hits: u64,
    lines: BTreeMap<i64, LineRecord>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::coverage::LineState;
    use crate::result::ErrorKind;

    fn sample() -> DataStore {
        let mut store = DataStore::new();
        store.record_execution("/src/a.lua", 1);
        store.record_execution("/src/a.lua", 1);
        store.record_coverage("/src/a.lua", 3);
        store.record_execution("/src/b.lua", 10);
        store
    }

    #[test]
    fn test_record_creates_lazily() {
        let store = sample();
        assert_eq!(store.file_count(), 2);
        let a = store.file("/src/a.lua").unwrap();
        assert_eq!(a.max_line, 3);
        assert_eq!(a.max_hits, 2);
        assert_eq!(a.line(3).unwrap().state, LineState::Covered);
    }

    #[test]
    fn test_merge_sums_and_ors() {
        let mut a = DataStore::new();
        a.record_execution("/f.lua", 1);
        a.record_coverage("/f.lua", 2);
        let mut b = DataStore::new();
        b.record_execution("/f.lua", 1);
        b.record_execution("/f.lua", 2);
        b.record_execution("/g.lua", 5);

        let c = DataStore::merge(&a, &b);
        let f = c.file("/f.lua").unwrap();
        assert_eq!(f.hits(1), 2);
        assert_eq!(f.hits(2), 2);
        assert_eq!(f.line(2).unwrap().state, LineState::Covered);
        assert_eq!(f.max_hits, 2);
        assert!(c.file("/g.lua").is_some());
        // inputs untouched
        assert_eq!(a.file("/f.lua").unwrap().hits(1), 1);
    }

    #[test]
    fn test_round_trip() {
        let store = sample();
        let text = store.serialize().unwrap();
        assert_eq!(DataStore::deserialize(&text).unwrap(), store);
    }

    #[test]
    fn test_deserialize_rejects_zero_line() {
        let text = r#"{"format":"linecov-data","version":1,"files":{"/a.lua":{"max_line":1,"max_hits":1,"lines":{"0":{"count":1,"state":"executed","is_executable":true}}}}}"#;
        let err = DataStore::deserialize(text).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("line number 0"));
    }

    #[test]
    fn test_deserialize_rejects_negative_line() {
        let text = r#"{"format":"linecov-data","version":1,"files":{"/a.lua":{"max_line":1,"max_hits":1,"lines":{"-4":{"count":1,"state":"executed","is_executable":true}}}}}"#;
        let err = DataStore::deserialize(text).unwrap_err();
        assert!(err.to_string().contains("-4"));
    }

    #[test]
    fn test_deserialize_rejects_wrong_types() {
        let text = r#"{"format":"linecov-data","version":1,"files":{"/a.lua":{"max_line":"many","max_hits":1,"lines":{}}}}"#;
        let err = DataStore::deserialize(text).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_deserialize_rejects_state_without_count() {
        let text = r#"{"format":"linecov-data","version":1,"files":{"/a.lua":{"max_line":1,"max_hits":0,"lines":{"1":{"count":0,"state":"covered","is_executable":true}}}}}"#;
        assert!(DataStore::deserialize(text).is_err());
    }

    #[test]
    fn test_deserialize_rejects_covered_non_executable_line() {
        let text = r#"{"format":"linecov-data","version":1,"files":{"/a.lua":{"max_line":1,"max_hits":5,"lines":{"1":{"count":5,"state":"covered","is_executable":false}}}}}"#;
        let err = DataStore::deserialize(text).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("non-executable"));
    }

    #[test]
    fn test_deserialize_accepts_cleared_non_executable_line() {
        let text = r#"{"format":"linecov-data","version":1,"files":{"/a.lua":{"max_line":1,"max_hits":0,"lines":{"1":{"count":0,"state":"not_covered","is_executable":false}}}}}"#;
        let store = DataStore::deserialize(text).unwrap();
        assert!(!store.file("/a.lua").unwrap().line(1).unwrap().is_executable);
    }

    #[test]
    fn test_deserialize_rejects_foreign_format() {
        let text = r#"{"format":"other","version":1,"files":{}}"#;
        assert!(DataStore::deserialize(text).is_err());
    }
}
