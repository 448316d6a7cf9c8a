//! Stats file persistence
//!
//! The stats file is plain text:
//!
//! ```text
//! LINECOV-STATS 1
//! 4:/home/me/proj/src/a.lua
//! 0 3 0 1*
//! ```
//!
//! Each file takes two lines: `<max_line>:<path>` and `max_line`
//! space-separated hit counts. A trailing `*` marks a line verified by an
//! assertion. Lines with a zero count are not materialized on load.
//!
//! Saving writes the whole file to a temporary sibling and renames it into
//! place, so readers only ever see a complete old or complete new file.

use super::fs::FileSystem;
use super::line::LineState;
use super::store::DataStore;
use crate::result::{CoverageResult, ErrorKind};
use std::borrow::Cow;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, warn};

/// First line of every stats file
pub const STATS_HEADER: &str = "LINECOV-STATS 1";

/// Atomic stats file writer and best-effort reader
#[derive(Debug)]
pub struct Persistence {
    fs: Rc<dyn FileSystem>,
    stats_file: PathBuf,
    max_failures: u32,
    consecutive_failures: u32,
}

impl Persistence {
    /// Create a writer for `stats_file`
    #[must_use]
    pub fn new(fs: Rc<dyn FileSystem>, stats_file: impl Into<PathBuf>, max_failures: u32) -> Self {
        Self {
            fs,
            stats_file: stats_file.into(),
            max_failures: max_failures.max(1),
            consecutive_failures: 0,
        }
    }

    /// Path of the stats file
    #[must_use]
    pub fn stats_file(&self) -> &Path {
        &self.stats_file
    }

    /// Write `store` atomically
    ///
    /// Failures are counted; a success resets the count.
    pub fn save(&mut self, store: &DataStore) -> CoverageResult<()> {
        let text = encode(store);
        match self.write_atomic(&text) {
            Ok(()) => {
                if self.consecutive_failures > 0 {
                    debug!(previous_failures = self.consecutive_failures, "stats file write recovered");
                }
                self.consecutive_failures = 0;
                debug!(path = %self.stats_file.display(), files = store.file_count(), "saved stats file");
                Ok(())
            }
            Err(err) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                debug!(
                    path = %self.stats_file.display(),
                    failures = self.consecutive_failures,
                    error = %err,
                    "stats file write failed"
                );
                Err(err)
            }
        }
    }

    fn write_atomic(&self, text: &str) -> CoverageResult<()> {
        let dir = match self.stats_file.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        self.fs.create_dir_all(&dir)?;
        let temp = self.fs.write_temp(&dir, text)?;
        if let Err(err) = self.fs.rename(&temp, &self.stats_file) {
            if let Err(cleanup) = self.fs.remove_file(&temp) {
                debug!(path = %temp.display(), error = %cleanup, "could not remove temporary stats file");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Read the stats file
    ///
    /// A missing file is an empty store. Malformed content is read
    /// best-effort; other read failures are returned.
    pub fn load(&self) -> CoverageResult<DataStore> {
        match self.fs.read(&self.stats_file) {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                if matches!(text, Cow::Owned(_)) {
                    warn!(path = %self.stats_file.display(), "stats file is not valid UTF-8, reading best-effort");
                }
                Ok(decode(&text))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.stats_file.display(), "no stats file yet");
                Ok(DataStore::new())
            }
            Err(err) => Err(err),
        }
    }

    /// Whether consecutive failures have reached the limit
    #[must_use]
    pub fn threshold_reached(&self) -> bool {
        self.consecutive_failures >= self.max_failures
    }

    /// Failures since the last successful save
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Configured failure limit
    #[must_use]
    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }
}

/// Render a store in stats file format
#[must_use]
pub fn encode(store: &DataStore) -> String {
    let mut out = String::new();
    out.push_str(STATS_HEADER);
    out.push('\n');
    for (path, file) in store.files() {
        let _ = writeln!(out, "{}:{path}", file.max_line);
        let counts: Vec<String> = (1..=file.max_line)
            .map(|line| match file.line(line) {
                Some(record) if record.is_executable && record.state == LineState::Covered => {
                    format!("{}*", record.count)
                }
                Some(record) if record.is_executable => record.count.to_string(),
                _ => "0".to_string(),
            })
            .collect();
        out.push_str(&counts.join(" "));
        out.push('\n');
    }
    out
}

/// Parse stats file text, skipping whatever does not parse
#[must_use]
pub fn decode(text: &str) -> DataStore {
    let mut store = DataStore::new();
    let mut lines = text.lines().enumerate().peekable();

    match lines.peek() {
        Some((_, first)) if first.trim_end() == STATS_HEADER => {
            lines.next();
        }
        Some((_, first)) => {
            warn!(header = %first, "unrecognized stats file header, reading best-effort");
        }
        None => return store,
    }

    while let Some((index, header)) = lines.next() {
        if header.trim().is_empty() {
            continue;
        }
        let Some((max_line, path)) = parse_block_header(header) else {
            warn!(line = index + 1, "skipping malformed stats block header");
            continue;
        };
        let Some((_, counts)) = lines.next() else {
            warn!(line = index + 1, path, "stats block has no counts line");
            break;
        };
        match parse_counts(counts, max_line) {
            Some(parsed) => {
                let file = store.file_entry(path);
                for (line, (count, covered)) in (1..).zip(parsed) {
                    if count == 0 {
                        continue;
                    }
                    file.add_hits(line, count);
                    if covered {
                        if let Some(record) = file.lines.get_mut(&line) {
                            record.state = record.state.upgrade(LineState::Covered);
                        }
                    }
                }
                file.max_line = file.max_line.max(max_line);
            }
            None => warn!(line = index + 2, path, "skipping malformed stats counts"),
        }
    }
    store
}

fn parse_block_header(line: &str) -> Option<(u32, &str)> {
    let (max_line, path) = line.split_once(':')?;
    let max_line = max_line.trim().parse().ok()?;
    let path = path.trim_end();
    (!path.is_empty()).then_some((max_line, path))
}

fn parse_counts(line: &str, expected: u32) -> Option<Vec<(u64, bool)>> {
    let parsed = line
        .split_whitespace()
        .map(|token| match token.strip_suffix('*') {
            Some(count) => count.parse().ok().map(|c| (c, true)),
            None => token.parse().ok().map(|c| (c, false)),
        })
        .collect::<Option<Vec<_>>>()?;
    (parsed.len() == expected as usize).then_some(parsed)
}
