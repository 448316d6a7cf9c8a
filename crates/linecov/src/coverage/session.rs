//! Coverage session
//!
//! One [`Session`] owns everything a test run accumulates: configuration,
//! the data store, path mappings, filter caches, and the stats file writer.
//! Trackers share it as [`SharedSession`] and go through it for every write.

use super::fs::{FileSystem, OsFileSystem};
use super::filter::FilterRules;
use super::hook::LineEvent;
use super::instrument::{InstrumentedFile, Instrumenter, SourceMap};
use super::patchup::{self, PatchupInput};
use super::path_map::PathMapper;
use super::persistence::Persistence;
use super::recorder::validate_line;
use super::store::DataStore;
use super::summary::CoverageSummary;
use crate::config::CoverageConfig;
use crate::result::{CoverageError, CoverageResult};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::rc::Rc;
use tracing::{debug, error, info, trace, warn};

/// Session shared between the hook tracker and the runtime recorder
pub type SharedSession = Rc<RefCell<Session>>;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Created, never started
    #[default]
    Uninitialized,
    /// Recording
    Running,
    /// Started but not recording
    Paused,
    /// Finished; may be started again
    Shutdown,
}

impl SessionState {
    /// Lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Shutdown => "shutdown",
        }
    }

    /// Begin recording
    pub fn start(self) -> CoverageResult<Self> {
        match self {
            Self::Uninitialized | Self::Shutdown => Ok(Self::Running),
            other => Err(illegal("start", other)),
        }
    }

    /// Suspend a running session
    pub fn pause(self) -> CoverageResult<Self> {
        match self {
            Self::Running => Ok(Self::Paused),
            other => Err(illegal("pause", other)),
        }
    }

    /// Continue a paused session
    pub fn resume(self) -> CoverageResult<Self> {
        match self {
            Self::Paused => Ok(Self::Running),
            other => Err(illegal("resume", other)),
        }
    }

    /// Stop recording; unlike `pause`, tolerates an already paused session
    pub fn stop(self) -> CoverageResult<Self> {
        match self {
            Self::Running | Self::Paused => Ok(Self::Paused),
            other => Err(illegal("stop", other)),
        }
    }

    /// Whether line events are recorded in this state
    #[must_use]
    pub const fn is_recording(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn illegal(action: &str, state: SessionState) -> CoverageError {
    CoverageError::invalid_state(format!("cannot {action} a session that is {state}"))
}

/// Owned coverage session
#[derive(Debug)]
pub struct Session {
    config: CoverageConfig,
    state: SessionState,
    fs: Rc<dyn FileSystem>,
    store: DataStore,
    paths: PathMapper,
    filter: FilterRules,
    persistence: Persistence,
    instrumenter: Instrumenter,
    source_maps: BTreeMap<String, SourceMap>,
    chunks: HashMap<String, Option<String>>,
    pending: usize,
    auto_flush: bool,
}

impl Session {
    /// Create a session on the real file system
    pub fn new(config: CoverageConfig) -> CoverageResult<Self> {
        Self::with_file_system(config, Rc::new(OsFileSystem))
    }

    /// Create a session on a custom file system
    pub fn with_file_system(config: CoverageConfig, fs: Rc<dyn FileSystem>) -> CoverageResult<Self> {
        config.validate()?;
        let filter = FilterRules::new(&config.include, &config.exclude)?;
        let persistence =
            Persistence::new(fs.clone(), config.stats_file.clone(), config.max_write_failures);
        let instrumenter = Instrumenter::new(fs.clone(), config.instrument_dir.clone());
        Ok(Self {
            state: SessionState::Uninitialized,
            store: DataStore::new(),
            paths: PathMapper::new(fs.clone()),
            filter,
            persistence,
            instrumenter,
            source_maps: BTreeMap::new(),
            chunks: HashMap::new(),
            pending: 0,
            auto_flush: true,
            fs,
            config,
        })
    }

    /// Wrap in the shared handle trackers use
    #[must_use]
    pub fn into_shared(self) -> SharedSession {
        Rc::new(RefCell::new(self))
    }

    /// Configuration read at construction
    #[must_use]
    pub fn config(&self) -> &CoverageConfig {
        &self.config
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether writes are currently applied
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.config.enabled && self.state.is_recording()
    }

    // Lifecycle

    /// Start recording
    pub fn start(&mut self) -> CoverageResult<()> {
        self.state = self.state.start()?;
        self.pending = 0;
        self.auto_flush = true;
        if self.config.enabled {
            info!(stats_file = %self.config.stats_file.display(), "coverage session started");
        } else {
            info!("coverage session started with coverage disabled");
        }
        Ok(())
    }

    /// Suspend recording
    pub fn pause(&mut self) -> CoverageResult<()> {
        self.state = self.state.pause()?;
        debug!("coverage session paused");
        Ok(())
    }

    /// Continue recording
    pub fn resume(&mut self) -> CoverageResult<()> {
        self.state = self.state.resume()?;
        debug!("coverage session resumed");
        Ok(())
    }

    /// Stop recording without discarding anything
    pub fn stop(&mut self) -> CoverageResult<()> {
        self.state = self.state.stop()?;
        debug!(pending = self.pending, "coverage session stopped");
        Ok(())
    }

    /// Save, then reset all per-run state
    ///
    /// Path mappings survive so instrumented copies stay resolvable. Calling
    /// this again is a no-op.
    pub fn shutdown(&mut self) -> CoverageResult<()> {
        let saved = match self.state {
            SessionState::Shutdown => return Ok(()),
            SessionState::Uninitialized => Ok(()),
            SessionState::Running | SessionState::Paused if self.config.enabled => self.save(),
            SessionState::Running | SessionState::Paused => Ok(()),
        };
        self.reset();
        self.state = SessionState::Shutdown;
        info!("coverage session shut down");
        saved
    }

    // Recording

    /// Record a line reported by the interpreter's line hook
    pub fn handle_line_event(&mut self, event: &LineEvent<'_>) -> CoverageResult<()> {
        if !self.is_recording() {
            return Ok(());
        }
        if event.line < 1 || event.line > i64::from(self.config.max_line_number) {
            trace!(line = event.line, "ignoring out-of-range line event");
            return Ok(());
        }
        let key = match self.chunks.get(event.source) {
            Some(resolved) => resolved.clone(),
            None => {
                let resolved = self.resolve_chunk(event.source);
                self.chunks.insert(event.source.to_owned(), resolved.clone());
                resolved
            }
        };
        let Some(key) = key else {
            return Ok(());
        };
        self.store.record_execution(&key, event.line as u32);
        self.note_change()
    }

    /// Record an execution reported by instrumented code
    pub fn record_execution(&mut self, instrumented: &Path, line: i64) -> CoverageResult<()> {
        let line = validate_line(line, self.config.max_line_number)?;
        if !self.is_recording() {
            return Ok(());
        }
        let original = self.resolve_instrumented(instrumented)?;
        self.store.record_execution(&original, line);
        self.note_change()
    }

    /// Record a passing assertion reported for an instrumented line
    pub fn record_coverage(&mut self, instrumented: &Path, line: i64) -> CoverageResult<()> {
        let line = validate_line(line, self.config.max_line_number)?;
        if !self.is_recording() {
            return Ok(());
        }
        let original = self.resolve_instrumented(instrumented)?;
        self.store.record_coverage(&original, line);
        self.note_change()
    }

    fn resolve_instrumented(&self, instrumented: &Path) -> CoverageResult<String> {
        self.paths
            .get_original_path(instrumented)
            .map(|p| p.to_string_lossy().into_owned())
            .ok_or_else(|| {
                CoverageError::not_found(format!(
                    "no original registered for {}",
                    instrumented.display()
                ))
            })
    }

    /// Map a chunk name to a store key, or `None` when it is not tracked
    fn resolve_chunk(&mut self, source: &str) -> Option<String> {
        if let Some(file) = source.strip_prefix('@') {
            let path = self.paths.canonical(Path::new(file));
            let path = self
                .paths
                .get_original_path(&path)
                .map_or(path.clone(), Path::to_path_buf);
            let key = path.to_string_lossy().into_owned();
            let tracked = self.filter.is_tracked(&key);
            debug!(path = %key, tracked, "resolved source file");
            return tracked.then_some(key);
        }
        if source.starts_with('=') || !self.config.track_code_from_strings {
            return None;
        }
        let first = source.lines().next().unwrap_or_default().trim();
        Some(format!("[string \"{first}\"]"))
    }

    fn note_change(&mut self) -> CoverageResult<()> {
        self.pending = self.pending.saturating_add(1);
        let step = self.config.save_step_size;
        let due = (step > 0 && self.pending >= step) || self.pending >= self.config.buffer_cap;
        if !due || !self.auto_flush {
            return Ok(());
        }
        match self.persistence.save(&self.store) {
            Ok(()) => {
                self.pending = 0;
                Ok(())
            }
            Err(err) => {
                self.after_write_failure();
                if self.config.propagate_flush_errors {
                    return Err(err);
                }
                // no further automatic flushes; explicit saves still run
                self.auto_flush = false;
                debug!(
                    error = %err,
                    failures = self.persistence.consecutive_failures(),
                    "automatic flush failed, automatic flushing disabled"
                );
                Ok(())
            }
        }
    }

    fn after_write_failure(&mut self) {
        if !self.persistence.threshold_reached() {
            return;
        }
        self.auto_flush = false;
        if self.state == SessionState::Running {
            self.state = SessionState::Paused;
            error!(
                path = %self.persistence.stats_file().display(),
                failures = self.persistence.consecutive_failures(),
                "coverage data stopped updating: the stats file could not be written \
                 {} times in a row, session paused",
                self.persistence.consecutive_failures()
            );
        }
    }

    // Persistence

    /// Write the store to the stats file, propagating failures
    pub fn save(&mut self) -> CoverageResult<()> {
        match self.persistence.save(&self.store) {
            Ok(()) => {
                self.pending = 0;
                Ok(())
            }
            Err(err) => {
                self.after_write_failure();
                Err(err)
            }
        }
    }

    /// Read the stats file without touching the live store
    pub fn load(&self) -> CoverageResult<DataStore> {
        self.persistence.load()
    }

    /// Merge the stats file into the live store
    pub fn merge_saved(&mut self) -> CoverageResult<()> {
        let saved = self.persistence.load()?;
        debug!(files = saved.file_count(), "merging saved stats");
        self.store.merge_from(&saved);
        Ok(())
    }

    /// Consecutive failed stats file writes
    #[must_use]
    pub fn consecutive_write_failures(&self) -> u32 {
        self.persistence.consecutive_failures()
    }

    // Data

    /// Live coverage data
    #[must_use]
    pub fn get_current_data(&self) -> &DataStore {
        &self.store
    }

    /// Aggregate percentages over the live store
    #[must_use]
    pub fn calculate_summary(&self) -> CoverageSummary {
        CoverageSummary::calculate(&self.store)
    }

    /// Whether line coverage reaches the configured threshold
    #[must_use]
    pub fn meets_threshold(&self) -> bool {
        self.calculate_summary().meets_threshold(self.config.threshold)
    }

    /// Drop recorded data and caches
    pub fn reset(&mut self) {
        self.store.clear();
        self.chunks.clear();
        self.filter.reset();
        self.pending = 0;
    }

    // Instrumentation

    /// Instrument a source file and remember its line map
    pub fn instrument(&mut self, original: &Path) -> CoverageResult<InstrumentedFile> {
        let instrumented = self.instrumenter.instrument(original, &mut self.paths)?;
        let key = instrumented.original_path.to_string_lossy().into_owned();
        self.source_maps.insert(key, instrumented.source_map.clone());
        self.chunks.clear();
        Ok(instrumented)
    }

    /// Register a mapping made outside [`Session::instrument`]
    pub fn register_path_pair(&mut self, original: &Path, instrumented: &Path) {
        self.paths.register_path_pair(original, instrumented);
        self.chunks.clear();
    }

    /// Path registry
    #[must_use]
    pub fn paths(&self) -> &PathMapper {
        &self.paths
    }

    /// Forget every path mapping and line map
    pub fn clear_paths(&mut self) {
        self.paths.clear();
        self.source_maps.clear();
        self.chunks.clear();
    }

    // Patch-up

    /// Patch up one file from its line map, or from `source` when it has none
    ///
    /// Files with no record are left alone and count as zero.
    pub fn patchup_source(&mut self, path: &str, source: &str) -> usize {
        let Some(file) = self.store.file_mut(path) else {
            trace!(path, "no record to patch up");
            return 0;
        };
        match self.source_maps.get(path) {
            Some(map) => patchup::classify(file, PatchupInput::Static(&map.executable)),
            None => patchup::classify(file, PatchupInput::Source(source)),
        }
    }

    /// Patch up one file, reading its source when no line map is known
    pub fn patchup_file(&mut self, path: &str) -> CoverageResult<usize> {
        let Some(file) = self.store.file_mut(path) else {
            trace!(path, "no record to patch up");
            return Ok(0);
        };
        if let Some(map) = self.source_maps.get(path) {
            return Ok(patchup::classify(file, PatchupInput::Static(&map.executable)));
        }
        let source = self.fs.read_to_string(Path::new(path))?;
        Ok(patchup::classify(file, PatchupInput::Source(&source)))
    }

    /// Patch up every file in the store
    ///
    /// Files whose source cannot be read are left as recorded.
    pub fn patchup_all(&mut self) -> usize {
        let mut patched = 0;
        for (path, file) in self.store.files_mut() {
            if let Some(map) = self.source_maps.get(path) {
                patched += patchup::classify(file, PatchupInput::Static(&map.executable));
                continue;
            }
            if path.starts_with("[string") {
                continue;
            }
            match self.fs.read_to_string(Path::new(path)) {
                Ok(source) => patched += patchup::classify(file, PatchupInput::Source(&source)),
                Err(err) => warn!(path, error = %err, "cannot read source for patch-up"),
            }
        }
        debug!(patched, "patched up coverage data");
        patched
    }
}
