//! Coverage configuration
//!
//! Read once when a session starts; the hot path only ever sees the cached,
//! validated copy.

use crate::result::{CoverageError, CoverageResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default number of recorded changes between automatic flushes
pub const DEFAULT_SAVE_STEP: usize = 100;
/// Default hard cap on unflushed changes
pub const DEFAULT_BUFFER_CAP: usize = 10_000;
/// Default consecutive write failures before the session pauses itself
pub const DEFAULT_MAX_WRITE_FAILURES: u32 = 3;
/// Largest line number the recorder accepts
pub const DEFAULT_MAX_LINE_NUMBER: u32 = 1_000_000;

/// Coverage collection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageConfig {
    /// Master switch; a disabled session records nothing
    pub enabled: bool,
    /// Glob patterns a file must match to be tracked (empty = everything)
    pub include: Vec<String>,
    /// Glob patterns that exclude a file from tracking
    pub exclude: Vec<String>,
    /// Where the stats file lives
    pub stats_file: PathBuf,
    /// Changes between automatic flushes (0 disables step flushing)
    pub save_step_size: usize,
    /// Unflushed changes that force a flush regardless of the step size
    pub buffer_cap: usize,
    /// Track chunks loaded from strings rather than files
    pub track_code_from_strings: bool,
    /// Minimum line coverage percentage a run must reach
    pub threshold: u8,
    /// Consecutive failed writes before the session pauses
    pub max_write_failures: u32,
    /// Upper bound accepted for recorded line numbers
    pub max_line_number: u32,
    /// Directory holding instrumented copies
    pub instrument_dir: PathBuf,
    /// Return automatic flush failures to the line-event caller
    pub propagate_flush_errors: bool,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            include: Vec::new(),
            exclude: Vec::new(),
            stats_file: PathBuf::from("linecov.stats.out"),
            save_step_size: DEFAULT_SAVE_STEP,
            buffer_cap: DEFAULT_BUFFER_CAP,
            track_code_from_strings: false,
            threshold: 90,
            max_write_failures: DEFAULT_MAX_WRITE_FAILURES,
            max_line_number: DEFAULT_MAX_LINE_NUMBER,
            instrument_dir: std::env::temp_dir().join("linecov"),
            propagate_flush_errors: false,
        }
    }
}

impl CoverageConfig {
    /// Create a builder for coverage config
    #[must_use]
    pub fn builder() -> CoverageConfigBuilder {
        CoverageConfigBuilder::default()
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(text: &str) -> CoverageResult<Self> {
        let config: Self = serde_yaml_ng::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML configuration file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> CoverageResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoverageError::not_found(format!("config file {}", path.display()))
            } else {
                CoverageError::io(format!("reading config {}", path.display()), e)
            }
        })?;
        Self::from_yaml_str(&text)
    }

    /// Check value ranges and pattern syntax
    pub fn validate(&self) -> CoverageResult<()> {
        if self.threshold > 100 {
            return Err(CoverageError::validation(format!(
                "threshold must be a percentage, got {}",
                self.threshold
            )));
        }
        if self.max_write_failures == 0 {
            return Err(CoverageError::validation(
                "max_write_failures must be at least 1",
            ));
        }
        if self.buffer_cap == 0 {
            return Err(CoverageError::validation("buffer_cap must be at least 1"));
        }
        if self.max_line_number == 0 {
            return Err(CoverageError::validation(
                "max_line_number must be at least 1",
            ));
        }
        if self.stats_file.as_os_str().is_empty() {
            return Err(CoverageError::validation("stats_file must not be empty"));
        }
        for pattern in self.include.iter().chain(&self.exclude) {
            glob::Pattern::new(pattern).map_err(|e| {
                CoverageError::validation(format!("bad filter pattern {pattern:?}: {e}"))
            })?;
        }
        Ok(())
    }
}

/// Builder for coverage configuration
#[derive(Debug, Default)]
pub struct CoverageConfigBuilder {
    config: CoverageConfig,
}

impl CoverageConfigBuilder {
    /// Enable or disable coverage
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Add an include pattern
    #[must_use]
    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.config.include.push(pattern.into());
        self
    }

    /// Add an exclude pattern
    #[must_use]
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.config.exclude.push(pattern.into());
        self
    }

    /// Set the stats file location
    #[must_use]
    pub fn stats_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.stats_file = path.into();
        self
    }

    /// Set the automatic flush step
    #[must_use]
    pub fn save_step_size(mut self, step: usize) -> Self {
        self.config.save_step_size = step;
        self
    }

    /// Set the unflushed-change cap
    #[must_use]
    pub fn buffer_cap(mut self, cap: usize) -> Self {
        self.config.buffer_cap = cap;
        self
    }

    /// Track chunks loaded from strings
    #[must_use]
    pub fn track_code_from_strings(mut self, enabled: bool) -> Self {
        self.config.track_code_from_strings = enabled;
        self
    }

    /// Set the coverage threshold percentage
    #[must_use]
    pub fn threshold(mut self, percent: u8) -> Self {
        self.config.threshold = percent;
        self
    }

    /// Set the consecutive write failure limit
    #[must_use]
    pub fn max_write_failures(mut self, max: u32) -> Self {
        self.config.max_write_failures = max;
        self
    }

    /// Set the largest accepted line number
    #[must_use]
    pub fn max_line_number(mut self, max: u32) -> Self {
        self.config.max_line_number = max;
        self
    }

    /// Set the directory for instrumented copies
    #[must_use]
    pub fn instrument_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.instrument_dir = dir.into();
        self
    }

    /// Surface automatic flush failures to line-event callers
    #[must_use]
    pub fn propagate_flush_errors(mut self, enabled: bool) -> Self {
        self.config.propagate_flush_errors = enabled;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> CoverageResult<CoverageConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
