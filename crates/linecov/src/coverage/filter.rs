//! Include/exclude filtering of source paths
//!
//! A path is tracked iff it matches some include pattern (or there are none)
//! and matches no exclude pattern. Decisions are cached per path because the
//! hook tracker asks on every line event.

use crate::result::{CoverageError, CoverageResult};
use glob::{MatchOptions, Pattern};
use std::collections::HashMap;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
struct Rule {
    source: String,
    patterns: Vec<Pattern>,
    literal: bool,
}

impl Rule {
    fn compile(source: &str) -> CoverageResult<Self> {
        let bad = |e: glob::PatternError| {
            CoverageError::validation(format!("bad filter pattern {source:?}: {e}"))
        };
        let mut patterns = vec![Pattern::new(source).map_err(bad)?];
        // relative patterns match anywhere below the root
        if !source.starts_with('/') && !source.starts_with('*') {
            patterns.push(Pattern::new(&format!("**/{source}")).map_err(bad)?);
        }
        let literal = !source.contains(['*', '?', '[']);
        Ok(Self {
            source: source.to_string(),
            patterns,
            literal,
        })
    }

    fn matches(&self, path: &str) -> bool {
        (self.literal && path.contains(self.source.as_str()))
            || self
                .patterns
                .iter()
                .any(|p| p.matches_with(path, MATCH_OPTIONS))
    }
}

/// Compiled include/exclude rules with a per-path decision cache
#[derive(Debug, Clone, Default)]
pub struct FilterRules {
    include: Vec<Rule>,
    exclude: Vec<Rule>,
    ignored_files: HashMap<String, bool>,
}

impl FilterRules {
    /// Compile include and exclude pattern lists
    pub fn new(include: &[String], exclude: &[String]) -> CoverageResult<Self> {
        Ok(Self {
            include: include.iter().map(|p| Rule::compile(p)).collect::<CoverageResult<_>>()?,
            exclude: exclude.iter().map(|p| Rule::compile(p)).collect::<CoverageResult<_>>()?,
            ignored_files: HashMap::new(),
        })
    }

    /// Whether `path` should be tracked
    pub fn is_tracked(&mut self, path: &str) -> bool {
        if let Some(&ignored) = self.ignored_files.get(path) {
            return !ignored;
        }
        let tracked = self.evaluate(path);
        self.ignored_files.insert(path.to_string(), !tracked);
        tracked
    }

    /// Evaluate without consulting or filling the cache
    #[must_use]
    pub fn evaluate(&self, path: &str) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|r| r.matches(path));
        included && !self.exclude.iter().any(|r| r.matches(path))
    }

    /// Number of cached decisions
    #[must_use]
    pub fn cached(&self) -> usize {
        self.ignored_files.len()
    }

    /// Forget cached decisions
    pub fn reset(&mut self) {
        self.ignored_files.clear();
    }
}
