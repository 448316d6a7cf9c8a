//! Patch-up: reclassify recorded lines as executable or not
//!
//! Trackers record whatever the interpreter reports, which includes lines
//! that cannot meaningfully be "covered" (blank lines, comments, a bare `end`).
//! Patch-up walks the source (or a static analysis map), marks those lines
//! non-executable, and wipes anything recorded for them.

use super::line::{FileRecord, LineRecord};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

/// Per-line executable classification (1-based line numbers)
pub type ExecutableMap = BTreeMap<u32, bool>;

/// Strategy deciding which lines of a source file are executable
pub trait LineClassifier: fmt::Debug {
    /// Classify every line of `source`
    fn classify(&self, source: &str) -> ExecutableMap;
}

/// What patch-up classifies against
#[derive(Debug, Clone, Copy)]
pub enum PatchupInput<'a> {
    /// Raw source text, classified heuristically
    Source(&'a str),
    /// Classification from a static analyzer; trusted as-is
    Static(&'a ExecutableMap),
}

/// Classifier backed by a precomputed map
#[derive(Debug, Clone, Default)]
pub struct StaticMapClassifier {
    map: ExecutableMap,
}

impl StaticMapClassifier {
    /// Wrap a static analysis result
    #[must_use]
    pub fn new(map: ExecutableMap) -> Self {
        Self { map }
    }
}

impl LineClassifier for StaticMapClassifier {
    fn classify(&self, _source: &str) -> ExecutableMap {
        self.map.clone()
    }
}

/// Pattern-based classifier for Lua source
///
/// Precedence per line: inside a multi-line comment, then comment-only or
/// blank, then structural-only, otherwise executable.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicClassifier;

impl HeuristicClassifier {
    /// Create the classifier
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn structural_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // end, end), end,  end;  end})
            r"^end[\s,;)\]}]*$",
            r"^(else|until|do|then|repeat)$",
            // signature-only function lines
            r"^(local\s+)?function\s*[\w.:]*\s*\([^)]*\)$",
            r"^[\w.\[\]'\x22]+\s*=\s*function\s*\([^)]*\)$",
            r"^return\s+function\s*\([^)]*\)$",
            // closing brackets only
            r"^[)\]}]+[,;]?$",
            // local a, b   (no initializer)
            r"^local\s+[A-Za-z_]\w*(\s*<\w+>)?(\s*,\s*[A-Za-z_]\w*(\s*<\w+>)?)*\s*;?$",
            // empty table literals
            r"^(local\s+)?[\w.\[\]'\x22]+\s*=\s*\{\s*\}\s*[,;]?$",
            r"^\{\s*\}\s*[,;]?$",
            // return M
            r"^return\s+[A-Za-z_][\w.]*\s*;?$",
            // goto labels
            r"^::[A-Za-z_]\w*::$",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Whether `code` (comments stripped, trimmed) carries no executable work
#[must_use]
pub fn is_structural(code: &str) -> bool {
    structural_patterns().iter().any(|re| re.is_match(code))
}

/// Open long bracket we are inside of at the end of a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Open {
    Comment(usize),
    Str(usize),
}

/// Level of a long bracket opener at the start of `s` (`[[` -> 0, `[==[` -> 2)
fn long_open_level(s: &str) -> Option<(usize, usize)> {
    let rest = s.strip_prefix('[')?;
    let level = rest.bytes().take_while(|&b| b == b'=').count();
    rest[level..].starts_with('[').then_some((level, level + 2))
}

fn find_long_close(s: &str, level: usize) -> Option<usize> {
    let close = format!("]{}]", "=".repeat(level));
    s.find(&close).map(|i| i + close.len())
}

/// Strip comments and string contents from one line.
///
/// Returns the remaining code (strings replaced by `""`) and the long bracket
/// left open at the end of the line, if any.
fn strip_line(line: &str, mut open: Option<Open>) -> (String, Option<Open>) {
    let mut code = String::with_capacity(line.len());
    let mut rest = line;

    if let Some(state) = open {
        let level = match state {
            Open::Comment(l) | Open::Str(l) => l,
        };
        match find_long_close(rest, level) {
            Some(end) => {
                rest = &rest[end..];
                open = None;
            }
            None => return (String::new(), Some(state)),
        }
    }

    let bytes = rest.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let tail = &rest[i..];
        if tail.starts_with("--") {
            if let Some((level, width)) = long_open_level(&tail[2..]) {
                match find_long_close(&tail[2 + width..], level) {
                    Some(end) => {
                        i += 2 + width + end;
                        continue;
                    }
                    None => return (code, Some(Open::Comment(level))),
                }
            }
            break;
        }
        match bytes[i] {
            b'"' | b'\'' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += if bytes[i] == b'\\' { 2 } else { 1 };
                }
                i += 1;
                code.push_str("\"\"");
            }
            b'[' => {
                if let Some((level, width)) = long_open_level(tail) {
                    code.push_str("\"\"");
                    match find_long_close(&tail[width..], level) {
                        Some(end) => i += width + end,
                        None => return (code, Some(Open::Str(level))),
                    }
                } else {
                    code.push('[');
                    i += 1;
                }
            }
            _ => {
                let ch_len = tail.chars().next().map_or(1, char::len_utf8);
                code.push_str(&tail[..ch_len]);
                i += ch_len;
            }
        }
    }
    (code, open)
}

impl LineClassifier for HeuristicClassifier {
    fn classify(&self, source: &str) -> ExecutableMap {
        let mut map = ExecutableMap::new();
        let mut open: Option<Open> = None;

        for (idx, raw) in source.lines().enumerate() {
            let number = idx as u32 + 1;
            let started_open = open.is_some();
            // shebang
            if number == 1 && raw.starts_with("#!") {
                map.insert(number, false);
                continue;
            }
            let (code, still_open) = strip_line(raw, open);
            open = still_open;
            let code = code.trim();
            let executable = !started_open && !code.is_empty() && !is_structural(code);
            map.insert(number, executable);
        }
        map
    }
}

/// Reclassify a file's lines against `input`
///
/// Returns the number of line records that changed. Running it twice with
/// the same input changes nothing the second time.
pub fn classify(file: &mut FileRecord, input: PatchupInput<'_>) -> usize {
    match input {
        PatchupInput::Source(source) => {
            let map = HeuristicClassifier.classify(source);
            let line_count = map.len() as u32;
            let mut patched = apply_map(file, &map);
            // lines past the end of the source cannot be executable
            let beyond: Vec<u32> = file
                .lines
                .range(line_count + 1..)
                .map(|(line, _)| *line)
                .collect();
            for line in beyond {
                patched += clear_line(file, line);
            }
            file.recompute_bounds();
            patched
        }
        PatchupInput::Static(map) => {
            let patched = apply_map(file, map);
            file.recompute_bounds();
            patched
        }
    }
}

/// Reclassify a file using any [`LineClassifier`]
pub fn classify_with(file: &mut FileRecord, classifier: &dyn LineClassifier, source: &str) -> usize {
    let map = classifier.classify(source);
    classify(file, PatchupInput::Static(&map))
}

fn apply_map(file: &mut FileRecord, map: &ExecutableMap) -> usize {
    let mut patched = 0;
    for (&line, &executable) in map {
        if executable {
            let record = file.lines.entry(line).or_insert_with(|| {
                patched += 1;
                LineRecord::default()
            });
            if !record.is_executable {
                record.is_executable = true;
                patched += 1;
            }
        } else {
            patched += clear_line(file, line);
        }
    }
    if let Some((&last, _)) = map.iter().next_back() {
        file.max_line = file.max_line.max(last);
    }
    patched
}

fn clear_line(file: &mut FileRecord, line: u32) -> usize {
    let record = file.lines.entry(line).or_default();
    let before = *record;
    record.clear_non_executable();
    usize::from(before != *record)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::coverage::LineState;

    fn exec_lines(source: &str) -> Vec<u32> {
        HeuristicClassifier
            .classify(source)
            .into_iter()
            .filter(|(_, e)| *e)
            .map(|(l, _)| l)
            .collect()
    }

    #[test]
    fn test_comment_blank_and_code() {
        let map = HeuristicClassifier.classify("-- comment\n\nlocal x = 1\n");
        assert_eq!(map.get(&1), Some(&false));
        assert_eq!(map.get(&2), Some(&false));
        assert_eq!(map.get(&3), Some(&true));
    }

    #[test]
    fn test_multiline_comment() {
        let src = "x = 1\n--[[\nprint('no')\n]]\ny = 2\n";
        assert_eq!(exec_lines(src), vec![1, 5]);
    }

    #[test]
    fn test_multiline_comment_with_level() {
        let src = "--[==[\n]]\nstill = 'comment'\n]==]\nz()\n";
        assert_eq!(exec_lines(src), vec![5]);
    }

    #[test]
    fn test_trailing_comment_stripped() {
        assert_eq!(exec_lines("end -- done\nfoo() -- call\n"), vec![2]);
    }

    #[test]
    fn test_comment_markers_inside_strings() {
        assert_eq!(exec_lines("s = '--not a comment'\n"), vec![1]);
    }

    #[test]
    fn test_long_string_continuation_lines() {
        let src = "local s = [[\nline\n]]\nprint(s)\n";
        assert_eq!(exec_lines(src), vec![1, 4]);
    }

    #[test]
    fn test_structural_lines() {
        let src = "\
local function f(a, b)
  if a then
    return a + 1
  else
    return b * 2
  end
end
local M = {}
local x
return M
";
        // 1 signature, 4 else, 6/7 end, 8 empty table, 9 bare local, 10 return M
        assert_eq!(exec_lines(src), vec![2, 3, 5]);
    }

    #[test]
    fn test_structural_patterns() {
        for code in ["end", "end)", "end,", "})", "}", ")", "do", "then", "repeat", "until",
            "function M.f(x)", "M.g = function(a, b)", "local a, b", "t = {}", "return self",
            "::continue::"] {
            assert!(is_structural(code), "{code} should be structural");
        }
        for code in ["x = 1", "foo()", "return x + 1", "local a = 1", "if x then",
            "until done", "local t = { 1 }", "return"] {
            assert!(!is_structural(code), "{code} should be executable");
        }
    }

    #[test]
    fn test_classify_clears_hits_on_non_executable() {
        let mut file = FileRecord::new();
        file.cover(1);
        file.execute(2);
        file.execute(3);
        let patched = classify(&mut file, PatchupInput::Source("-- comment\n\nlocal x = 1\n"));
        assert_eq!(patched, 2);
        assert!(!file.line(1).unwrap().is_executable);
        assert_eq!(file.line(1).unwrap().state, LineState::NotCovered);
        assert_eq!(file.line(2).unwrap().count, 0);
        assert!(file.line(3).unwrap().is_executable);
        assert_eq!(file.line(3).unwrap().count, 1);
        assert_eq!(file.max_hits, 1);
    }

    #[test]
    fn test_classify_adds_unhit_executable_lines() {
        let mut file = FileRecord::new();
        file.execute(1);
        classify(&mut file, PatchupInput::Source("a()\nb()\n"));
        let line2 = file.line(2).unwrap();
        assert!(line2.is_executable);
        assert_eq!(line2.state, LineState::NotCovered);
        assert_eq!(file.max_line, 2);
    }

    #[test]
    fn test_classify_idempotent() {
        let mut file = FileRecord::new();
        for line in 1..=6 {
            file.execute(line);
        }
        let src = "-- c\nlocal x = 1\nif x then\n  y()\nend\n\n";
        let first = classify(&mut file, PatchupInput::Source(src));
        let snapshot = file.clone();
        let second = classify(&mut file, PatchupInput::Source(src));
        assert!(first > 0);
        assert_eq!(second, 0);
        assert_eq!(file, snapshot);
    }

    #[test]
    fn test_lines_past_end_cleared() {
        let mut file = FileRecord::new();
        file.execute(9);
        classify(&mut file, PatchupInput::Source("a()\n"));
        assert!(!file.line(9).unwrap().is_executable);
    }

    #[test]
    fn test_static_map_trusted() {
        let mut file = FileRecord::new();
        file.execute(1);
        file.execute(2);
        // heuristics would call line 1 a comment; the analyzer says otherwise
        let map: ExecutableMap = [(1, true), (2, false)].into_iter().collect();
        classify(&mut file, PatchupInput::Static(&map));
        assert_eq!(file.line(1).unwrap().count, 1);
        assert_eq!(file.line(2).unwrap().count, 0);
    }

    #[test]
    fn test_classify_with_custom_strategy() {
        let mut file = FileRecord::new();
        file.execute(1);
        let classifier = StaticMapClassifier::new([(1, false)].into_iter().collect());
        assert_eq!(classify_with(&mut file, &classifier, "ignored"), 1);
        assert!(!file.line(1).unwrap().is_executable);
    }
}
