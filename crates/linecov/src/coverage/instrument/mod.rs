//! Source instrumentation
//!
//! Rewrites a Lua file so that every executable statement is preceded by a
//! call to the runtime recorder:
//!
//! ```text
//! local x = compute()          __linecov_track("/tmp/linecov/ab12../a.lua", 3); local x = compute()
//! if x then            ==>     __linecov_track("/tmp/linecov/ab12../a.lua", 4); if x then
//!   print(x)                     __linecov_track("/tmp/linecov/ab12../a.lua", 5); print(x)
//! end                          end
//! ```
//!
//! Calls are only ever added on the line they describe, so line numbers in
//! the copy match the original. Comments, strings, and layout are untouched.

mod lexer;

pub use lexer::{tokenize, LexError, Token, TokenKind};

use super::fs::FileSystem;
use super::patchup::{ExecutableMap, HeuristicClassifier, LineClassifier};
use super::path_map::PathMapper;
use crate::result::{CoverageError, CoverageResult};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, info};

/// Global function instrumented code calls
pub const TRACK_FUNCTION: &str = "__linecov_track";

/// What the instrumenter learned about a file
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceMap {
    /// Lines in the original file
    pub line_count: u32,
    /// Per line: executable (a tracking call precedes it) or not
    pub executable: ExecutableMap,
    /// Lines that received a tracking call, ascending
    pub tracked: Vec<u32>,
}

/// Result of instrumenting one file
#[derive(Debug, Clone)]
pub struct InstrumentedFile {
    /// Canonical original path
    pub original_path: PathBuf,
    /// Canonical path of the rewritten copy
    pub instrumented_path: PathBuf,
    /// Line information
    pub source_map: SourceMap,
}

/// Rewrites source files to call [`TRACK_FUNCTION`]
#[derive(Debug)]
pub struct Instrumenter {
    fs: Rc<dyn FileSystem>,
    out_dir: PathBuf,
    classifier: Box<dyn LineClassifier>,
}

impl Instrumenter {
    /// Create an instrumenter writing copies below `out_dir`
    #[must_use]
    pub fn new(fs: Rc<dyn FileSystem>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            out_dir: out_dir.into(),
            classifier: Box::new(HeuristicClassifier),
        }
    }

    /// Use a different line classifier to decide where calls go
    #[must_use]
    pub fn with_classifier(mut self, classifier: Box<dyn LineClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Instrument `original`, write the copy, and register the pair
    pub fn instrument(
        &self,
        original: &Path,
        paths: &mut PathMapper,
    ) -> CoverageResult<InstrumentedFile> {
        if !self.fs.exists(original) {
            return Err(CoverageError::not_found(format!(
                "source file {}",
                original.display()
            )));
        }
        let original_path = paths.canonical(original);
        let source = self.fs.read_to_string(&original_path)?;

        let dir = self.out_dir.join(path_digest(&original_path));
        self.fs.create_dir_all(&dir)?;
        let file_name = original_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "chunk.lua".into());
        let instrumented_path = paths.canonical(&dir).join(file_name);

        let display = original_path.display().to_string();
        let (text, source_map) =
            self.rewrite(&display, &source, &instrumented_path.display().to_string())?;

        self.fs.write(&instrumented_path, &text)?;
        paths.register_path_pair(&original_path, &instrumented_path);

        info!(
            original = %original_path.display(),
            instrumented = %instrumented_path.display(),
            tracked = source_map.tracked.len(),
            "instrumented source file"
        );

        Ok(InstrumentedFile {
            original_path,
            instrumented_path,
            source_map,
        })
    }

    /// Rewrite `source` in memory
    ///
    /// `name` is used in error messages; `track_path` is the path literal the
    /// inserted calls pass to the recorder.
    pub fn rewrite(
        &self,
        name: &str,
        source: &str,
        track_path: &str,
    ) -> CoverageResult<(String, SourceMap)> {
        let tokens = tokenize(source).map_err(|e| CoverageError::syntax(name, e.line, e.message))?;
        let executable = self.classifier.classify(source);
        let tracked = find_track_points(&tokens, &executable)
            .map_err(|e| CoverageError::syntax(name, e.line, e.message))?;

        let literal = lua_string_literal(track_path);
        let mut out = String::with_capacity(source.len() + tracked.len() * (literal.len() + 32));
        let mut copied = 0;
        for point in &tracked {
            out.push_str(&source[copied..point.offset]);
            out.push_str(&format!("{TRACK_FUNCTION}({literal}, {}); ", point.line));
            copied = point.offset;
        }
        out.push_str(&source[copied..]);

        let line_count = source.lines().count() as u32;
        let tracked_lines: BTreeSet<u32> = tracked.iter().map(|p| p.line).collect();
        let source_map = SourceMap {
            line_count,
            executable: (1..=line_count).map(|l| (l, tracked_lines.contains(&l))).collect(),
            tracked: tracked_lines.into_iter().collect(),
        };
        debug!(file = name, tracked = source_map.tracked.len(), "rewrote source");
        Ok((out, source_map))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TrackPoint {
    offset: usize,
    line: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame<'src> {
    Bracket(&'src str, u32),
    Block(&'src str, u32),
    /// `while`/`for` header waiting for its `do`
    LoopHeader(&'src str, u32),
}

const CLOSERS: [(&str, &str); 3] = [(")", "("), ("]", "["), ("}", "{")];

/// Walk the token stream, validating block/bracket structure, and collect
/// the offsets where a tracking call may start a statement.
fn find_track_points(tokens: &[Token<'_>], executable: &ExecutableMap) -> Result<Vec<TrackPoint>, LexError> {
    let mut stack: Vec<Frame<'_>> = Vec::new();
    let mut tracked = Vec::new();
    let mut seen_lines = BTreeSet::new();
    let mut prev: Option<&Token<'_>> = None;

    for (idx, tok) in tokens.iter().enumerate() {
        let first_on_line = prev.map_or(true, |p| p.end_line < tok.line);
        let in_statement_context = matches!(stack.last(), None | Some(Frame::Block(..)));
        let wanted = executable.get(&tok.line).copied().unwrap_or(false);

        if first_on_line
            && in_statement_context
            && wanted
            && !seen_lines.contains(&tok.line)
            && allows_statement_after(prev)
        {
            let target = if starts_statement(tok) {
                Some(tok)
            } else if tok.is_keyword("else") {
                tokens
                    .get(idx + 1)
                    .filter(|next| next.line == tok.line && starts_statement(next))
            } else {
                None
            };
            if let Some(target) = target {
                tracked.push(TrackPoint {
                    offset: target.start,
                    line: tok.line,
                });
                seen_lines.insert(tok.line);
            }
        }

        track_structure(&mut stack, tok)?;
        prev = Some(tok);
    }

    if let Some(frame) = stack.last() {
        let (what, line) = match frame {
            Frame::Bracket(b, l) => (*b, *l),
            Frame::Block(k, l) | Frame::LoopHeader(k, l) => (*k, *l),
        };
        return Err(LexError {
            line,
            message: format!("'{what}' is never closed"),
        });
    }
    Ok(tracked)
}

fn track_structure<'src>(stack: &mut Vec<Frame<'src>>, tok: &Token<'src>) -> Result<(), LexError> {
    let unexpected = |what: &str| LexError {
        line: tok.line,
        message: format!("unexpected '{what}'"),
    };
    match tok.kind {
        lexer::TokenKind::Symbol => match tok.text {
            "(" | "[" | "{" => stack.push(Frame::Bracket(tok.text, tok.line)),
            ")" | "]" | "}" => {
                let opener = CLOSERS
                    .iter()
                    .find(|(close, _)| *close == tok.text)
                    .map(|(_, open)| *open);
                match stack.pop() {
                    Some(Frame::Bracket(open, _)) if Some(open) == opener => {}
                    _ => return Err(unexpected(tok.text)),
                }
            }
            _ => {}
        },
        lexer::TokenKind::Keyword => match tok.text {
            "function" | "if" | "repeat" => stack.push(Frame::Block(tok.text, tok.line)),
            "while" | "for" => stack.push(Frame::LoopHeader(tok.text, tok.line)),
            "do" => {
                // `do` either closes a loop header or opens a plain block
                if matches!(stack.last(), Some(Frame::LoopHeader(..))) {
                    stack.pop();
                }
                stack.push(Frame::Block("do", tok.line));
            }
            "end" => match stack.pop() {
                Some(Frame::Block("function" | "do" | "if", _)) => {}
                _ => return Err(unexpected("end")),
            },
            "until" => match stack.pop() {
                Some(Frame::Block("repeat", _)) => {}
                _ => return Err(unexpected("until")),
            },
            "then" | "else" | "elseif" => {
                if !matches!(stack.last(), Some(Frame::Block("if", _))) {
                    return Err(unexpected(tok.text));
                }
            }
            _ => {}
        },
        _ => {}
    }
    Ok(())
}

/// Can a new statement begin right after `prev`?
fn allows_statement_after(prev: Option<&Token<'_>>) -> bool {
    let Some(prev) = prev else {
        return true;
    };
    match prev.kind {
        TokenKind::Name | TokenKind::Number | TokenKind::Str => true,
        TokenKind::Keyword => matches!(
            prev.text,
            "then" | "do" | "else" | "repeat" | "end" | "break" | "true" | "false" | "nil"
        ),
        TokenKind::Symbol => matches!(prev.text, ")" | "]" | "}" | "..." | ";"),
    }
}

fn starts_statement(tok: &Token<'_>) -> bool {
    match tok.kind {
        TokenKind::Name => true,
        TokenKind::Keyword => matches!(
            tok.text,
            "local" | "function" | "if" | "for" | "while" | "repeat" | "return" | "break" | "goto" | "do"
        ),
        _ => false,
    }
}

fn lua_string_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn path_digest(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    let result = hasher.finalize();
    let hex = format!("{result:x}");
    hex[..16].to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::coverage::fs::OsFileSystem;
    use crate::result::ErrorKind;

    fn instrumenter() -> Instrumenter {
        Instrumenter::new(Rc::new(OsFileSystem), std::env::temp_dir().join("linecov-test"))
    }

    fn rewrite(source: &str) -> (String, SourceMap) {
        instrumenter().rewrite("t.lua", source, "/i/t.lua").unwrap()
    }

    fn call(line: u32) -> String {
        format!("__linecov_track(\"/i/t.lua\", {line}); ")
    }

    #[test]
    fn test_simple_statements() {
        let (out, map) = rewrite("local x = 1\nprint(x)\n");
        assert_eq!(out, format!("{}local x = 1\n{}print(x)\n", call(1), call(2)));
        assert_eq!(map.tracked, vec![1, 2]);
        assert_eq!(map.line_count, 2);
    }

    #[test]
    fn test_comments_and_blank_lines_untouched() {
        let (out, map) = rewrite("-- comment\n\nlocal x = 1\n");
        assert_eq!(out, format!("-- comment\n\n{}local x = 1\n", call(3)));
        assert_eq!(map.executable.get(&1), Some(&false));
        assert_eq!(map.executable.get(&2), Some(&false));
        assert_eq!(map.executable.get(&3), Some(&true));
    }

    #[test]
    fn test_indentation_preserved() {
        let src = "if ok then\n  run()\nelse\n  stop()\nend\n";
        let (out, map) = rewrite(src);
        assert_eq!(
            out,
            format!("{}if ok then\n  {}run()\nelse\n  {}stop()\nend\n", call(1), call(2), call(4))
        );
        assert_eq!(map.tracked, vec![1, 2, 4]);
    }

    #[test]
    fn test_multiline_expression_tracked_once() {
        let src = "local t = foo(1,\n  2,\n  3)\nlocal s = 'a' ..\n  'b'\n";
        let (_, map) = rewrite(src);
        assert_eq!(map.tracked, vec![1, 4]);
    }

    #[test]
    fn test_function_bodies_inside_calls() {
        let src = "describe('x', function()\n  it('y', function()\n    assert(true)\n  end)\nend)\n";
        let (_, map) = rewrite(src);
        assert_eq!(map.tracked, vec![1, 2, 3]);
    }

    #[test]
    fn test_table_fields_not_tracked() {
        let src = "local t = {\n  a = 1,\n  b = f(),\n}\n";
        let (_, map) = rewrite(src);
        assert_eq!(map.tracked, vec![1]);
    }

    #[test]
    fn test_long_strings_and_comments_not_tracked() {
        let src = "local s = [[\nx = 1\n]]\n--[[\ny = 2\n]]\nz = 3\n";
        let (_, map) = rewrite(src);
        assert_eq!(map.tracked, vec![1, 7]);
    }

    #[test]
    fn test_else_with_statement_on_same_line() {
        let src = "if a then\n  b()\nelse c()\nend\n";
        let (out, map) = rewrite(src);
        assert!(out.contains(&format!("else {}c()", call(3))));
        assert_eq!(map.tracked, vec![1, 2, 3]);
    }

    #[test]
    fn test_return_value_on_next_line_not_tracked() {
        let src = "local function f()\n  return\n    g()\nend\n";
        let (_, map) = rewrite(src);
        assert_eq!(map.tracked, vec![2]);
    }

    #[test]
    fn test_repeat_until() {
        let src = "repeat\n  i = i + 1\nuntil i > 3\n";
        let (_, map) = rewrite(src);
        assert_eq!(map.tracked, vec![2]);
    }

    #[test]
    fn test_while_with_do_on_next_line() {
        let src = "while f(x)\ndo g() end\n";
        let (out, map) = rewrite(src);
        assert_eq!(out, format!("{}while f(x)\ndo g() end\n", call(1)));
        assert_eq!(map.tracked, vec![1]);
    }

    #[test]
    fn test_for_with_do_on_next_line() {
        let src = "for i = 1, n\ndo h(i) end\nfor k, v in pairs(t)\n  do\n  use(k, v)\nend\n";
        let (out, map) = rewrite(src);
        assert!(out.contains("\ndo h(i) end\n"));
        assert!(out.contains("\n  do\n"));
        assert_eq!(map.tracked, vec![1, 3, 5]);
    }

    #[test]
    fn test_plain_do_block_still_tracked() {
        let (_, map) = rewrite("do\n  local x = 1\nend\n");
        assert_eq!(map.tracked, vec![2]);
        let (out, map) = rewrite("do local y = 2 end\n");
        assert_eq!(out, format!("{}do local y = 2 end\n", call(1)));
        assert_eq!(map.tracked, vec![1]);
    }

    #[test]
    fn test_loop_header_without_do_is_error() {
        let err = instrumenter()
            .rewrite("bad.lua", "while x\n  y()\nend\n", "/i")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Syntax);
    }

    #[test]
    fn test_syntax_error_unbalanced_end() {
        let err = instrumenter().rewrite("bad.lua", "x = 1\nend\n", "/i").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Syntax);
        assert!(err.to_string().contains("bad.lua:2"));
    }

    #[test]
    fn test_syntax_error_unclosed_block() {
        let err = instrumenter()
            .rewrite("bad.lua", "function f()\n  x = 1\n", "/i")
            .unwrap_err();
        assert!(err.to_string().contains("never closed"));
    }

    #[test]
    fn test_syntax_error_mismatched_brackets() {
        assert!(instrumenter().rewrite("bad.lua", "f(1, {2)\n", "/i").is_err());
    }

    #[test]
    fn test_syntax_error_unfinished_string() {
        let err = instrumenter().rewrite("bad.lua", "x = \"abc\n", "/i").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Syntax);
    }

    #[test]
    fn test_path_literal_escaped() {
        assert_eq!(lua_string_literal(r#"C:\a "b""#), r#""C:\\a \"b\"""#);
    }

    #[test]
    fn test_instrument_writes_copy_and_registers() {
        let src_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let original = src_dir.path().join("mod.lua");
        std::fs::write(&original, "-- header\nlocal M = {}\nM.x = 1\nreturn M\n").unwrap();

        let fs: Rc<dyn FileSystem> = Rc::new(OsFileSystem);
        let mut paths = PathMapper::new(fs.clone());
        let engine = Instrumenter::new(fs, out_dir.path());
        let result = engine.instrument(&original, &mut paths).unwrap();

        assert!(result.instrumented_path.starts_with(paths.canonical(out_dir.path())));
        assert_ne!(result.instrumented_path.parent(), result.original_path.parent());
        let text = std::fs::read_to_string(&result.instrumented_path).unwrap();
        assert!(text.contains(TRACK_FUNCTION));
        assert_eq!(text.lines().count(), 4);
        assert_eq!(result.source_map.tracked, vec![3]);
        assert_eq!(
            paths.get_original_path(&result.instrumented_path),
            Some(result.original_path.as_path())
        );
    }

    #[test]
    fn test_instrument_missing_file() {
        let fs: Rc<dyn FileSystem> = Rc::new(OsFileSystem);
        let mut paths = PathMapper::new(fs.clone());
        let err = Instrumenter::new(fs, std::env::temp_dir())
            .instrument(Path::new("/definitely/not/here.lua"), &mut paths)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(paths.is_empty());
    }

    #[test]
    fn test_instrument_syntax_error_registers_nothing() {
        let src_dir = tempfile::tempdir().unwrap();
        let original = src_dir.path().join("broken.lua");
        std::fs::write(&original, "if x then\n").unwrap();
        let fs: Rc<dyn FileSystem> = Rc::new(OsFileSystem);
        let mut paths = PathMapper::new(fs.clone());
        let err = Instrumenter::new(fs, src_dir.path().join("out"))
            .instrument(&original, &mut paths)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Syntax);
        assert!(paths.is_empty());
    }
}
