//! Runtime entry point for instrumented code
//!
//! Instrumented files call [`TRACK_FUNCTION`](super::instrument::TRACK_FUNCTION)
//! with their own (instrumented) path and a line number. The embedder binds
//! that global to [`RuntimeRecorder::record_execution`]; the assertion library
//! calls [`RuntimeRecorder::record_coverage`] when an expectation passes.

use super::session::SharedSession;
use crate::result::{CoverageError, CoverageResult};
use std::path::Path;
use tracing::trace;

/// Check that a line number coming from the interpreter is usable
///
/// Lines are 1-based and bounded by `max_line`.
pub fn validate_line(line: i64, max_line: u32) -> CoverageResult<u32> {
    if line < 1 || line > i64::from(max_line) {
        return Err(CoverageError::validation(format!(
            "line number {line} is outside 1..={max_line}"
        )));
    }
    Ok(line as u32)
}

/// Handle given to instrumented code
///
/// Line numbers are checked against the limit captured at construction, so
/// bad input is reported even when the session is busy.
#[derive(Debug, Clone)]
pub struct RuntimeRecorder {
    session: SharedSession,
    max_line: u32,
}

impl RuntimeRecorder {
    /// Bind a recorder to a session
    #[must_use]
    pub fn new(session: SharedSession) -> Self {
        let max_line = session.borrow().config().max_line_number;
        Self { session, max_line }
    }

    /// Record one execution of `line` in an instrumented file
    pub fn record_execution(&self, instrumented_path: &str, line: i64) -> CoverageResult<()> {
        validate_line(line, self.max_line)?;
        self.with_session(|session| session.record_execution(Path::new(instrumented_path), line))
    }

    /// Record a passing assertion on `line` in an instrumented file
    pub fn record_coverage(&self, instrumented_path: &str, line: i64) -> CoverageResult<()> {
        validate_line(line, self.max_line)?;
        self.with_session(|session| session.record_coverage(Path::new(instrumented_path), line))
    }

    fn with_session(
        &self,
        f: impl FnOnce(&mut super::session::Session) -> CoverageResult<()>,
    ) -> CoverageResult<()> {
        match self.session.try_borrow_mut() {
            Ok(mut session) => f(&mut session),
            Err(_) => {
                trace!("session busy, dropping re-entrant record");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::CoverageConfig;
    use crate::coverage::line::LineState;
    use crate::coverage::session::Session;
    use crate::result::ErrorKind;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn running_session() -> (tempfile::TempDir, SharedSession) {
        let dir = tempfile::tempdir().unwrap();
        let config = CoverageConfig::builder()
            .stats_file(dir.path().join("stats.out"))
            .save_step_size(0)
            .build()
            .unwrap();
        let mut session = Session::new(config).unwrap();
        session.start().unwrap();
        session.register_path_pair(Path::new("/src/a.lua"), Path::new("/tmp/i/a.lua"));
        (dir, Rc::new(RefCell::new(session)))
    }

    #[test]
    fn test_validate_line_bounds() {
        assert_eq!(validate_line(1, 10).unwrap(), 1);
        assert_eq!(validate_line(10, 10).unwrap(), 10);
        assert_eq!(validate_line(0, 10).unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(validate_line(-4, 10).unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(validate_line(11, 10).unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_records_against_original() {
        let (_dir, session) = running_session();
        let recorder = RuntimeRecorder::new(session.clone());
        recorder.record_execution("/tmp/i/a.lua", 3).unwrap();
        recorder.record_coverage("/tmp/i/a.lua", 3).unwrap();

        let data = session.borrow().get_current_data().clone();
        let line = *data.file("/src/a.lua").unwrap().line(3).unwrap();
        assert_eq!(line.count, 2);
        assert_eq!(line.state, LineState::Covered);
    }

    #[test]
    fn test_unmapped_path_not_found() {
        let (_dir, session) = running_session();
        let err = RuntimeRecorder::new(session)
            .record_execution("/tmp/i/other.lua", 1)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_bad_line_rejected_before_lookup() {
        let (_dir, session) = running_session();
        let err = RuntimeRecorder::new(session)
            .record_execution("/tmp/i/other.lua", 0)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_reentrant_call_dropped() {
        let (_dir, session) = running_session();
        let recorder = RuntimeRecorder::new(session.clone());
        let guard = session.borrow_mut();
        assert!(recorder.record_execution("/tmp/i/a.lua", 1).is_ok());
        drop(guard);
        assert!(session.borrow().get_current_data().is_empty());
    }

    #[test]
    fn test_bad_line_rejected_while_session_busy() {
        let (_dir, session) = running_session();
        let recorder = RuntimeRecorder::new(session.clone());
        let guard = session.borrow_mut();
        let err = recorder.record_execution("/tmp/i/a.lua", 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = recorder.record_coverage("/tmp/i/a.lua", i64::MAX).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        drop(guard);
        assert!(session.borrow().get_current_data().is_empty());
    }
}
