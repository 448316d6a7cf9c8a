//! linecov: line coverage engine for Lua test runs
//!
//! Tracks, per line of every tracked source file, whether it ran and whether
//! a passing assertion verified it. Data comes either from the interpreter's
//! line hook ([`HookTracker`]) or from instrumented copies of the sources
//! ([`Instrumenter`] + [`RuntimeRecorder`]); both write into one
//! [`Session`], which persists to a stats file atomically and patches out
//! lines that cannot execute.
//!
//! ```no_run
//! use linecov::{CoverageConfig, Session};
//! use std::path::Path;
//!
//! # fn main() -> linecov::CoverageResult<()> {
//! let config = CoverageConfig::builder().include("src/").threshold(80).build()?;
//! let mut session = Session::new(config)?;
//! let copy = session.instrument(Path::new("src/init.lua"))?;
//! session.start()?;
//! // ... run tests against copy.instrumented_path ...
//! session.stop()?;
//! session.patchup_all();
//! session.save()?;
//! println!("{}% of lines ran", session.calculate_summary().line_percent());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
// Lints are configured in workspace Cargo.toml [workspace.lints.clippy]

pub mod config;
pub mod coverage;
pub mod logging;
mod result;

pub use config::{CoverageConfig, CoverageConfigBuilder};
pub use coverage::{
    calculate_summary, CoverageSummary, DataStore, FileRecord, FileSystem, HookTracker,
    InstrumentedFile, Instrumenter, Interpreter, LineEvent, LineRecord, LineState, OsFileSystem,
    PathMapper, Persistence, RuntimeRecorder, Session, SessionState, SharedSession,
};
pub use result::{CoverageError, CoverageResult, ErrorKind};
