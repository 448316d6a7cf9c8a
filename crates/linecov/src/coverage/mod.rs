//! Line coverage for Lua test runs
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │  interpreter line hook ──► HookTracker ──┐                    │
//! │                                          ├──► Session ──► DataStore
//! │  instrumented code ──► RuntimeRecorder ──┘       │            │
//! │                            ▲                     ├──► Persistence (stats file)
//! │  Instrumenter ──► PathMapper                     └──► patch-up │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Two tracking strategies feed one data model. The hook tracker samples
//! every executed line through the interpreter's debug hook; the
//! instrumenter rewrites sources so they report themselves. Both end up as
//! [`LineRecord`]s keyed by the original file's path.

mod filter;
mod fs;
mod hook;
mod instrument;
mod line;
mod patchup;
mod path_map;
mod persistence;
mod recorder;
mod session;
mod store;
mod summary;

pub use filter::FilterRules;
pub use fs::{normalize_path, FileSystem, OsFileSystem};
pub use hook::{HookTracker, Interpreter, LineEvent, LineHook, SpawnListener, ThreadId};
pub use instrument::{
    tokenize, InstrumentedFile, Instrumenter, LexError, SourceMap, Token, TokenKind,
    TRACK_FUNCTION,
};
pub use line::{FileRecord, LineRecord, LineState};
pub use patchup::{
    classify, classify_with, is_structural, ExecutableMap, HeuristicClassifier, LineClassifier,
    PatchupInput, StaticMapClassifier,
};
pub use path_map::PathMapper;
pub use persistence::{decode, encode, Persistence, STATS_HEADER};
pub use recorder::{validate_line, RuntimeRecorder};
pub use session::{Session, SessionState, SharedSession};
pub use store::DataStore;
pub use summary::{calculate_summary, CoverageSummary, LineTotals};
