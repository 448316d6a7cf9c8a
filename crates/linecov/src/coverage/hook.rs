//! Interpreter line-hook tracker
//!
//! The embedding interpreter is reached through the [`Interpreter`] trait.
//! [`HookTracker::start`] installs one shared [`LineHook`] on every live
//! thread and registers a spawn listener so coroutines created later get the
//! same hook. The hook holds only a weak reference to the session, so an
//! interpreter that outlives the session just sees a no-op callback.

use super::session::{Session, SharedSession};
use crate::result::CoverageResult;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::{debug, info, trace};

/// Interpreter thread (main thread or coroutine) identifier
pub type ThreadId = u64;

/// One executed line, as reported by the interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEvent<'a> {
    /// Thread that executed the line
    pub thread: ThreadId,
    /// Chunk name of the running function (`@path`, `=name`, or source text)
    pub source: &'a str,
    /// Current line; the interpreter reports values below 1 for native code
    pub line: i64,
}

/// Callback the interpreter invokes for each executed line
pub type LineHook = Rc<dyn Fn(&LineEvent<'_>) -> CoverageResult<()>>;

/// Called on coroutine creation; returns the hook to install on it
pub type SpawnListener = Rc<dyn Fn(ThreadId) -> Option<LineHook>>;

/// What the tracker needs from the embedding interpreter
pub trait Interpreter {
    /// The main thread
    fn main_thread(&self) -> ThreadId;

    /// Install or remove the line hook of one thread
    fn set_line_hook(&mut self, thread: ThreadId, hook: Option<LineHook>);

    /// Install or remove the coroutine-creation listener
    fn set_spawn_listener(&mut self, listener: Option<SpawnListener>);

    /// Threads alive right now
    fn live_threads(&self) -> Vec<ThreadId> {
        vec![self.main_thread()]
    }
}

/// Hook-based tracker bound to one session
pub struct HookTracker {
    session: SharedSession,
    hook: LineHook,
    hooked: Rc<RefCell<BTreeSet<ThreadId>>>,
    installed: bool,
}

impl fmt::Debug for HookTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookTracker")
            .field("hooked", &self.hooked.borrow())
            .field("installed", &self.installed)
            .finish_non_exhaustive()
    }
}

impl HookTracker {
    /// Create a tracker writing into `session`
    #[must_use]
    pub fn new(session: SharedSession) -> Self {
        let hook = line_hook(Rc::downgrade(&session));
        Self {
            session,
            hook,
            hooked: Rc::new(RefCell::new(BTreeSet::new())),
            installed: false,
        }
    }

    /// The hook installed on threads
    #[must_use]
    pub fn hook(&self) -> LineHook {
        self.hook.clone()
    }

    /// Whether hooks are currently installed
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Threads carrying the hook
    #[must_use]
    pub fn hooked_threads(&self) -> Vec<ThreadId> {
        self.hooked.borrow().iter().copied().collect()
    }

    /// Start the session and install the hook everywhere
    pub fn start(&mut self, interpreter: &mut dyn Interpreter) -> CoverageResult<()> {
        self.session.borrow_mut().start()?;
        if !self.installed {
            for thread in interpreter.live_threads() {
                self.attach(interpreter, thread);
            }
            let hook = self.hook.clone();
            let hooked = Rc::clone(&self.hooked);
            interpreter.set_spawn_listener(Some(Rc::new(move |thread| {
                hooked.borrow_mut().insert(thread);
                Some(hook.clone())
            })));
            self.installed = true;
        }
        info!(threads = self.hooked.borrow().len(), "line hook installed");
        Ok(())
    }

    /// Explicit thread-spawned event for interpreters that report spawns
    /// instead of calling the listener
    pub fn thread_spawned(&mut self, interpreter: &mut dyn Interpreter, thread: ThreadId) {
        if self.installed {
            self.attach(interpreter, thread);
        }
    }

    /// Stop recording; hooks stay installed
    pub fn stop(&self) -> CoverageResult<()> {
        self.session.borrow_mut().stop()
    }

    /// Suspend recording
    pub fn pause(&self) -> CoverageResult<()> {
        self.session.borrow_mut().pause()
    }

    /// Resume recording
    pub fn resume(&self) -> CoverageResult<()> {
        self.session.borrow_mut().resume()
    }

    /// Remove every hook, then save and reset the session
    pub fn shutdown(&mut self, interpreter: &mut dyn Interpreter) -> CoverageResult<()> {
        if self.installed {
            interpreter.set_spawn_listener(None);
            let threads: Vec<ThreadId> = std::mem::take(&mut *self.hooked.borrow_mut())
                .into_iter()
                .collect();
            for thread in &threads {
                interpreter.set_line_hook(*thread, None);
            }
            self.installed = false;
            debug!(threads = threads.len(), "line hook removed");
        }
        self.session.borrow_mut().shutdown()
    }

    fn attach(&self, interpreter: &mut dyn Interpreter, thread: ThreadId) {
        if self.hooked.borrow_mut().insert(thread) {
            interpreter.set_line_hook(thread, Some(self.hook.clone()));
            trace!(thread, "hook attached");
        }
    }
}

fn line_hook(session: Weak<RefCell<Session>>) -> LineHook {
    Rc::new(move |event: &LineEvent<'_>| {
        let Some(shared) = session.upgrade() else {
            return Ok(());
        };
        // events fired while the session is busy (e.g. mid-save) are dropped
        let Ok(mut guard) = shared.try_borrow_mut() else {
            return Ok(());
        };
        guard.handle_line_event(event)
    })
}
