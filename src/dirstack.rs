//! Process-wide working-directory stack
//!
//! Pushing a directory makes it the default working directory of every
//! command launched without an explicit `cwd`. The process's own working
//! directory is never changed. All access goes through one reentrant lock, so
//! a thread holding the stack inside [`DirStack::with_dir`] can still launch
//! commands that read it.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use log::debug;
use parking_lot::ReentrantMutex;

#[derive(Debug, Default)]
pub struct DirStack {
    dirs: ReentrantMutex<RefCell<Vec<PathBuf>>>,
}

impl DirStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push `dir`; it is popped when the guard drops, on every exit path
    pub fn push(&self, dir: impl AsRef<Path>) -> DirGuard<'_> {
        let dir = dir.as_ref().to_path_buf();
        let guard = self.dirs.lock();
        let mut dirs = guard.borrow_mut();
        debug!("pushd {}", dir.display());
        dirs.push(dir);
        DirGuard {
            stack: self,
            depth: dirs.len(),
        }
    }

    /// Run `f` with `dir` pushed while holding the stack lock
    ///
    /// Other threads cannot push or read until `f` returns.
    pub fn with_dir<T>(&self, dir: impl AsRef<Path>, f: impl FnOnce() -> T) -> T {
        let _lock = self.dirs.lock();
        let _guard = self.push(dir);
        f()
    }

    /// Top of the stack
    pub fn current(&self) -> Option<PathBuf> {
        self.dirs.lock().borrow().last().cloned()
    }

    pub fn depth(&self) -> usize {
        self.dirs.lock().borrow().len()
    }

    fn pop_to(&self, depth: usize) {
        let guard = self.dirs.lock();
        let mut dirs = guard.borrow_mut();
        if dirs.len() >= depth {
            dirs.truncate(depth.saturating_sub(1));
            debug!("popd, depth now {}", dirs.len());
        }
    }
}

/// Pops its directory (and anything pushed after it) on drop
#[derive(Debug)]
pub struct DirGuard<'a> {
    stack: &'a DirStack,
    depth: usize,
}

impl Drop for DirGuard<'_> {
    fn drop(&mut self) {
        self.stack.pop_to(self.depth);
    }
}

/// The stack shared by the whole process
pub fn global() -> &'static DirStack {
    static STACK: OnceLock<DirStack> = OnceLock::new();
    STACK.get_or_init(DirStack::new)
}

/// Push onto the process-wide stack
pub fn pushd(dir: impl AsRef<Path>) -> DirGuard<'static> {
    global().push(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_pop_on_drop() {
        let stack = DirStack::new();
        assert!(stack.current().is_none());
        {
            let _a = stack.push("/tmp");
            assert_eq!(stack.current(), Some(PathBuf::from("/tmp")));
            {
                let _b = stack.push("/usr");
                assert_eq!(stack.current(), Some(PathBuf::from("/usr")));
                assert_eq!(stack.depth(), 2);
            }
            assert_eq!(stack.current(), Some(PathBuf::from("/tmp")));
        }
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn pops_even_when_unwinding() {
        let stack = DirStack::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = stack.push("/tmp");
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn with_dir_is_reentrant() {
        let stack = DirStack::new();
        let seen = stack.with_dir("/var", || {
            let _inner = stack.push("/var/tmp");
            stack.current()
        });
        assert_eq!(seen, Some(PathBuf::from("/var/tmp")));
        assert!(stack.current().is_none());
    }

    #[test]
    fn outer_guard_drops_inner_entries() {
        let stack = DirStack::new();
        let outer = stack.push("/a");
        let inner = stack.push("/b");
        drop(outer);
        assert_eq!(stack.depth(), 0);
        drop(inner);
        assert_eq!(stack.depth(), 0);
    }
}
