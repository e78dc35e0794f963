use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::types::types::SessionError;

/// Registry of installation roots that currently have a running operation.
#[derive(Debug, Clone, Default)]
pub struct TargetLocks {
    held: Arc<Mutex<HashSet<PathBuf>>>,
}

/// Held by a running operation; releases its root on drop.
#[derive(Debug)]
pub struct TargetGuard {
    locks: TargetLocks,
    root: PathBuf,
    released: bool,
}

impl TargetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `root`, failing fast if another operation holds it.
    pub fn try_acquire(&self, root: &Path) -> Result<TargetGuard, SessionError> {
        let key = normalize(root);
        let mut held = self.lock();
        if !held.insert(key.clone()) {
            return Err(SessionError::TargetBusy(root.to_path_buf()));
        }
        Ok(TargetGuard {
            locks: self.clone(),
            root: key,
            released: false,
        })
    }

    pub fn is_held(&self, root: &Path) -> bool {
        self.lock().contains(&normalize(root))
    }

    pub fn held_count(&self) -> usize {
        self.lock().len()
    }
}

impl TargetGuard {
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl TargetGuard {
    /// Runs `publish` and frees the root inside one critical section: anyone
    /// asking `is_held` sees either both effects or neither.
    pub(crate) fn release_after(mut self, publish: impl FnOnce()) {
        let mut held = self.locks.lock();
        publish();
        held.remove(&self.root);
        self.released = true;
    }
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        if !self.released {
            self.locks.lock().remove(&self.root);
        }
    }
}

/// `a/b/../c` and `a/c` must collide, so existing paths are canonicalized.
fn normalize(root: &Path) -> PathBuf {
    std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_of_same_root_is_rejected() {
        let locks = TargetLocks::new();
        let dir = tempfile::tempdir().unwrap();

        let guard = locks.try_acquire(dir.path()).unwrap();
        assert!(matches!(
            locks.try_acquire(dir.path()),
            Err(SessionError::TargetBusy(_))
        ));
        assert!(locks.is_held(dir.path()));

        drop(guard);
        assert!(!locks.is_held(dir.path()));
        assert!(locks.try_acquire(dir.path()).is_ok());
    }

    #[test]
    fn equivalent_spellings_of_a_root_collide() {
        let locks = TargetLocks::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("game")).unwrap();

        let _guard = locks.try_acquire(&dir.path().join("game")).unwrap();
        let detour = dir.path().join("game").join("..").join("game");
        assert!(locks.try_acquire(&detour).is_err());
    }

    #[test]
    fn release_after_publishes_before_freeing_root() {
        let locks = TargetLocks::new();
        let dir = tempfile::tempdir().unwrap();
        let guard = locks.try_acquire(dir.path()).unwrap();

        let mut published = false;
        guard.release_after(|| published = true);
        assert!(published);
        assert!(!locks.is_held(dir.path()));

        // The consumed guard must not free a root someone else took since.
        let next = locks.try_acquire(dir.path()).unwrap();
        assert!(locks.is_held(dir.path()));
        drop(next);
        assert_eq!(locks.held_count(), 0);
    }

    #[test]
    fn distinct_roots_are_independent() {
        let locks = TargetLocks::new();
        let _a = locks.try_acquire(Path::new("/nonexistent/game-a")).unwrap();
        let _b = locks.try_acquire(Path::new("/nonexistent/game-b")).unwrap();
        assert_eq!(locks.held_count(), 2);
    }
}
