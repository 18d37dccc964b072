//! Per-path readers/writer lock registry
//!
//! Every filesystem mutation under a managed tree must hold the exclusive
//! lock for its logical path; reads hold the shared lock. Entries are
//! created on first reference and kept for the registry's lifetime - a
//! registry lives as long as the session (or user) that owns the tree, so
//! a lock can never be silently recreated while a transfer for that path
//! is still in flight.

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Exclusive guard; released on drop, on every exit path.
pub type PathWriteGuard = ArcRwLockWriteGuard<RawRwLock, ()>;
/// Shared guard.
pub type PathReadGuard = ArcRwLockReadGuard<RawRwLock, ()>;

#[derive(Debug, Default)]
pub struct PathLocks {
    inner: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, path: &str) -> Arc<RwLock<()>> {
        let mut map = self.inner.lock();
        map.entry(path.to_string()).or_insert_with(|| Arc::new(RwLock::new(()))).clone()
    }

    /// Acquire the exclusive lock for `path`, blocking until free.
    pub fn write(&self, path: &str) -> PathWriteGuard {
        self.entry(path).write_arc()
    }

    /// Acquire the shared lock for `path`, blocking while a writer holds it.
    pub fn read(&self, path: &str) -> PathReadGuard {
        self.entry(path).read_arc()
    }

    /// Number of paths ever referenced through this registry.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn exclusive_writers_never_overlap() {
        let locks = Arc::new(PathLocks::new());
        let busy = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let locks = locks.clone();
            let busy = busy.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let _g = locks.write("dir/file.txt");
                    assert!(!busy.swap(true, Ordering::SeqCst), "two writers inside");
                    thread::sleep(Duration::from_micros(50));
                    busy.store(false, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn reader_blocks_until_writer_releases() {
        let locks = Arc::new(PathLocks::new());
        let w = locks.write("a.txt");
        let locks2 = locks.clone();
        let reader = thread::spawn(move || {
            let _r = locks2.read("a.txt");
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!reader.is_finished(), "reader got in past an exclusive writer");
        drop(w);
        reader.join().unwrap();
    }

    #[test]
    fn distinct_paths_do_not_contend() {
        let locks = PathLocks::new();
        let _a = locks.write("a.txt");
        let _b = locks.write("b.txt");
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn entries_survive_release() {
        let locks = PathLocks::new();
        drop(locks.write("kept.txt"));
        assert_eq!(locks.len(), 1);
        // Reacquiring uses the same entry.
        drop(locks.read("kept.txt"));
        assert_eq!(locks.len(), 1);
    }
}
