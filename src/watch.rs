//! Polling change scanner for the client's sync directory
//!
//! No OS file-watcher dependency: the scanner keeps a snapshot of
//! (size, mtime) per relative path and diffs it against a fresh walk each
//! poll. Staging files are invisible to it, and the first scan primes the
//! snapshot without reporting anything - files that existed before startup
//! are the initial sync's business, not the scanner's.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::protocol::STAGING_SUFFIX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// New file, or an existing file whose size or mtime moved.
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// Relative slash-separated path, same form as the wire lists.
    pub path: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Fingerprint {
    size: u64,
    mtime: Option<SystemTime>,
}

/// Snapshot-diff scanner over one directory tree.
#[derive(Debug)]
pub struct Scanner {
    root: PathBuf,
    seen: HashMap<String, Fingerprint>,
}

impl Scanner {
    /// Walk once to prime the snapshot; nothing existing is reported.
    pub fn new(root: impl Into<PathBuf>) -> Scanner {
        let root = root.into();
        let seen = walk(&root);
        Scanner { root, seen }
    }

    /// Diff the tree against the last snapshot and return what changed.
    pub fn poll(&mut self) -> Vec<ChangeEvent> {
        let current = walk(&self.root);
        let mut events = Vec::new();

        for (path, print) in &current {
            match self.seen.get(path) {
                Some(old) if old == print => {}
                _ => events.push(ChangeEvent { kind: ChangeKind::Modified, path: path.clone() }),
            }
        }
        for path in self.seen.keys() {
            if !current.contains_key(path) {
                events.push(ChangeEvent { kind: ChangeKind::Removed, path: path.clone() });
            }
        }

        self.seen = current;
        if !events.is_empty() {
            debug!(count = events.len(), "local changes detected");
        }
        events
    }

    /// Forget `path` so the next poll treats its current on-disk state as
    /// already known. Called after an inbound transfer lands a file, to
    /// keep the scanner from echoing it straight back.
    pub fn absorb(&mut self, path: &str) {
        match fingerprint(&self.root.join(path)) {
            Some(print) => {
                self.seen.insert(path.to_string(), print);
            }
            None => {
                self.seen.remove(path);
            }
        }
    }
}

fn fingerprint(abs: &Path) -> Option<Fingerprint> {
    let meta = fs::metadata(abs).ok()?;
    if !meta.is_file() {
        return None;
    }
    Some(Fingerprint { size: meta.len(), mtime: meta.modified().ok() })
}

fn walk(root: &Path) -> HashMap<String, Fingerprint> {
    let mut out = HashMap::new();
    for entry in WalkDir::new(root).follow_links(false).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = match entry.path().strip_prefix(root) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let rel = match rel.to_str() {
            Some(s) => s.replace(std::path::MAIN_SEPARATOR, "/"),
            None => continue,
        };
        // In-flight transfers must not look like local edits.
        if rel.ends_with(STAGING_SUFFIX) {
            continue;
        }
        match fingerprint(entry.path()) {
            Some(print) => {
                out.insert(rel, print);
            }
            None => warn!(path = %entry.path().display(), "cannot stat during scan"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str, contents: &[u8]) {
        let p = root.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, contents).unwrap();
    }

    #[test]
    fn first_scan_reports_nothing() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "pre-existing.txt", b"old");
        let mut scanner = Scanner::new(tmp.path());
        assert!(scanner.poll().is_empty());
    }

    #[test]
    fn new_and_removed_files_are_reported() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "stays.txt", b"s");
        let mut scanner = Scanner::new(tmp.path());

        touch(tmp.path(), "sub/new.txt", b"n");
        fs::remove_file(tmp.path().join("stays.txt")).unwrap();

        let mut events = scanner.poll();
        events.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(
            events,
            vec![
                ChangeEvent { kind: ChangeKind::Removed, path: "stays.txt".into() },
                ChangeEvent { kind: ChangeKind::Modified, path: "sub/new.txt".into() },
            ]
        );
        // Steady state after the diff.
        assert!(scanner.poll().is_empty());
    }

    #[test]
    fn size_change_is_a_modification() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "grow.txt", b"1");
        let mut scanner = Scanner::new(tmp.path());
        touch(tmp.path(), "grow.txt", b"12345");
        let events = scanner.poll();
        assert_eq!(events, vec![ChangeEvent { kind: ChangeKind::Modified, path: "grow.txt".into() }]);
    }

    #[test]
    fn staging_files_are_invisible() {
        let tmp = TempDir::new().unwrap();
        let mut scanner = Scanner::new(tmp.path());
        touch(tmp.path(), "incoming.txt.swizdownload", b"partial");
        assert!(scanner.poll().is_empty());
    }

    #[test]
    fn absorb_suppresses_the_echo() {
        let tmp = TempDir::new().unwrap();
        let mut scanner = Scanner::new(tmp.path());
        // A transfer lands a file outside the scanner's view...
        touch(tmp.path(), "from-server.txt", b"payload");
        scanner.absorb("from-server.txt");
        // ...and the next poll does not re-report it.
        assert!(scanner.poll().is_empty());
    }
}
