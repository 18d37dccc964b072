//! Sync-directory enumeration and the wire form of file lists

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::packet::Packet;
use crate::protocol::{CHUNK_SIZE, STAGING_SUFFIX};

/// Recursively list regular files under `root` as relative slash-separated
/// paths. Staging files are included; reconciliation partitions them out.
pub fn list_relative(root: &Path) -> Result<BTreeSet<String>> {
    let mut out = BTreeSet::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            // An unlistable root means no listing at all; trouble deeper
            // down only loses that subtree.
            Err(e) if e.path() == Some(root) => {
                return Err(e).with_context(|| format!("cannot list {}", root.display()));
            }
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = match entry.path().strip_prefix(root) {
            Ok(r) => r,
            Err(_) => continue,
        };
        if let Some(s) = rel.to_str() {
            // Wire paths are always slash-separated.
            out.insert(s.replace(std::path::MAIN_SEPARATOR, "/"));
        } else {
            warn!(path = %rel.display(), "skipping non-UTF-8 path");
        }
    }
    Ok(out)
}

/// Remove leftover staging files under `root` (crash debris from an
/// interrupted transfer). Returns how many were removed.
pub fn purge_staging(root: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in WalkDir::new(root).follow_links(false).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let is_staging = entry
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(STAGING_SUFFIX))
            .unwrap_or(false);
        if is_staging {
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!(path = %entry.path().display(), "removed staging debris");
                    count += 1;
                }
                Err(e) => warn!(path = %entry.path().display(), error = %e, "cannot remove staging file"),
            }
        }
    }
    if count > 0 {
        info!(count, root = %root.display(), "purged staging debris");
    }
    Ok(count)
}

/// Pipe-joined wire form of a path list (the `clist` payload).
pub fn wire_list(paths: &BTreeSet<String>) -> String {
    paths.iter().cloned().collect::<Vec<_>>().join("|")
}

/// Parse a pipe-joined path list back into a set. Empty input is an empty
/// set, not a set containing the empty string.
pub fn parse_wire_list(raw: &str) -> BTreeSet<String> {
    raw.split('|').filter(|s| !s.is_empty()).map(|s| s.to_string()).collect()
}

/// Fragment a wire list into sequenced `command` packets, the same way file
/// transfers travel. A tree of any size fits: each fragment stays far under
/// the payload cap and the receiver concatenates before parsing.
pub fn list_packets(command: &str, paths: &BTreeSet<String>) -> Vec<Packet> {
    let bytes = wire_list(paths).into_bytes();
    if bytes.is_empty() {
        return vec![Packet::simple(command)];
    }
    let expected = bytes.len().div_ceil(CHUNK_SIZE) as u32;
    bytes
        .chunks(CHUNK_SIZE)
        .enumerate()
        .map(|(seq, fragment)| Packet::new(command, seq as i32, expected, fragment.to_vec()))
        .collect()
}

/// Reassembles a fragmented wire list inside a receiver loop. Fragments of
/// one list arrive in order on the single reliable stream; a sequence gap
/// discards the partial list and waits for the next sequence 0.
#[derive(Default)]
pub struct ListAssembly {
    buf: Vec<u8>,
    next_seq: i32,
}

impl ListAssembly {
    pub fn new() -> ListAssembly {
        ListAssembly::default()
    }

    /// Feed one fragment; returns the parsed list once the final fragment
    /// lands.
    pub fn feed(&mut self, pkt: &Packet) -> Option<BTreeSet<String>> {
        if pkt.sequence == 0 {
            self.buf.clear();
        } else if pkt.sequence != self.next_seq {
            warn!(got = pkt.sequence, want = self.next_seq, "list fragment out of order, dropped");
            self.buf.clear();
            self.next_seq = 0;
            return None;
        }
        self.buf.extend_from_slice(&pkt.payload);
        self.next_seq = pkt.sequence + 1;
        if !pkt.is_final() {
            return None;
        }
        self.next_seq = 0;
        let parsed = match std::str::from_utf8(&self.buf) {
            Ok(text) => Some(parse_wire_list(text)),
            Err(_) => {
                warn!("list payload is not UTF-8, dropped");
                None
            }
        };
        self.buf.clear();
        parsed
    }
}

/// Human-readable listing for `flist` replies: one `path<TAB>size` line per
/// file, staging files skipped.
pub fn formatted(root: &Path) -> Result<String> {
    let mut lines = Vec::new();
    for rel in list_relative(root)? {
        if rel.ends_with(STAGING_SUFFIX) {
            continue;
        }
        let size = fs::metadata(root.join(&rel)).map(|m| m.len()).unwrap_or(0);
        lines.push(format!("{}\t{}", rel, size));
    }
    Ok(lines.join("\n"))
}
