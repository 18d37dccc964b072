//! Chunked file transfer with whole-file integrity verification
//!
//! A file travels as `ceil(size / CHUNK_SIZE)` sequenced packets (minimum
//! one, so empty files still transfer). The whole-file MD5 is computed
//! once before the first chunk goes out and repeated in every chunk's
//! command string. The receiver accumulates chunks in a
//! `.swizdownload` staging file and promotes it over the real path on the
//! final chunk, under the exclusive per-path lock.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use crate::command::{Checksum, Command};
use crate::error::TransferError;
use crate::packet::Packet;
use crate::pathlock::PathLocks;
use crate::protocol::{CHUNK_SIZE, STAGING_SUFFIX};

/// Which transfer command a pushed file rides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferVerb {
    /// Client-to-server, into the user's server-side tree.
    Upload,
    /// Server-to-client, into the client's sync tree.
    Sdownload,
    /// Server-to-client, delivered outside the sync tree.
    Aupload,
}

impl TransferVerb {
    fn command(self, path: &str, checksum: Checksum) -> Command {
        let path = path.to_string();
        match self {
            TransferVerb::Upload => Command::Upload { path, checksum },
            TransferVerb::Sdownload => Command::Sdownload { path, checksum },
            TransferVerb::Aupload => Command::Aupload { path, checksum },
        }
    }
}

/// Resolve a peer-supplied relative path under `root`, rejecting anything
/// that could escape the managed tree.
pub fn resolve_under(root: &Path, rel: &str) -> Result<PathBuf, TransferError> {
    let escape = || TransferError::PathEscape { path: rel.to_string() };
    if rel.is_empty() || rel.contains('\0') {
        return Err(escape());
    }
    let mut safe = PathBuf::new();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(s) => safe.push(s),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(escape());
            }
        }
    }
    if safe.as_os_str().is_empty() {
        return Err(escape());
    }
    Ok(root.join(safe))
}

/// Streaming whole-file MD5, lowercase hex.
pub fn file_md5(path: &Path) -> Result<String, TransferError> {
    let unreadable = |e| TransferError::Unreadable { path: path.display().to_string(), source: e };
    let mut f = File::open(path).map_err(unreadable)?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf).map_err(unreadable)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

/// Chunks needed for a file of `size` bytes; zero-length files still send
/// one (empty) chunk.
pub fn chunk_count(size: u64) -> u32 {
    let n = size.div_ceil(CHUNK_SIZE as u64);
    n.max(1) as u32
}

/// Read `root/rel`, fragment it, and hand each chunk packet to `enqueue`
/// in sequence order. The shared per-path lock is held for the whole read
/// so a concurrent writer cannot change the file under the checksum.
pub fn send_file<F>(
    root: &Path,
    rel: &str,
    verb: TransferVerb,
    locks: &PathLocks,
    mut enqueue: F,
) -> Result<(), TransferError>
where
    F: FnMut(Packet),
{
    let abs = resolve_under(root, rel)?;
    let _shared = locks.read(rel);

    let sum = file_md5(&abs)?;
    let size = fs::metadata(&abs)
        .map_err(|e| TransferError::Unreadable { path: rel.to_string(), source: e })?
        .len();
    let expected = chunk_count(size);
    let command = verb.command(rel, Checksum::Md5(sum.clone())).wire();

    let mut f = File::open(&abs)
        .map_err(|e| TransferError::Unreadable { path: rel.to_string(), source: e })?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    for seq in 0..expected {
        let mut filled = 0;
        // The final chunk carries the true remainder, not the nominal size.
        while filled < buf.len() {
            let n = f
                .read(&mut buf[filled..])
                .map_err(|e| TransferError::Unreadable { path: rel.to_string(), source: e })?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        enqueue(Packet::new(command.clone(), seq as i32, expected, buf[..filled].to_vec()));
    }
    debug!(path = rel, chunks = expected, md5 = %sum, "queued outbound transfer");
    Ok(())
}

/// The `|fail` reply for a transfer request that could not be satisfied.
pub fn fail_packet(verb: TransferVerb, rel: &str) -> Packet {
    Packet::simple(verb.command(rel, Checksum::Fail).wire())
}

// One in-progress inbound transfer: the staging file plus what the final
// chunk must match.
struct Inbound {
    file: File,
    staging: PathBuf,
    expected: u32,
    next_seq: i32,
    advertised: String,
}

/// Reassembles inbound chunk streams for one destination tree. Owned by a
/// session's receiver loop; chunks for one transfer arrive strictly in
/// order on the single reliable stream.
pub struct InboundSet {
    root: PathBuf,
    /// When set, incoming paths are flattened to their basename (used for
    /// deliveries outside the sync tree).
    flatten: bool,
    active: HashMap<String, Inbound>,
    landed: Option<Box<dyn FnMut(&str, &Path) + Send>>,
}

impl InboundSet {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        InboundSet { root: root.into(), flatten: false, active: HashMap::new(), landed: None }
    }

    /// A set that drops incoming files into `root` by basename only.
    pub fn flat(root: impl Into<PathBuf>) -> Self {
        InboundSet { root: root.into(), flatten: true, active: HashMap::new(), landed: None }
    }

    /// Run `hook` for every completed file, while the exclusive per-path
    /// lock is still held. The change scanner absorbs inbound files here,
    /// so no poll can land between the promotion and the absorb and
    /// mistake the file for a local edit.
    pub fn on_landed(mut self, hook: impl FnMut(&str, &Path) + Send + 'static) -> Self {
        self.landed = Some(Box::new(hook));
        self
    }

    /// Number of transfers currently in flight.
    pub fn in_flight(&self) -> usize {
        self.active.len()
    }

    /// Feed one chunk. Returns the completed destination path when this
    /// chunk finished its transfer.
    pub fn handle_chunk(
        &mut self,
        rel: &str,
        checksum: &Checksum,
        pkt: &Packet,
        locks: &PathLocks,
    ) -> Result<Option<PathBuf>, TransferError> {
        let advertised = match checksum {
            Checksum::Md5(sum) => sum,
            Checksum::Fail => {
                // Terminal failure notification, not chunk 0 of a transfer.
                warn!(path = rel, "peer reported transfer failure");
                self.active.remove(rel);
                return Err(TransferError::PeerFailed { path: rel.to_string() });
            }
        };

        let rel_key = if self.flatten {
            Path::new(rel)
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| TransferError::PathEscape { path: rel.to_string() })?
                .to_string()
        } else {
            rel.to_string()
        };

        if pkt.sequence == 0 {
            self.begin(&rel_key, advertised, pkt.expected)?;
        }
        let state = self
            .active
            .get_mut(&rel_key)
            .ok_or_else(|| TransferError::NoTransfer { path: rel_key.clone() })?;

        if pkt.sequence != state.next_seq || pkt.expected != state.expected {
            let err = TransferError::OutOfOrder {
                path: rel_key.clone(),
                got: pkt.sequence,
                want: state.next_seq,
            };
            // The stream is broken for this transfer; drop the partial.
            let staging = state.staging.clone();
            self.active.remove(&rel_key);
            let _ = fs::remove_file(staging);
            return Err(err);
        }

        state
            .file
            .write_all(&pkt.payload)
            .map_err(|e| TransferError::Unwritable { path: rel_key.clone(), source: e })?;
        state.next_seq += 1;

        if pkt.is_final() {
            if let Some(state) = self.active.remove(&rel_key) {
                let dest = self.finalize(&rel_key, state, locks)?;
                return Ok(Some(dest));
            }
        }
        Ok(None)
    }

    fn begin(&mut self, rel: &str, advertised: &str, expected: u32) -> Result<(), TransferError> {
        let dest = resolve_under(&self.root, rel)?;
        let staging = staging_path(&dest);
        if let Some(parent) = staging.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| TransferError::Unwritable { path: rel.to_string(), source: e })?;
        }
        let file = File::create(&staging)
            .map_err(|e| TransferError::Unwritable { path: rel.to_string(), source: e })?;
        debug!(path = rel, expected, "inbound transfer started");
        self.active.insert(
            rel.to_string(),
            Inbound { file, staging, expected, next_seq: 0, advertised: advertised.to_string() },
        );
        Ok(())
    }

    // Verify and promote a completed staging file. Runs under the
    // exclusive per-path lock.
    fn finalize(
        &mut self,
        rel: &str,
        state: Inbound,
        locks: &PathLocks,
    ) -> Result<PathBuf, TransferError> {
        let Inbound { file, staging, advertised, .. } = state;
        drop(file);

        let _exclusive = locks.write(rel);
        let dest = resolve_under(&self.root, rel)?;

        let actual = file_md5(&staging)?;
        if actual != advertised {
            // Kept lenient: the file is promoted anyway. A stricter
            // reject-and-retry policy would go here.
            warn!(path = rel, expected = %advertised, got = %actual, "checksum mismatch on completed transfer");
        }

        // Identical content already in place: skip the redundant rewrite.
        if dest.is_file() {
            if let Ok(existing) = file_md5(&dest) {
                if existing == advertised {
                    let _ = fs::remove_file(&staging);
                    debug!(path = rel, "destination already up to date, staging discarded");
                    if let Some(hook) = self.landed.as_mut() {
                        hook(rel, &dest);
                    }
                    return Ok(dest);
                }
            }
        }

        fs::rename(&staging, &dest)
            .map_err(|e| TransferError::Unwritable { path: rel.to_string(), source: e })?;
        info!(path = rel, "transfer complete");
        if let Some(hook) = self.landed.as_mut() {
            hook(rel, &dest);
        }
        Ok(dest)
    }
}

fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(STAGING_SUFFIX);
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn deliver(
        src_root: &Path,
        rel: &str,
        dst: &mut InboundSet,
        locks: &PathLocks,
        corrupt: Option<usize>,
    ) -> Vec<Packet> {
        let mut packets = Vec::new();
        send_file(src_root, rel, TransferVerb::Upload, locks, |p| packets.push(p)).unwrap();
        if let Some(idx) = corrupt {
            packets[idx].payload[0] ^= 0xff;
        }
        for pkt in &packets {
            let cmd = Command::parse(&pkt.command).unwrap();
            let (path, sum) = match cmd {
                Command::Upload { path, checksum } => (path, checksum),
                other => panic!("unexpected command {:?}", other),
            };
            let _ = dst.handle_chunk(&path, &sum, pkt, locks);
        }
        packets
    }

    #[test]
    fn chunk_count_is_ceil_with_min_one() {
        assert_eq!(chunk_count(0), 1);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK_SIZE as u64), 1);
        assert_eq!(chunk_count(CHUNK_SIZE as u64 + 1), 2);
        assert_eq!(chunk_count(3 * CHUNK_SIZE as u64), 3);
    }

    #[test]
    fn reassembly_reproduces_the_original_bytes() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let locks = PathLocks::new();
        // Deliberately not a multiple of the chunk size.
        let body: Vec<u8> = (0..CHUNK_SIZE * 2 + 777).map(|i| (i % 251) as u8).collect();
        fs::create_dir_all(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/data.bin"), &body).unwrap();

        let mut inbound = InboundSet::new(dst.path());
        let packets = deliver(src.path(), "sub/data.bin", &mut inbound, &locks, None);

        assert_eq!(packets.len(), 3);
        assert_eq!(packets.last().unwrap().payload.len(), 777);
        assert_eq!(fs::read(dst.path().join("sub/data.bin")).unwrap(), body);
        assert_eq!(inbound.in_flight(), 0);
        assert!(!dst.path().join("sub/data.bin.swizdownload").exists());
    }

    #[test]
    fn empty_file_transfers_as_one_empty_chunk() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let locks = PathLocks::new();
        fs::write(src.path().join("empty"), b"").unwrap();

        let mut inbound = InboundSet::new(dst.path());
        let packets = deliver(src.path(), "empty", &mut inbound, &locks, None);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].payload.is_empty());
        assert!(packets[0].is_final());
        assert_eq!(fs::read(dst.path().join("empty")).unwrap(), b"");
    }

    #[test]
    fn mismatch_is_logged_not_fatal() {
        // Corrupting a payload byte makes the reassembled checksum differ
        // from the advertised one. Current policy keeps the file anyway;
        // this test pins that lenient behavior.
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let locks = PathLocks::new();
        let body: Vec<u8> = (0..CHUNK_SIZE + 10).map(|i| (i % 256) as u8).collect();
        fs::write(src.path().join("f.bin"), &body).unwrap();

        let mut inbound = InboundSet::new(dst.path());
        deliver(src.path(), "f.bin", &mut inbound, &locks, Some(0));

        let written = fs::read(dst.path().join("f.bin")).unwrap();
        assert_ne!(written, body, "corruption must be visible");
        let advertised = file_md5(&src.path().join("f.bin")).unwrap();
        let actual = file_md5(&dst.path().join("f.bin")).unwrap();
        assert_ne!(advertised, actual, "mismatch must be detectable");
    }

    #[test]
    fn identical_destination_is_not_rewritten() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let locks = PathLocks::new();
        fs::write(src.path().join("same.txt"), b"identical").unwrap();
        fs::write(dst.path().join("same.txt"), b"identical").unwrap();
        let before = fs::metadata(dst.path().join("same.txt")).unwrap().modified().unwrap();

        let mut inbound = InboundSet::new(dst.path());
        deliver(src.path(), "same.txt", &mut inbound, &locks, None);

        let after = fs::metadata(dst.path().join("same.txt")).unwrap().modified().unwrap();
        assert_eq!(before, after, "identical content must not be rewritten");
    }

    #[test]
    fn landed_hook_sees_the_promoted_file() {
        use parking_lot::Mutex;
        use std::sync::Arc;

        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let locks = PathLocks::new();
        fs::write(src.path().join("new.txt"), b"fresh").unwrap();

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut inbound = InboundSet::new(dst.path()).on_landed({
            let seen = Arc::clone(&seen);
            move |rel, dest| {
                // Promotion has already happened when the hook runs.
                assert!(dest.is_file(), "destination must exist in the hook");
                seen.lock().push(rel.to_string());
            }
        });
        deliver(src.path(), "new.txt", &mut inbound, &locks, None);
        assert_eq!(*seen.lock(), vec!["new.txt".to_string()]);
    }

    #[test]
    fn landed_hook_absorbs_before_the_scanner_can_poll() {
        use crate::watch::Scanner;
        use parking_lot::Mutex;
        use std::sync::Arc;

        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let locks = PathLocks::new();
        fs::write(src.path().join("pushed.txt"), b"from the peer").unwrap();

        let scanner = Arc::new(Mutex::new(Scanner::new(dst.path())));
        let mut inbound = InboundSet::new(dst.path()).on_landed({
            let scanner = Arc::clone(&scanner);
            move |rel, _dest| scanner.lock().absorb(rel)
        });
        deliver(src.path(), "pushed.txt", &mut inbound, &locks, None);

        // The inbound file is already known; nothing echoes back as a
        // local change.
        assert!(scanner.lock().poll().is_empty());
        assert!(dst.path().join("pushed.txt").is_file());
    }

    #[test]
    fn fail_token_touches_nothing() {
        let dst = TempDir::new().unwrap();
        let locks = PathLocks::new();
        let mut inbound = InboundSet::new(dst.path());
        let pkt = fail_packet(TransferVerb::Upload, "missing.txt");
        let err = inbound
            .handle_chunk("missing.txt", &Checksum::Fail, &pkt, &locks)
            .unwrap_err();
        assert!(matches!(err, TransferError::PeerFailed { .. }));
        assert!(fs::read_dir(dst.path()).unwrap().next().is_none(), "filesystem untouched");
    }

    #[test]
    fn out_of_order_chunk_drops_the_transfer() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let locks = PathLocks::new();
        let body = vec![7u8; CHUNK_SIZE * 2];
        fs::write(src.path().join("x.bin"), &body).unwrap();

        let mut packets = Vec::new();
        send_file(src.path(), "x.bin", TransferVerb::Upload, &locks, |p| packets.push(p)).unwrap();

        let mut inbound = InboundSet::new(dst.path());
        let sum = Checksum::Md5(file_md5(&src.path().join("x.bin")).unwrap());
        inbound.handle_chunk("x.bin", &sum, &packets[0], &locks).unwrap();
        // Skip ahead: deliver a chunk numbered past the one expected next.
        let mut skipped = packets[1].clone();
        skipped.sequence = 2;
        skipped.expected = 3;
        let err = inbound.handle_chunk("x.bin", &sum, &skipped, &locks).unwrap_err();
        assert!(matches!(err, TransferError::OutOfOrder { .. }));
        assert_eq!(inbound.in_flight(), 0);
        assert!(!dst.path().join("x.bin").exists());
    }

    #[test]
    fn chunk_without_transfer_is_rejected() {
        let dst = TempDir::new().unwrap();
        let locks = PathLocks::new();
        let mut inbound = InboundSet::new(dst.path());
        let pkt = Packet::new("upload|x|00", 1, 3, vec![1, 2, 3]);
        let err = inbound
            .handle_chunk("x", &Checksum::Md5("00".into()), &pkt, &locks)
            .unwrap_err();
        assert!(matches!(err, TransferError::NoTransfer { .. }));
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let root = Path::new("/srv/data");
        assert!(resolve_under(root, "../etc/passwd").is_err());
        assert!(resolve_under(root, "/etc/passwd").is_err());
        assert!(resolve_under(root, "a/../../b").is_err());
        assert!(resolve_under(root, "").is_err());
        assert!(resolve_under(root, "ok/./file.txt").is_ok());
    }

    #[test]
    fn flat_set_uses_basename_only() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let locks = PathLocks::new();
        fs::create_dir_all(src.path().join("deep/tree")).unwrap();
        fs::write(src.path().join("deep/tree/doc.txt"), b"doc").unwrap();

        let mut packets = Vec::new();
        send_file(src.path(), "deep/tree/doc.txt", TransferVerb::Aupload, &locks, |p| {
            packets.push(p)
        })
        .unwrap();
        let mut inbound = InboundSet::flat(dst.path());
        for pkt in &packets {
            if let Command::Aupload { path, checksum } = Command::parse(&pkt.command).unwrap() {
                inbound.handle_chunk(&path, &checksum, pkt, &locks).unwrap();
            }
        }
        assert!(dst.path().join("doc.txt").exists());
    }
}
