//! Client side: login, sync-tree mirroring, user commands
//!
//! The client owns one session to the daemon plus a polling change scanner
//! over its sync directory. Local edits become uploads and deletes; server
//! pushes land through the session's receiver loop. The scanner and the
//! receiver share the scanner snapshot so an inbound file is absorbed
//! before the next poll, instead of echoing straight back as an upload.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::command::{Checksum, Command, Scope};
use crate::config;
use crate::error::{SwizError, TransferError};
use crate::listing;
use crate::packet::Packet;
use crate::pathlock::PathLocks;
use crate::protocol::timeouts;
use crate::reconcile;
use crate::session::{Handler, Session, SessionState};
use crate::transfer::{self, InboundSet, TransferVerb};
use crate::transport;
use crate::watch::{ChangeEvent, ChangeKind, Scanner};

pub struct ClientConfig {
    /// Daemon address, `host:port` with an IPv4 host or `localhost`.
    pub server: String,
    pub user: String,
    /// The mirrored tree.
    pub sync_dir: PathBuf,
    /// Where `adownload` deliveries land, by basename.
    pub download_dir: PathBuf,
    pub scan_interval: Duration,
}

impl ClientConfig {
    pub fn new(server: impl Into<String>, user: impl Into<String>, sync_dir: impl Into<PathBuf>) -> Self {
        ClientConfig {
            server: server.into(),
            user: user.into(),
            sync_dir: sync_dir.into(),
            // Out-of-tree deliveries land in the working directory unless
            // redirected.
            download_dir: PathBuf::from("."),
            scan_interval: timeouts::SCAN_INTERVAL,
        }
    }
}

// Receiver-side dispatch for the client session.
struct ClientHandler {
    sync_dir: PathBuf,
    locks: Arc<PathLocks>,
    /// Chunk reassembly into the sync tree.
    inbound: InboundSet,
    /// Chunk reassembly for out-of-tree deliveries, flattened to basename.
    aside: InboundSet,
    /// Reassembly of the server's fragmented `clist` payloads.
    lists: listing::ListAssembly,
    scanner: Arc<Mutex<Scanner>>,
    stop: Arc<AtomicBool>,
}

impl ClientHandler {
    fn reconcile_against(&self, session: &Arc<Session>, theirs: &BTreeSet<String>) {
        let mine = match listing::list_relative(&self.sync_dir) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "cannot list sync directory");
                return;
            }
        };
        let plan = reconcile::reconcile(&mine, theirs);
        info!(push = plan.push.len(), pull = plan.pull.len(), "reconciliation plan");
        for rel in &plan.push {
            self.push_file(session, rel);
        }
        for rel in &plan.pull {
            session.enqueue(Packet::simple(Command::Download { path: rel.clone() }.wire()));
        }
    }

    fn push_file(&self, session: &Arc<Session>, rel: &str) {
        let res = transfer::send_file(&self.sync_dir, rel, TransferVerb::Upload, &self.locks, |p| {
            session.enqueue(p)
        });
        if let Err(e) = res {
            warn!(path = rel, error = %e, "cannot send file");
            session.enqueue(transfer::fail_packet(TransferVerb::Upload, rel));
        }
    }

    fn delete(&self, session: &Arc<Session>, rel: &str) {
        let abs = match transfer::resolve_under(&self.sync_dir, rel) {
            Ok(p) => p,
            Err(e) => {
                warn!(path = rel, error = %e, "refusing delete");
                return;
            }
        };
        let _exclusive = self.locks.write(rel);
        match std::fs::remove_file(&abs) {
            Ok(()) => {
                info!(path = rel, "deleted on server's behalf");
                self.scanner.lock().absorb(rel);
            }
            Err(e) => {
                warn!(path = rel, error = %e, "delete failed");
                session
                    .enqueue(Packet::simple(Command::DeleteFail { path: rel.to_string() }.wire()));
            }
        }
    }
}

impl Handler for ClientHandler {
    fn handle(
        &mut self,
        session: &Arc<Session>,
        command: Command,
        packet: Packet,
    ) -> Result<(), SwizError> {
        match command {
            // A pull request we sent could not be satisfied server-side.
            Command::Upload { path, checksum: Checksum::Fail } => {
                warn!(path = %path, "server could not accept the upload");
            }
            Command::Sdownload { path, checksum } => {
                match self.inbound.handle_chunk(&path, &checksum, &packet, &self.locks) {
                    Ok(Some(dest)) => {
                        // The scanner already absorbed the file, under the
                        // same lock that promoted it.
                        info!(path = %path, dest = %dest.display(), "file received");
                    }
                    Ok(None) => {}
                    Err(e) => {
                        if !matches!(e, TransferError::PeerFailed { .. }) {
                            session
                                .enqueue(transfer::fail_packet(TransferVerb::Sdownload, &path));
                        }
                        return Err(e.into());
                    }
                }
            }
            Command::Aupload { path, checksum } => {
                match self.aside.handle_chunk(&path, &checksum, &packet, &self.locks) {
                    Ok(Some(dest)) => info!(path = %path, dest = %dest.display(), "file delivered"),
                    Ok(None) => {}
                    Err(e) => {
                        if !matches!(e, TransferError::PeerFailed { .. }) {
                            session.enqueue(transfer::fail_packet(TransferVerb::Aupload, &path));
                        }
                        return Err(e.into());
                    }
                }
            }
            Command::Download { path } => self.push_file(session, &path),
            Command::Clist => {
                if let Some(theirs) = self.lists.feed(&packet) {
                    self.reconcile_against(session, &theirs);
                }
            }
            Command::Delete { path } => self.delete(session, &path),
            Command::DeleteFail { path } => {
                warn!(path = %path, "server could not delete");
            }
            Command::Flist { scope: Scope::Server } => {
                let text = String::from_utf8_lossy(&packet.payload);
                println!("--- server files ---");
                if text.is_empty() {
                    println!("(empty)");
                } else {
                    println!("{}", text);
                }
            }
            other => {
                warn!(command = %other, "unexpected command for client");
            }
        }
        Ok(())
    }

    fn on_close(&mut self, _session: &Arc<Session>) {
        self.stop.store(true, Ordering::SeqCst);
        info!("disconnected from server");
    }
}

/// A logged-in client: the session plus the background change scanner.
#[derive(Debug)]
pub struct Client {
    session: Arc<Session>,
    sync_dir: PathBuf,
    locks: Arc<PathLocks>,
    scanner: Arc<Mutex<Scanner>>,
    stop: Arc<AtomicBool>,
    scan_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Connect, log in, start the session loops and the change scanner,
    /// and kick off the initial synchronization.
    pub fn connect(cfg: ClientConfig) -> Result<Arc<Client>> {
        config::validate_username(&cfg.user)?;
        config::validate_sync_dir(&cfg.sync_dir)?;
        let addr = config::parse_address(&cfg.server)?;
        // Debris from a previous crashed run must not survive into this one.
        let _ = listing::purge_staging(&cfg.sync_dir);

        let machine = config::machine_name();
        let mut stream = TcpStream::connect(addr)
            .with_context(|| format!("cannot connect to {}", cfg.server))?;
        transport::tune_socket(&stream).context("cannot tune socket")?;

        let login =
            Packet::simple(Command::Login { user: cfg.user.clone(), machine: machine.clone() }.wire());
        transport::send_packet(&mut stream, &login).context("login send failed")?;
        let reply = transport::recv_packet_deadline(&mut stream, timeouts::HANDSHAKE)
            .context("no login reply")?;
        match Command::parse(&reply.command) {
            Ok(Command::LoginOk { sessions }) => {
                info!(user = %cfg.user, machine = %machine, sessions, "logged in");
            }
            Ok(Command::LoginFail { reason }) => bail!("login refused: {}", reason),
            _ => bail!("unexpected login reply: {:?}", reply.command),
        }

        let session = Session::new(stream, 0, &cfg.user, &machine)?;
        session.set_state(SessionState::LoggedIn);

        let locks = Arc::new(PathLocks::new());
        let scanner = Arc::new(Mutex::new(Scanner::new(&cfg.sync_dir)));
        let stop = Arc::new(AtomicBool::new(false));
        // Inbound files are absorbed while the promoting lock is still
        // held, so no scan can slip in between and echo them back.
        let inbound = InboundSet::new(&cfg.sync_dir).on_landed({
            let scanner = Arc::clone(&scanner);
            move |rel, _dest| scanner.lock().absorb(rel)
        });
        let handler = ClientHandler {
            sync_dir: cfg.sync_dir.clone(),
            locks: Arc::clone(&locks),
            inbound,
            aside: InboundSet::flat(&cfg.download_dir),
            lists: listing::ListAssembly::new(),
            scanner: Arc::clone(&scanner),
            stop: Arc::clone(&stop),
        };
        session.start(handler);

        let client = Arc::new(Client {
            session,
            sync_dir: cfg.sync_dir,
            locks,
            scanner,
            stop,
            scan_thread: Mutex::new(None),
        });

        // Hand the server our tree so it can drive the initial plan. On
        // failure the session loops must not be left running.
        if let Err(e) = client.sync() {
            client.session.close();
            return Err(e);
        }

        let scan = {
            let client = Arc::clone(&client);
            let interval = cfg.scan_interval;
            thread::spawn(move || client.scan_loop(interval))
        };
        *client.scan_thread.lock() = Some(scan);
        Ok(client)
    }

    pub fn is_connected(&self) -> bool {
        self.session.state() == SessionState::Running
    }

    /// Send the local path list; the server replies with pushes and pull
    /// requests for whatever differs. Large trees travel as several
    /// sequenced fragments.
    pub fn sync(&self) -> Result<()> {
        let mine = listing::list_relative(&self.sync_dir)?;
        for pkt in listing::list_packets(&Command::Clist.wire(), &mine) {
            self.session.enqueue(pkt);
        }
        Ok(())
    }

    /// Ask the server to run the plan from its own listing instead.
    pub fn get_sync_dir(&self) {
        self.session.enqueue(Packet::simple(Command::GetSyncDir.wire()));
    }

    /// Push one file from the sync tree to the server.
    pub fn upload(&self, rel: &str) -> Result<()> {
        transfer::send_file(&self.sync_dir, rel, TransferVerb::Upload, &self.locks, |p| {
            self.session.enqueue(p)
        })?;
        Ok(())
    }

    /// Ask the server to push `rel` into the sync tree.
    pub fn download(&self, rel: &str) {
        self.session.enqueue(Packet::simple(Command::Download { path: rel.to_string() }.wire()));
    }

    /// Ask the server for a copy of `rel` outside the sync tree.
    pub fn adownload(&self, rel: &str) {
        self.session.enqueue(Packet::simple(Command::Adownload { path: rel.to_string() }.wire()));
    }

    /// Delete locally and on the server; the server fans the delete out to
    /// this user's other machines.
    pub fn delete(&self, rel: &str) -> Result<()> {
        let abs = transfer::resolve_under(&self.sync_dir, rel)?;
        {
            let _exclusive = self.locks.write(rel);
            match std::fs::remove_file(&abs) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("cannot delete {}", rel)),
            }
        }
        // The scanner already knows; a second delete would just bounce.
        self.scanner.lock().absorb(rel);
        self.session.enqueue(Packet::simple(Command::Delete { path: rel.to_string() }.wire()));
        Ok(())
    }

    /// Request the server's listing; the reply is printed when it arrives.
    pub fn list_server(&self) {
        self.session.enqueue(Packet::simple(Command::Slist.wire()));
    }

    /// Local listing, formatted like the server's.
    pub fn list_client(&self) -> Result<String> {
        listing::formatted(&self.sync_dir)
    }

    /// Send a liveness probe; the round trip shows up in [`Client::rtt`]
    /// once the pong comes back.
    pub fn probe(&self) {
        self.session.mark_ping();
        self.session.enqueue(Packet::simple(Command::Ping.wire()));
    }

    /// Last measured probe round-trip, if one completed.
    pub fn rtt(&self) -> Option<Duration> {
        self.session.rtt()
    }

    /// Graceful shutdown: tell the server, stop the scanner, join
    /// everything.
    pub fn exit(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.session.shutdown_exit();
        self.session.close();
        if let Some(t) = self.scan_thread.lock().take() {
            let _ = t.join();
        }
    }

    fn scan_loop(&self, interval: Duration) {
        debug!(dir = %self.sync_dir.display(), "change scanner started");
        while !self.stop.load(Ordering::SeqCst) {
            thread::sleep(interval);
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            let events = self.scanner.lock().poll();
            for event in events {
                self.apply_event(event);
            }
        }
        debug!("change scanner stopped");
    }

    fn apply_event(&self, event: ChangeEvent) {
        match event.kind {
            ChangeKind::Modified => {
                debug!(path = %event.path, "local change, uploading");
                if let Err(e) = self.upload(&event.path) {
                    warn!(path = %event.path, error = %e, "upload failed");
                }
            }
            ChangeKind::Removed => {
                debug!(path = %event.path, "local delete, propagating");
                self.session
                    .enqueue(Packet::simple(Command::Delete { path: event.path }.wire()));
            }
        }
    }
}

/// Help text for the interactive prompt.
pub const HELP: &str = "\
commands:
  sync                  push the local listing and reconcile
  get_sync_dir          reconcile from the server's listing
  upload <path>         push one file to the server
  download <path>       pull one file into the sync directory
  adownload <path>      fetch a server file outside the sync directory
  delete <path>         delete locally, on the server, and on other machines
  list server           show the server's files
  list client           show the local files
  ping                  measure the server round-trip
  help                  this text
  exit                  log out and quit";
