//! Server side: accept loop, user/session registry, liveness overseer
//!
//! One listener thread accepts and handshakes connections; each accepted
//! session runs its own sender/receiver pair. All sessions of a username
//! share that user's home directory and per-path lock registry. The
//! registry map is guarded by an explicit lock - it is mutated from the
//! accept loop, from session teardown, and from overseers.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::command::{Checksum, Command, Scope};
use crate::config;
use crate::error::{ResourceError, SwizError, TransferError};
use crate::listing;
use crate::packet::Packet;
use crate::pathlock::PathLocks;
use crate::protocol::{timeouts, DEFAULT_SESSION_CEILING};
use crate::reconcile;
use crate::session::{Handler, Session, SessionState};
use crate::transfer::{self, InboundSet, TransferVerb};
use crate::transport;

pub struct ServerConfig {
    pub bind: String,
    /// Server storage root; each username gets `<root>/<username>`.
    pub root: PathBuf,
    pub session_ceiling: usize,
    pub liveness_timeout: Duration,
    pub overseer_interval: Duration,
}

impl ServerConfig {
    pub fn new(bind: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        ServerConfig {
            bind: bind.into(),
            root: root.into(),
            session_ceiling: DEFAULT_SESSION_CEILING,
            liveness_timeout: timeouts::LIVENESS_TIMEOUT,
            overseer_interval: timeouts::OVERSEER_INTERVAL,
        }
    }
}

// Server-side aggregate of one username: home directory, the lock
// registry every session of this user shares, and the live sessions.
struct User {
    home: PathBuf,
    locks: Arc<PathLocks>,
    sessions: Vec<Arc<Session>>,
    /// The per-user overseer is spawned once, on the first successful
    /// registration, and runs until daemon shutdown.
    overseer_running: bool,
}

/// Username -> sessions map plus the per-user overseer threads.
pub struct Registry {
    cfg: ServerConfig,
    users: Mutex<HashMap<String, User>>,
    next_id: AtomicU64,
    shutdown: AtomicBool,
}

impl Registry {
    fn new(cfg: ServerConfig) -> Arc<Self> {
        Arc::new(Registry {
            cfg,
            users: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        })
    }

    // Ceiling check ahead of registration, while the refused socket can
    // still carry a login|fail reply. Only the accept thread registers,
    // so check-then-register cannot race.
    fn check_capacity(&self, user: &str) -> Result<(), ResourceError> {
        let users = self.users.lock();
        let live = users.get(user).map(|u| u.sessions.len()).unwrap_or(0);
        if live >= self.cfg.session_ceiling {
            return Err(ResourceError::SessionCeiling {
                user: user.to_string(),
                max: self.cfg.session_ceiling,
            });
        }
        Ok(())
    }

    /// Create (or look up) the user and register a new session for the
    /// accepted socket. Returns the session plus the user's live session
    /// count.
    fn register(
        self: &Arc<Self>,
        user: &str,
        machine: &str,
        stream: TcpStream,
    ) -> Result<(Arc<Session>, u32, Arc<PathLocks>, PathBuf), SwizError> {
        let mut users = self.users.lock();
        let entry = match users.get_mut(user) {
            Some(entry) => entry,
            None => {
                let home = self.cfg.root.join(user);
                std::fs::create_dir_all(&home).map_err(|e| {
                    SwizError::Transfer(TransferError::Unwritable {
                        path: home.display().to_string(),
                        source: e,
                    })
                })?;
                // Interrupted transfers from a previous run are debris.
                let _ = listing::purge_staging(&home);
                users.entry(user.to_string()).or_insert(User {
                    home,
                    locks: Arc::new(PathLocks::new()),
                    sessions: Vec::new(),
                    overseer_running: false,
                })
            }
        };
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Session::new(stream, id, user, machine)
            .map_err(|e| SwizError::Transport(e.into()))?;
        entry.sessions.push(Arc::clone(&session));
        let count = entry.sessions.len() as u32;
        let locks = Arc::clone(&entry.locks);
        let home = entry.home.clone();
        let spawn_overseer = !entry.overseer_running;
        entry.overseer_running = true;
        drop(users);

        if spawn_overseer {
            let registry = Arc::clone(self);
            let username = user.to_string();
            thread::spawn(move || registry.overseer(username));
        }
        Ok((session, count, locks, home))
    }

    /// Drop one session from its user's list. The user itself is kept;
    /// its overseer keeps running for future logins.
    pub fn deregister(&self, user: &str, id: u64) {
        let mut users = self.users.lock();
        if let Some(entry) = users.get_mut(user) {
            entry.sessions.retain(|s| s.id != id);
            debug!(user, session = id, live = entry.sessions.len(), "session deregistered");
        }
    }

    /// Live sessions of `user` excluding `except`.
    pub fn siblings(&self, user: &str, except: u64) -> Vec<Arc<Session>> {
        self.users
            .lock()
            .get(user)
            .map(|u| u.sessions.iter().filter(|s| s.id != except).cloned().collect())
            .unwrap_or_default()
    }

    /// Queue a copy of `pkt` on every other session of the same user.
    pub fn broadcast(&self, user: &str, except: u64, pkt: &Packet) {
        for sibling in self.siblings(user, except) {
            sibling.enqueue(pkt.clone());
        }
    }

    pub fn session_count(&self, user: &str) -> usize {
        self.users.lock().get(user).map(|u| u.sessions.len()).unwrap_or(0)
    }

    fn snapshot(&self, user: &str) -> Vec<Arc<Session>> {
        self.users.lock().get(user).map(|u| u.sessions.clone()).unwrap_or_default()
    }

    // Per-user liveness thread: ping every session each tick, evict any
    // whose last pong is older than the configured threshold.
    fn overseer(self: Arc<Self>, user: String) {
        debug!(user = %user, "overseer started");
        while !self.shutdown.load(Ordering::SeqCst) {
            thread::sleep(self.cfg.overseer_interval);
            for session in self.snapshot(&user) {
                if session.state() == SessionState::Closed || session.is_stopping() {
                    self.deregister(&user, session.id);
                    continue;
                }
                if session.pong_age() > self.cfg.liveness_timeout {
                    warn!(user = %user, session = session.id, "session unresponsive, evicting");
                    session.close();
                    self.deregister(&user, session.id);
                } else {
                    session.mark_ping();
                    session.enqueue(Packet::simple(Command::Ping.wire()));
                }
            }
        }
        debug!(user = %user, "overseer stopped");
    }
}

// Command dispatch for one server-side session.
struct ServerHandler {
    registry: Arc<Registry>,
    home: PathBuf,
    locks: Arc<PathLocks>,
    inbound: InboundSet,
    /// Reassembly of the client's fragmented `clist` payloads.
    lists: listing::ListAssembly,
}

impl ServerHandler {
    fn push_file(&self, session: &Arc<Session>, rel: &str) {
        let res = transfer::send_file(&self.home, rel, TransferVerb::Sdownload, &self.locks, |p| {
            session.enqueue(p)
        });
        if let Err(e) = res {
            warn!(session = session.id, path = rel, error = %e, "cannot send file");
            session.enqueue(transfer::fail_packet(TransferVerb::Sdownload, rel));
        }
    }

    // Replay a file that just landed here to the user's other machines.
    fn broadcast_file(&self, session: &Arc<Session>, rel: &str) {
        for sibling in self.registry.siblings(&session.user, session.id) {
            let res =
                transfer::send_file(&self.home, rel, TransferVerb::Sdownload, &self.locks, |p| {
                    sibling.enqueue(p)
                });
            if let Err(e) = res {
                warn!(session = sibling.id, path = rel, error = %e, "broadcast send failed");
            }
        }
    }

    fn reconcile_against(&self, session: &Arc<Session>, theirs: &BTreeSet<String>) {
        let mine = match listing::list_relative(&self.home) {
            Ok(m) => m,
            Err(e) => {
                warn!(session = session.id, error = %e, "cannot list home directory");
                return;
            }
        };
        let plan = reconcile::reconcile(&mine, theirs);
        info!(
            session = session.id,
            user = %session.user,
            push = plan.push.len(),
            pull = plan.pull.len(),
            "reconciliation plan"
        );
        for rel in &plan.push {
            self.push_file(session, rel);
        }
        for rel in &plan.pull {
            session.enqueue(Packet::simple(Command::Download { path: rel.clone() }.wire()));
        }
    }

    fn delete(&self, session: &Arc<Session>, rel: &str) -> Result<(), SwizError> {
        let abs = transfer::resolve_under(&self.home, rel)?;
        let _exclusive = self.locks.write(rel);
        match std::fs::remove_file(&abs) {
            Ok(()) => {
                info!(session = session.id, path = rel, "deleted");
                self.registry.broadcast(
                    &session.user,
                    session.id,
                    &Packet::simple(Command::Delete { path: rel.to_string() }.wire()),
                );
                Ok(())
            }
            Err(e) => {
                warn!(session = session.id, path = rel, error = %e, "delete failed");
                session
                    .enqueue(Packet::simple(Command::DeleteFail { path: rel.to_string() }.wire()));
                Ok(())
            }
        }
    }
}

impl Handler for ServerHandler {
    fn handle(
        &mut self,
        session: &Arc<Session>,
        command: Command,
        packet: Packet,
    ) -> Result<(), SwizError> {
        match command {
            Command::Clist => {
                if let Some(theirs) = self.lists.feed(&packet) {
                    self.reconcile_against(session, &theirs);
                }
            }
            Command::GetSyncDir => {
                let mine = listing::list_relative(&self.home).unwrap_or_default();
                for pkt in listing::list_packets(&Command::Clist.wire(), &mine) {
                    session.enqueue(pkt);
                }
            }
            Command::Slist | Command::Flist { scope: Scope::Server } => {
                let text = listing::formatted(&self.home).unwrap_or_default();
                session.enqueue(Packet::with_payload(
                    Command::Flist { scope: Scope::Server }.wire(),
                    text.into_bytes(),
                ));
            }
            Command::Download { path } => self.push_file(session, &path),
            Command::Adownload { path } => {
                let res = transfer::send_file(
                    &self.home,
                    &path,
                    TransferVerb::Aupload,
                    &self.locks,
                    |p| session.enqueue(p),
                );
                if let Err(e) = res {
                    warn!(session = session.id, path = %path, error = %e, "adownload failed");
                    session.enqueue(transfer::fail_packet(TransferVerb::Aupload, &path));
                }
            }
            Command::Upload { path, checksum } => {
                match self.inbound.handle_chunk(&path, &checksum, &packet, &self.locks) {
                    Ok(Some(_dest)) => self.broadcast_file(session, &path),
                    Ok(None) => {}
                    Err(e) => {
                        if !matches!(e, TransferError::PeerFailed { .. }) {
                            session.enqueue(transfer::fail_packet(TransferVerb::Upload, &path));
                        }
                        return Err(e.into());
                    }
                }
            }
            Command::Sdownload { path, checksum: Checksum::Fail }
            | Command::Aupload { path, checksum: Checksum::Fail } => {
                warn!(session = session.id, path = %path, "client reported failed download");
            }
            Command::Delete { path } => self.delete(session, &path)?,
            Command::DeleteFail { path } => {
                warn!(session = session.id, path = %path, "peer could not delete");
            }
            other => {
                // Client-local or client-bound commands have no meaning here.
                warn!(session = session.id, command = %other, "unexpected command for server");
            }
        }
        Ok(())
    }

    fn on_close(&mut self, session: &Arc<Session>) {
        self.registry.deregister(&session.user, session.id);
        info!(session = session.id, user = %session.user, "session closed");
    }
}

/// The daemon: a bound listener plus the shared registry.
pub struct Server {
    registry: Arc<Registry>,
    listener: TcpListener,
}

impl Server {
    pub fn bind(cfg: ServerConfig) -> anyhow::Result<Server> {
        std::fs::create_dir_all(&cfg.root)?;
        let listener = TcpListener::bind(&cfg.bind)?;
        // Poll-style accept so shutdown requests are noticed promptly.
        listener.set_nonblocking(true)?;
        info!(bind = %cfg.bind, root = %cfg.root.display(), "daemon listening");
        Ok(Server { registry: Registry::new(cfg), listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Accept connections until `stop` is set.
    pub fn run_until(&self, stop: &AtomicBool) {
        while !stop.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "connection accepted");
                    if let Err(e) = self.handshake(stream) {
                        warn!(peer = %addr, error = %e, "handshake failed");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(timeouts::ACCEPT_POLL);
                }
                Err(e) => warn!(error = %e, "accept error"),
            }
        }
        self.registry.shutdown.store(true, Ordering::SeqCst);
    }

    // Read exactly one login packet and either promote the socket into a
    // registered session or refuse and close it.
    fn handshake(&self, stream: TcpStream) -> Result<(), SwizError> {
        let mut stream = stream;
        stream.set_nonblocking(false).map_err(|e| SwizError::Transport(e.into()))?;
        transport::tune_socket(&stream).map_err(|e| SwizError::Transport(e.into()))?;

        let pkt = transport::recv_packet_deadline(&mut stream, timeouts::HANDSHAKE)?;
        let (user, machine) = match Command::parse(&pkt.command) {
            Ok(Command::Login { user, machine }) => (user, machine),
            _ => {
                refuse(stream, "expected login handshake");
                return Err(SwizError::Protocol(crate::error::ProtocolError::BadHandshake {
                    reason: format!("first packet was {:?}", pkt.command),
                }));
            }
        };
        if let Err(e) = config::validate_username(&user) {
            refuse(stream, "invalid username");
            return Err(e.into());
        }
        if let Err(e) = self.registry.check_capacity(&user) {
            refuse(stream, "session limit reached");
            return Err(e.into());
        }

        match self.registry.register(&user, &machine, stream) {
            Ok((session, count, locks, home)) => {
                session.set_state(SessionState::LoggedIn);
                let reply = Packet::simple(Command::LoginOk { sessions: count }.wire());
                if let Err(e) = session.send_now(&reply) {
                    self.registry.deregister(&user, session.id);
                    session.close();
                    return Err(e);
                }
                info!(user = %user, machine = %machine, session = session.id, count, "login ok");
                let handler = ServerHandler {
                    registry: Arc::clone(&self.registry),
                    home: home.clone(),
                    locks,
                    inbound: InboundSet::new(home),
                    lists: listing::ListAssembly::new(),
                };
                session.start(handler);
                Ok(())
            }
            // Filesystem trouble creating the home directory; the socket
            // drops without a reply.
            Err(e) => Err(e),
        }
    }
}

// Reply `login|fail|<reason>` and close the socket.
fn refuse(mut stream: TcpStream, reason: &str) {
    let pkt = Packet::simple(Command::LoginFail { reason: reason.to_string() }.wire());
    let _ = transport::send_packet(&mut stream, &pkt);
    // Dropped here: the refused socket closes immediately.
}
