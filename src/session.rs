//! Session: the live state of one connected peer
//!
//! Each session runs two threads over one duplex socket: a sender loop
//! that drains a FIFO queue, and a receiver loop that decodes packets and
//! dispatches them to a role-specific [`Handler`]. A handler failure is
//! logged and the loop moves on; only a transport-level failure (or a
//! stream desync the codec cannot recover from) tears the session down.
//!
//! Teardown order is fixed: set the stop flag, wake the sender, shut the
//! socket down so a blocked read returns, then join both loops before the
//! socket is released.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::error::SwizError;
use crate::packet::Packet;
use crate::transport;

/// Lifecycle of a session. `Connecting` covers the handshake; both loops
/// run only in `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    LoggedIn,
    Running,
    Closing,
    Closed,
}

/// Role-specific command dispatch. Ping/pong/exit are handled by the
/// receiver loop itself; everything else lands here.
pub trait Handler: Send + 'static {
    fn handle(
        &mut self,
        session: &Arc<Session>,
        command: Command,
        packet: Packet,
    ) -> Result<(), SwizError>;

    /// Called once, after the receiver loop has finished.
    fn on_close(&mut self, _session: &Arc<Session>) {}
}

struct Liveness {
    last_pong: Instant,
    ping_sent: Option<Instant>,
    rtt: Option<Duration>,
}

pub struct Session {
    pub id: u64,
    pub user: String,
    pub machine: String,
    /// Write side; shared by the sender loop and out-of-band force-sends.
    writer: Mutex<TcpStream>,
    /// Read side; taken by the receiver thread when it starts.
    reader: Mutex<Option<TcpStream>>,
    /// Extra handle used only to shut the socket down during teardown,
    /// so close never has to wait for a loop that holds `writer`.
    raw: TcpStream,
    queue: Mutex<VecDeque<Packet>>,
    ready: Condvar,
    stop: AtomicBool,
    state: Mutex<SessionState>,
    liveness: Mutex<Liveness>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    pub fn new(
        stream: TcpStream,
        id: u64,
        user: impl Into<String>,
        machine: impl Into<String>,
    ) -> io::Result<Arc<Session>> {
        transport::tune_socket(&stream)?;
        let reader = stream.try_clone()?;
        let raw = stream.try_clone()?;
        Ok(Arc::new(Session {
            id,
            user: user.into(),
            machine: machine.into(),
            writer: Mutex::new(stream),
            reader: Mutex::new(Some(reader)),
            raw,
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            stop: AtomicBool::new(false),
            state: Mutex::new(SessionState::Connecting),
            liveness: Mutex::new(Liveness {
                last_pong: Instant::now(),
                ping_sent: None,
                rtt: None,
            }),
            threads: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn the sender and receiver loops. Call exactly once, after the
    /// login handshake succeeded.
    pub fn start<H: Handler>(self: &Arc<Self>, handler: H) {
        self.set_state(SessionState::Running);
        self.liveness.lock().last_pong = Instant::now();

        let sender = {
            let s = Arc::clone(self);
            thread::spawn(move || s.sender_loop())
        };
        let receiver = {
            let s = Arc::clone(self);
            thread::spawn(move || s.receiver_loop(handler))
        };
        let mut threads = self.threads.lock();
        threads.push(sender);
        threads.push(receiver);
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Append a packet to the outbound FIFO. Silently dropped once the
    /// session is stopping.
    pub fn enqueue(&self, pkt: Packet) {
        if self.is_stopping() {
            debug!(session = self.id, command = %pkt.command, "dropping packet for closing session");
            return;
        }
        self.queue.lock().push_back(pkt);
        self.ready.notify_one();
    }

    /// Write a packet directly, bypassing the queue. Used for handshake
    /// replies and the force-sent `exit`.
    pub fn send_now(&self, pkt: &Packet) -> Result<(), SwizError> {
        let mut stream = self.writer.lock();
        transport::send_packet(&mut stream, pkt)
    }

    /// Record that a liveness probe was just queued for this session.
    pub fn mark_ping(&self) {
        self.liveness.lock().ping_sent = Some(Instant::now());
    }

    fn stamp_pong(&self) {
        let mut l = self.liveness.lock();
        l.last_pong = Instant::now();
        l.rtt = l.ping_sent.take().map(|t| t.elapsed());
        if let Some(rtt) = l.rtt {
            debug!(session = self.id, rtt_ms = rtt.as_millis() as u64, "pong");
        }
    }

    /// Time since the last successful pong (or since the session started).
    pub fn pong_age(&self) -> Duration {
        self.liveness.lock().last_pong.elapsed()
    }

    /// Last measured ping round-trip time, if any probe completed.
    pub fn rtt(&self) -> Option<Duration> {
        self.liveness.lock().rtt
    }

    /// Graceful user-initiated exit: discard everything queued and force
    /// the exit packet out ahead of teardown.
    pub fn shutdown_exit(&self) {
        self.queue.lock().clear();
        let _ = self.send_now(&Packet::simple(Command::Exit.wire()));
        self.request_close();
    }

    /// Signal both loops to stop and unblock them. Does not join.
    pub fn request_close(&self) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            self.set_state(SessionState::Closing);
            self.ready.notify_all();
            let _ = self.raw.shutdown(Shutdown::Both);
        }
    }

    /// Full teardown: stop, wake, join both loops (skipping the calling
    /// thread's own handle), release the socket. Idempotent.
    pub fn close(&self) {
        self.request_close();
        let handles: Vec<JoinHandle<()>> = {
            let mut threads = self.threads.lock();
            threads.drain(..).collect()
        };
        let me = thread::current().id();
        for h in handles {
            if h.thread().id() != me {
                let _ = h.join();
            }
        }
        self.set_state(SessionState::Closed);
    }

    fn sender_loop(self: Arc<Self>) {
        loop {
            let pkt = {
                let mut q = self.queue.lock();
                loop {
                    if self.is_stopping() {
                        break None;
                    }
                    if let Some(p) = q.pop_front() {
                        break Some(p);
                    }
                    self.ready.wait_for(&mut q, Duration::from_millis(200));
                }
            };
            let Some(pkt) = pkt else { break };
            if let Err(e) = self.send_now(&pkt) {
                // A local encode failure costs only this packet; the
                // stream itself is still good.
                if !e.is_fatal_to_session() {
                    warn!(session = self.id, command = %pkt.command, error = %e, "dropping unsendable packet");
                    continue;
                }
                if !self.is_stopping() {
                    warn!(session = self.id, error = %e, "send failed, closing session");
                }
                self.request_close();
                break;
            }
        }
        debug!(session = self.id, "sender loop finished");
    }

    fn receiver_loop<H: Handler>(self: Arc<Self>, mut handler: H) {
        let mut stream = match self.reader.lock().take() {
            Some(s) => s,
            None => return,
        };
        loop {
            if self.is_stopping() {
                break;
            }
            let pkt = match transport::recv_packet(&mut stream) {
                Ok(None) => continue,
                Ok(Some(pkt)) => pkt,
                Err(e) => {
                    // Transport failures and header desyncs both make the
                    // stream unusable.
                    if !self.is_stopping() {
                        warn!(session = self.id, error = %e, "receive failed, closing session");
                    }
                    break;
                }
            };
            let cmd = match Command::parse(&pkt.command) {
                Ok(c) => c,
                Err(e) => {
                    warn!(session = self.id, error = %e, "ignoring malformed command");
                    continue;
                }
            };
            match cmd {
                Command::Ping => self.enqueue(Packet::simple(Command::Pong.wire())),
                Command::Pong => self.stamp_pong(),
                Command::Exit => {
                    info!(session = self.id, user = %self.user, "peer closed the session");
                    break;
                }
                other => {
                    if let Err(e) = handler.handle(&self, other, pkt) {
                        if e.is_fatal_to_session() {
                            warn!(session = self.id, error = %e, "fatal handler error");
                            break;
                        }
                        // Connection-local: log and keep receiving.
                        warn!(session = self.id, error = %e, "command failed");
                    }
                }
            }
        }
        self.close();
        handler.on_close(&self);
        debug!(session = self.id, "receiver loop finished");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("machine", &self.machine)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{timeouts, MAX_PAYLOAD};
    use std::net::TcpListener;

    struct Collect(Arc<Mutex<Vec<Command>>>);

    impl Handler for Collect {
        fn handle(
            &mut self,
            _session: &Arc<Session>,
            command: Command,
            _packet: Packet,
        ) -> Result<(), SwizError> {
            self.0.lock().push(command);
            Ok(())
        }
    }

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let join = thread::spawn(move || listener.accept().unwrap().0);
        let a = TcpStream::connect(addr).unwrap();
        let b = join.join().unwrap();
        transport::tune_socket(&a).unwrap();
        (a, b)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn ping_gets_an_automatic_pong() {
        let (peer, local) = pair();
        let session = Session::new(local, 1, "alice", "laptop").unwrap();
        session.start(Collect(Arc::new(Mutex::new(Vec::new()))));

        let mut peer = peer;
        transport::send_packet(&mut peer, &Packet::simple("ping")).unwrap();
        let reply = transport::recv_packet_deadline(&mut peer, timeouts::HANDSHAKE).unwrap();
        assert_eq!(reply.command, "pong");
        session.close();
    }

    #[test]
    fn malformed_commands_leave_the_loop_alive() {
        let (peer, local) = pair();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let session = Session::new(local, 2, "alice", "laptop").unwrap();
        session.start(Collect(seen.clone()));

        let mut peer = peer;
        // Wrong arity, then an unknown verb, then something valid.
        transport::send_packet(&mut peer, &Packet::simple("ping|pong|ping|pong")).unwrap();
        transport::send_packet(&mut peer, &Packet::simple("frobnicate")).unwrap();
        transport::send_packet(&mut peer, &Packet::simple("get_sync_dir")).unwrap();

        wait_for(|| seen.lock().contains(&Command::GetSyncDir));
        assert_eq!(session.state(), SessionState::Running);
        session.close();
    }

    #[test]
    fn peer_exit_closes_the_session() {
        let (peer, local) = pair();
        let session = Session::new(local, 3, "alice", "laptop").unwrap();
        session.start(Collect(Arc::new(Mutex::new(Vec::new()))));

        let mut peer = peer;
        transport::send_packet(&mut peer, &Packet::simple("exit")).unwrap();
        wait_for(|| session.state() == SessionState::Closed);
    }

    #[test]
    fn unsendable_packet_costs_only_itself() {
        let (peer, local) = pair();
        let session = Session::new(local, 7, "alice", "laptop").unwrap();
        session.start(Collect(Arc::new(Mutex::new(Vec::new()))));

        // Too big to encode: the sender must drop it and keep draining.
        session.enqueue(Packet::with_payload("clist", vec![0u8; MAX_PAYLOAD + 1]));
        session.enqueue(Packet::simple("ping"));

        let mut peer = peer;
        let pkt = transport::recv_packet_deadline(&mut peer, timeouts::HANDSHAKE).unwrap();
        assert_eq!(pkt.command, "ping");
        assert_eq!(session.state(), SessionState::Running);
        session.close();
    }

    #[test]
    fn queued_packets_arrive_in_fifo_order() {
        let (peer, local) = pair();
        let session = Session::new(local, 4, "alice", "laptop").unwrap();
        session.start(Collect(Arc::new(Mutex::new(Vec::new()))));

        for i in 0..10 {
            session.enqueue(Packet::with_payload("clist", vec![i]));
        }
        let mut peer = peer;
        for i in 0..10 {
            let pkt = transport::recv_packet_deadline(&mut peer, timeouts::HANDSHAKE).unwrap();
            assert_eq!(pkt.payload, vec![i]);
        }
        session.close();
    }

    #[test]
    fn shutdown_exit_discards_the_queue_and_sends_exit() {
        let (peer, local) = pair();
        let session = Session::new(local, 5, "alice", "laptop").unwrap();
        // No loops running: the queue is never drained, so only the
        // force-sent exit may reach the peer.
        for _ in 0..5 {
            session.enqueue(Packet::simple("ping"));
        }
        session.shutdown_exit();

        let mut peer = peer;
        let pkt = transport::recv_packet_deadline(&mut peer, timeouts::HANDSHAKE).unwrap();
        assert_eq!(pkt.command, "exit");
        session.close();
    }

    #[test]
    fn close_is_idempotent() {
        let (_peer, local) = pair();
        let session = Session::new(local, 6, "alice", "laptop").unwrap();
        session.start(Collect(Arc::new(Mutex::new(Vec::new()))));
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }
}
