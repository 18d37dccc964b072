//! Exact-count socket I/O and packet framing over a connected stream
//!
//! Both sides run blocking sockets with a short read timeout so a receive
//! loop blocked on an idle connection still notices its stop flag. A
//! timeout while waiting for the first byte of a header is *idle*, not an
//! error; a timeout anywhere after that means the peer stalled mid-packet
//! and the session must come down.

use std::io::{Read, Write};
use std::net::TcpStream;

use crate::error::{SwizError, TransportError};
use crate::packet::Packet;
use crate::protocol::{timeouts, HEADER_LEN};

/// Apply the socket options every session socket runs with.
pub fn tune_socket(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeouts::IDLE_POLL))?;
    stream.set_write_timeout(Some(timeouts::HANDSHAKE))?;
    Ok(())
}

/// Write all of `buf` or fail. A zero-length write is a closed connection.
pub fn send_exact(stream: &mut TcpStream, buf: &[u8]) -> Result<(), TransportError> {
    let mut sent = 0;
    while sent < buf.len() {
        let n = stream.write(&buf[sent..])?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        sent += n;
    }
    Ok(())
}

/// Read exactly `len` bytes or fail.
pub fn recv_exact(stream: &mut TcpStream, len: usize) -> Result<Vec<u8>, TransportError> {
    let mut buf = vec![0u8; len];
    fill(stream, &mut buf, 0)?;
    Ok(buf)
}

// Read into buf[filled..] until full. Once any byte of a packet has
// arrived, a timeout is a hard failure.
fn fill(stream: &mut TcpStream, buf: &mut [u8], mut filled: usize) -> Result<(), TransportError> {
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        filled += n;
    }
    Ok(())
}

/// Send one packet: header, then payload iff it is non-empty.
pub fn send_packet(stream: &mut TcpStream, pkt: &Packet) -> Result<(), SwizError> {
    let mut hdr = Vec::with_capacity(HEADER_LEN);
    pkt.encode_header(&mut hdr)?;
    send_exact(stream, &hdr)?;
    if !pkt.payload.is_empty() {
        send_exact(stream, &pkt.payload)?;
    }
    Ok(())
}

/// Receive one packet. `Ok(None)` means the read timed out before any
/// header byte arrived (idle connection); the caller should poll its stop
/// flag and try again.
pub fn recv_packet(stream: &mut TcpStream) -> Result<Option<Packet>, SwizError> {
    let mut hdr = [0u8; HEADER_LEN];

    // First read decides idle vs mid-packet stall.
    let filled = match stream.read(&mut hdr) {
        Ok(0) => return Err(TransportError::Closed.into()),
        Ok(n) => n,
        Err(e) => match TransportError::from(e) {
            TransportError::Timeout => return Ok(None),
            other => return Err(other.into()),
        },
    };
    fill(stream, &mut hdr, filled)?;

    let (mut pkt, payload_size) = Packet::decode_header(&hdr)?;
    if payload_size > 0 {
        pkt.payload = recv_exact(stream, payload_size)?;
    }
    Ok(pkt.into())
}

/// Receive one packet, retrying idle timeouts until `deadline` elapses.
/// Used for handshakes where the reply is expected promptly.
pub fn recv_packet_deadline(
    stream: &mut TcpStream,
    deadline: std::time::Duration,
) -> Result<Packet, SwizError> {
    let start = std::time::Instant::now();
    loop {
        if let Some(pkt) = recv_packet(stream)? {
            return Ok(pkt);
        }
        if start.elapsed() >= deadline {
            return Err(TransportError::Timeout.into());
        }
    }
}
