//! The wire unit: a fixed-layout header plus an optional payload
//!
//! Header layout (little-endian, see [`crate::protocol`]):
//! command (1024 bytes, NUL-padded) | sequence i32 | payload_size u32 |
//! expected u32. The payload, when present, follows immediately and is
//! exactly `payload_size` bytes. A packet owns its payload buffer; nothing
//! downstream retains payload bytes beyond the call that handled them
//! without copying.

use crate::error::ProtocolError;
use crate::protocol::{COMMAND_FIELD, HEADER_LEN, MAX_PAYLOAD};

/// One framed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Pipe-delimited command text, at most `COMMAND_FIELD - 1` bytes.
    pub command: String,
    /// Chunk index within a transfer, 0-based.
    pub sequence: i32,
    /// Total chunks in this transfer; 1 for non-chunked commands.
    pub expected: u32,
    /// Raw payload bytes; empty means no payload is transmitted.
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(command: impl Into<String>, sequence: i32, expected: u32, payload: Vec<u8>) -> Self {
        Packet { command: command.into(), sequence, expected, payload }
    }

    /// A single-packet command with no payload.
    pub fn simple(command: impl Into<String>) -> Self {
        Packet::new(command, 0, 1, Vec::new())
    }

    /// A single-packet command carrying a payload.
    pub fn with_payload(command: impl Into<String>, payload: Vec<u8>) -> Self {
        Packet::new(command, 0, 1, payload)
    }

    /// True when this is the last chunk of its transfer.
    pub fn is_final(&self) -> bool {
        self.expected > 0 && self.sequence == self.expected as i32 - 1
    }

    /// Serialize header + payload into one buffer.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        self.encode_header(&mut buf)?;
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Serialize only the fixed header into `buf`.
    pub fn encode_header(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let cmd = self.command.as_bytes();
        // Keep at least one NUL so the decoder can find the terminator.
        if cmd.len() >= COMMAND_FIELD {
            return Err(ProtocolError::CommandTooLong { len: cmd.len(), max: COMMAND_FIELD - 1 });
        }
        if self.payload.len() > MAX_PAYLOAD {
            return Err(ProtocolError::OversizedPayload {
                size: self.payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        buf.extend_from_slice(cmd);
        buf.resize(buf.len() + (COMMAND_FIELD - cmd.len()), 0);
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.expected.to_le_bytes());
        Ok(())
    }

    /// Parse a fixed header. Returns the packet with an empty payload plus
    /// the declared payload size, capped against `MAX_PAYLOAD` before any
    /// allocation happens.
    pub fn decode_header(hdr: &[u8; HEADER_LEN]) -> Result<(Packet, usize), ProtocolError> {
        let nul = hdr[..COMMAND_FIELD]
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::BadCommandField)?;
        let command = std::str::from_utf8(&hdr[..nul])
            .map_err(|_| ProtocolError::BadCommandField)?
            .to_string();
        let mut at = COMMAND_FIELD;
        let sequence = i32::from_le_bytes([hdr[at], hdr[at + 1], hdr[at + 2], hdr[at + 3]]);
        at += 4;
        let payload_size =
            u32::from_le_bytes([hdr[at], hdr[at + 1], hdr[at + 2], hdr[at + 3]]) as usize;
        at += 4;
        let expected = u32::from_le_bytes([hdr[at], hdr[at + 1], hdr[at + 2], hdr[at + 3]]);
        if payload_size > MAX_PAYLOAD {
            return Err(ProtocolError::OversizedPayload { size: payload_size, max: MAX_PAYLOAD });
        }
        Ok((Packet { command, sequence, expected, payload: Vec::new() }, payload_size))
    }

    /// Parse a complete encoded packet (header + payload) from one buffer.
    pub fn decode(bytes: &[u8]) -> Result<Packet, ProtocolError> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::BadCommandField);
        }
        let mut hdr = [0u8; HEADER_LEN];
        hdr.copy_from_slice(&bytes[..HEADER_LEN]);
        let (mut pkt, payload_size) = Packet::decode_header(&hdr)?;
        if bytes.len() != HEADER_LEN + payload_size {
            return Err(ProtocolError::OversizedPayload {
                size: bytes.len() - HEADER_LEN,
                max: payload_size,
            });
        }
        pkt.payload = bytes[HEADER_LEN..].to_vec();
        Ok(pkt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_with_payload() {
        let p = Packet::new("upload|a.txt|d41d8cd98f00b204e9800998ecf8427e", 3, 7, vec![1, 2, 3]);
        let bytes = p.encode().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 3);
        assert_eq!(Packet::decode(&bytes).unwrap(), p);
    }

    #[test]
    fn round_trip_empty_payload() {
        let p = Packet::simple("ping");
        let bytes = p.encode().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        let back = Packet::decode(&bytes).unwrap();
        assert_eq!(back, p);
        assert!(back.payload.is_empty());
    }

    #[test]
    fn final_chunk_detection() {
        assert!(Packet::new("x", 0, 1, Vec::new()).is_final());
        assert!(Packet::new("x", 4, 5, Vec::new()).is_final());
        assert!(!Packet::new("x", 3, 5, Vec::new()).is_final());
    }

    #[test]
    fn rejects_oversized_declared_payload() {
        let p = Packet::simple("clist");
        let mut bytes = p.encode().unwrap();
        // Forge a payload_size past the cap.
        let huge = (MAX_PAYLOAD as u32 + 1).to_le_bytes();
        bytes[COMMAND_FIELD + 4..COMMAND_FIELD + 8].copy_from_slice(&huge);
        let mut hdr = [0u8; HEADER_LEN];
        hdr.copy_from_slice(&bytes[..HEADER_LEN]);
        assert!(matches!(
            Packet::decode_header(&hdr),
            Err(ProtocolError::OversizedPayload { .. })
        ));
    }

    #[test]
    fn rejects_command_filling_whole_field() {
        let p = Packet::simple("x".repeat(COMMAND_FIELD));
        assert!(matches!(p.encode(), Err(ProtocolError::CommandTooLong { .. })));
    }

    #[test]
    fn rejects_unterminated_command_field() {
        let hdr = [b'a'; HEADER_LEN];
        assert!(matches!(Packet::decode_header(&hdr), Err(ProtocolError::BadCommandField)));
    }
}
