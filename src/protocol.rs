//! Shared protocol constants for the swiz framed transport

/// Size of the NUL-padded command field at the start of every header.
pub const COMMAND_FIELD: usize = 1024;

/// Fixed header layout, little-endian:
/// command (1024, NUL-padded) | sequence i32 | payload_size u32 | expected u32
pub const HEADER_LEN: usize = COMMAND_FIELD + 4 + 4 + 4;

/// Maximum payload bytes per packet - prevents DoS via memory exhaustion.
/// A decoder must reject anything larger before allocating.
pub const MAX_PAYLOAD: usize = 1024 * 1024;

/// File transfers are fragmented into chunks of this many payload bytes.
pub const CHUNK_SIZE: usize = 8192;

/// Suffix of the staging file accumulating an in-progress transfer.
/// Staging files found at startup are crash debris and must be purged.
pub const STAGING_SUFFIX: &str = ".swizdownload";

/// Checksum slot token meaning "the request could not be satisfied".
pub const FAIL_TOKEN: &str = "fail";

/// Default daemon port.
pub const DEFAULT_PORT: u16 = 9407;

/// Maximum simultaneous sessions per username.
pub const DEFAULT_SESSION_CEILING: usize = 2;

// Centralized timing tunables so the client and daemon stay consistent
pub mod timeouts {
    use std::time::Duration;

    /// Socket read timeout; bounds how long a blocked receive loop takes
    /// to notice its stop flag.
    pub const IDLE_POLL: Duration = Duration::from_millis(500);

    /// Deadline for the login handshake round-trip.
    pub const HANDSHAKE: Duration = Duration::from_secs(5);

    /// Overseer tick between liveness probes.
    pub const OVERSEER_INTERVAL: Duration = Duration::from_secs(5);

    /// A session whose last pong is older than this is evicted. The
    /// historical default of 3s evicted healthy sessions on real networks;
    /// this is a tunable with a saner default.
    pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(30);

    /// Accept-loop tick while no connection is pending.
    pub const ACCEPT_POLL: Duration = Duration::from_millis(200);

    /// Local change-scanner poll interval.
    pub const SCAN_INTERVAL: Duration = Duration::from_secs(2);
}
