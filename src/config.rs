//! Startup parameter validation shared by the client and the daemon

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

use crate::error::ConfigError;

/// Usernames are 1 to 12 ASCII alphanumerics. They become directory names
/// on the server, so nothing fancier is allowed.
pub fn validate_username(name: &str) -> Result<(), ConfigError> {
    let bad = |reason| ConfigError::BadUsername { name: name.to_string(), reason };
    if name.is_empty() {
        return Err(bad("empty"));
    }
    if name.len() > 12 {
        return Err(bad("longer than 12 characters"));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(bad("only ASCII letters and digits are allowed"));
    }
    // Handshake replies reuse the login verb (`login|ok|...`,
    // `login|fail|...`), so these two tokens can never name a user.
    if name == "ok" || name == "fail" {
        return Err(bad("reserved protocol token"));
    }
    Ok(())
}

/// Parse `host:port` where host is an IPv4 literal or `localhost`.
pub fn parse_address(addr: &str) -> Result<SocketAddr, ConfigError> {
    let bad = |reason| ConfigError::BadAddress { addr: addr.to_string(), reason };
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| bad("missing :port"))?;
    let port: u16 = port.parse().map_err(|_| bad("port is not a number in 0..=65535"))?;
    let ip: Ipv4Addr = if host == "localhost" {
        Ipv4Addr::LOCALHOST
    } else {
        host.parse().map_err(|_| bad("host is not an IPv4 address or localhost"))?
    };
    Ok(SocketAddr::from((ip, port)))
}

/// The sync directory must exist and be a directory before either side
/// starts moving files around.
pub fn validate_sync_dir(path: &Path) -> Result<(), ConfigError> {
    let bad = |reason| ConfigError::BadDirectory { path: path.display().to_string(), reason };
    let meta = std::fs::metadata(path).map_err(|_| bad("does not exist"))?;
    if !meta.is_dir() {
        return Err(bad("not a directory"));
    }
    Ok(())
}

/// This machine's name for the login handshake. Falls back to a fixed
/// token when the hostname is unavailable or not UTF-8.
pub fn machine_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
