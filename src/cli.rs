//! Command-line options for the `swiz` client and `swizd` daemon

use clap::Parser;
use std::path::PathBuf;

/// Daemon options
#[derive(Clone, Debug, Parser)]
#[command(name = "swizd", about = "swiz synchronization daemon")]
pub struct DaemonOpts {
    /// Bind address (host:port)
    #[arg(long, default_value = "0.0.0.0:9407")]
    pub bind: String,

    /// Storage root; each user gets a subdirectory
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Maximum simultaneous sessions per username
    #[arg(long, default_value_t = crate::protocol::DEFAULT_SESSION_CEILING)]
    pub session_ceiling: usize,

    /// Seconds without a pong before a session is evicted
    #[arg(long, default_value_t = 30)]
    pub liveness_timeout: u64,
}

/// Client options
#[derive(Clone, Debug, Parser)]
#[command(name = "swiz", about = "swiz synchronization client")]
pub struct ClientOpts {
    /// Daemon address (IPv4 host:port, or localhost:port)
    #[arg(long, default_value = "127.0.0.1:9407")]
    pub server: String,

    /// Username (1-12 ASCII alphanumerics)
    #[arg(long)]
    pub user: String,

    /// Directory to keep synchronized
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,

    /// Where adownload deliveries land (defaults to the working directory)
    #[arg(long)]
    pub download_dir: Option<PathBuf>,

    /// Seconds between local change scans
    #[arg(long, default_value_t = 2)]
    pub scan_interval: u64,
}
