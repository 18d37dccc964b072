//! Tracing subscriber setup shared by the client and daemon binaries
//!
//! Log level defaults to INFO and is controlled with `RUST_LOG`:
//!
//! ```bash
//! RUST_LOG=debug swizd
//! RUST_LOG=swiz::transfer=trace swiz
//! ```

/// Install the global subscriber. Logs go to stderr so the client's
/// interactive prompt on stdout stays clean.
pub fn init(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}
