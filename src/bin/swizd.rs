use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use swiz::cli::DaemonOpts;
use swiz::logging;
use swiz::server::{Server, ServerConfig};

fn main() -> Result<()> {
    logging::init("info");
    let opts = DaemonOpts::parse();

    if !opts.root.is_dir() {
        anyhow::bail!("root is not a directory: {}", opts.root.display());
    }
    let root = std::fs::canonicalize(&opts.root)
        .with_context(|| format!("cannot canonicalize {}", opts.root.display()))?;

    let mut cfg = ServerConfig::new(&opts.bind, root);
    cfg.session_ceiling = opts.session_ceiling.max(1);
    cfg.liveness_timeout = Duration::from_secs(opts.liveness_timeout.max(1));

    let server = Server::bind(cfg)?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))?;
    }

    server.run_until(&stop);
    Ok(())
}
