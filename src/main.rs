use anyhow::Result;
use clap::Parser;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use swiz::cli::ClientOpts;
use swiz::client::{Client, ClientConfig, HELP};
use swiz::logging;

fn main() -> Result<()> {
    logging::init("info");
    let opts = ClientOpts::parse();

    let mut cfg = ClientConfig::new(&opts.server, &opts.user, &opts.dir);
    if let Some(dir) = &opts.download_dir {
        cfg.download_dir = dir.clone();
    }
    cfg.scan_interval = Duration::from_secs(opts.scan_interval.max(1));

    let client = Client::connect(cfg)?;

    // Ctrl-C becomes a clean logout instead of a dropped socket.
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst))?;
    }

    println!("connected; type 'help' for commands");
    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        if interrupted.load(Ordering::SeqCst) || !client.is_connected() {
            break;
        }
        print!("swiz> ");
        std::io::stdout().flush()?;
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        if !dispatch(&client, line.trim())? {
            break;
        }
    }

    client.exit();
    println!("bye");
    Ok(())
}

// Returns false when the user asked to quit.
fn dispatch(client: &Arc<Client>, line: &str) -> Result<bool> {
    let mut words = line.split_whitespace();
    let verb = match words.next() {
        Some(v) => v,
        None => return Ok(true),
    };
    let arg = words.next();

    match (verb, arg) {
        ("exit", _) | ("quit", _) => return Ok(false),
        ("help", _) => println!("{}", HELP),
        ("sync", _) => client.sync()?,
        ("get_sync_dir", _) => client.get_sync_dir(),
        ("upload", Some(path)) => {
            if let Err(e) = client.upload(path) {
                eprintln!("upload failed: {}", e);
            }
        }
        ("download", Some(path)) => client.download(path),
        ("adownload", Some(path)) => client.adownload(path),
        ("delete", Some(path)) => {
            if let Err(e) = client.delete(path) {
                eprintln!("delete failed: {}", e);
            }
        }
        ("list", Some("server")) => client.list_server(),
        ("list", Some("client")) => {
            let text = client.list_client()?;
            println!("--- local files ---");
            if text.is_empty() {
                println!("(empty)");
            } else {
                println!("{}", text);
            }
        }
        ("ping", _) => {
            client.probe();
            std::thread::sleep(Duration::from_millis(300));
            match client.rtt() {
                Some(rtt) => println!("round-trip: {} ms", rtt.as_millis()),
                None => println!("no pong yet"),
            }
        }
        _ => println!("unrecognized command; type 'help'"),
    }
    Ok(true)
}
