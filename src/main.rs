use clap::Parser;
use nocturne::{Config, WebServer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "nocturne")]
#[command(about = "Single-host epoll HTTP/1.1 server")]
#[command(version)]
struct Cli {
    /// Listening port (overrides NOCTURNE_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Worker thread count, 0 = one per core (overrides NOCTURNE_WORKERS)
    #[arg(long)]
    workers: Option<usize>,

    /// Trigger mode 0-3 (overrides NOCTURNE_TRIG_MODE)
    #[arg(long)]
    trig_mode: Option<u8>,

    /// Idle-connection timeout in ms, 0 disables (overrides NOCTURNE_TIMEOUT_MS)
    #[arg(long)]
    timeout_ms: Option<u64>,
}

fn main() {
    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(workers) = cli.workers {
        config.worker_count = workers;
    }
    if let Some(trig_mode) = cli.trig_mode {
        config.trig_mode = trig_mode;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.timeout_ms = timeout_ms;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        shutdown_flag.store(true, Ordering::SeqCst);
    })
    .expect("error setting ctrl-c handler");

    WebServer::new(&config, shutdown).run();
}
