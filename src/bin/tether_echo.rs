//! Tether Echo Server
//!
//! Echo server di atas `SessionPool`: setiap byte yang diterima dikirim
//! balik ke channel yang sama. Berguna sebagai target `tether_probe`.
//!
//! Usage:
//!   cargo run --release --bin tether_echo -- [OPTIONS]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tether::{
    Blob, ChannelPool, Config, DownReason, Session, SessionContext, SessionPool,
};

/// Server configuration dari command line
struct EchoArgs {
    bind_addr: String,
    workers: Option<usize>,
    config_path: Option<PathBuf>,
    verbose: bool,
}

impl Default for EchoArgs {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9999".to_string(),
            workers: None,
            config_path: None,
            verbose: false,
        }
    }
}

/// Server statistics
struct EchoStats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    dropped: AtomicU64,
    sessions_total: AtomicU64,
    sessions_active: AtomicU64,
    backpressure_events: AtomicU64,
}

impl EchoStats {
    fn new() -> Self {
        Self {
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            sessions_total: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            backpressure_events: AtomicU64::new(0),
        }
    }

    fn print_stats(&self, uptime: Duration, loads: &[usize]) {
        let bytes_in = self.bytes_in.load(Ordering::Relaxed);
        let bytes_out = self.bytes_out.load(Ordering::Relaxed);
        let dropped = self.dropped.load(Ordering::Relaxed);
        let high = self.backpressure_events.load(Ordering::Relaxed);

        let rate_in = bytes_in as f64 / uptime.as_secs_f64() / 1024.0;

        println!("\n📊 Echo Stats (uptime: {:.1}s)", uptime.as_secs_f64());
        println!("   Bytes in:      {} KB ({:.1} KB/sec)", bytes_in / 1024, rate_in);
        println!("   Bytes out:     {} KB", bytes_out / 1024);
        println!(
            "   Sessions:      {} active / {} total",
            self.sessions_active.load(Ordering::Relaxed),
            self.sessions_total.load(Ordering::Relaxed)
        );
        println!("   Worker loads:  {:?}", loads);
        if dropped > 0 {
            println!("   Dropped:       {} KB ⚠️", dropped / 1024);
        }
        if high > 0 {
            println!("   High-water:    {} ⚠️", high);
        }
    }
}

struct EchoSession {
    stats: Arc<EchoStats>,
    verbose: bool,
}

impl Session for EchoSession {
    fn on_message(&mut self, ctx: &SessionContext, data: Blob) {
        let len = data.len() as u64;
        self.stats.bytes_in.fetch_add(len, Ordering::Relaxed);
        if self.verbose {
            println!("   [{}] Read {} bytes", ctx.id(), len);
        }

        match ctx.send(data) {
            Ok(()) => {
                self.stats.bytes_out.fetch_add(len, Ordering::Relaxed);
            }
            // Peer tidak membaca cukup cepat; buang sampai low-watermark
            Err(e) if e.is_recoverable() => {
                self.stats.dropped.fetch_add(len, Ordering::Relaxed);
            }
            Err(e) => warn!(channel = %ctx.id(), error = %e, "echo failed"),
        }
    }

    fn on_high_watermark(&mut self, ctx: &SessionContext) {
        self.stats.backpressure_events.fetch_add(1, Ordering::Relaxed);
        if self.verbose {
            println!("   [{}] High watermark", ctx.id());
        }
    }

    fn on_shutdown(&mut self, ctx: &SessionContext, reason: DownReason) {
        self.stats.sessions_active.fetch_sub(1, Ordering::Relaxed);
        println!("❌ [{}] Disconnected: {} ({})", ctx.id(), ctx.peer_addr(), reason);
    }
}

fn run_server(args: EchoArgs) -> Result<()> {
    println!("🚀 TETHER ECHO SERVER");
    println!("=====================\n");

    let mut config = match &args.config_path {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(workers) = args.workers {
        config.worker_thread_count = workers;
    }

    let bind: SocketAddr = args
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {}", args.bind_addr))?;

    let stats = Arc::new(EchoStats::new());
    let factory_stats = Arc::clone(&stats);
    let verbose = args.verbose;
    let sessions = Arc::new(SessionPool::new(move |ctx: &SessionContext| {
        factory_stats.sessions_total.fetch_add(1, Ordering::Relaxed);
        factory_stats.sessions_active.fetch_add(1, Ordering::Relaxed);
        println!("✅ [{}] Connected: {}", ctx.id(), ctx.peer_addr());
        Box::new(EchoSession {
            stats: Arc::clone(&factory_stats),
            verbose,
        }) as Box<dyn Session>
    }));

    let workers = config.worker_thread_count;
    let pool = ChannelPool::new(config, sessions).context("failed to start channel pool")?;
    let local = pool.listen(bind).context("failed to listen")?;

    println!("🔌 Listening on {}", local);
    println!("🧵 Workers: {}", workers);
    println!("\n📡 Waiting for connections...\n");
    info!(addr = %local, workers, "echo server ready");

    let start_time = Instant::now();
    loop {
        std::thread::sleep(Duration::from_secs(5));
        stats.print_stats(start_time.elapsed(), &pool.manager_loads());
        if pool.live_managers() == 0 {
            anyhow::bail!("all workers failed");
        }
    }
}

fn parse_args() -> EchoArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut config = EchoArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].clone();
                    i += 1;
                }
            }
            "--workers" | "-w" => {
                if i + 1 < args.len() {
                    config.workers = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--help" | "-h" => {
                println!("Tether Echo Server\n");
                println!("Usage: tether_echo [OPTIONS]\n");
                println!("Options:");
                println!("  -b, --bind <ADDR>     Bind address (default: 0.0.0.0:9999)");
                println!("  -w, --workers <N>     Worker threads (default: from config)");
                println!("  -c, --config <PATH>   TOML config file");
                println!("  -v, --verbose         Verbose output");
                println!("  -h, --help            Show this help");
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "tether=debug" } else { "tether=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    let args = parse_args();
    init_tracing(args.verbose);

    if let Err(e) = run_server(args) {
        eprintln!("❌ Server error: {:#}", e);
        std::process::exit(1);
    }
}
