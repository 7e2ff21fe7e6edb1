//! Tether Probe - Round-trip latency client
//!
//! Membuka beberapa channel outbound lewat `ChannelPool::connect`, lalu
//! melakukan ping-pong payload berukuran tetap ke echo server dan
//! mencatat latency round-trip per pesan.
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin tether_probe -- --host 127.0.0.1:9999 --connections 8
//! ```
//!
//! # Options
//!
//! - `--host ADDR` - Server address (default: 127.0.0.1:9999)
//! - `--connections N` - Jumlah channel paralel (default: 8)
//! - `--messages N` - Pesan per channel (default: 1000)
//! - `--size BYTES` - Ukuran payload (default: 64)
//! - `--timeout-ms MS` - Connect timeout (default: 3000)

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use tether::{Blob, ChannelId, ChannelObserver, ChannelPool, Config, DownReason, PoolHandle};

/// Latency histogram; bucket tetap + sample mentah untuk percentile
struct LatencyHistogram {
    buckets: [AtomicU64; 8],
    count: AtomicU64,
    sum_ns: AtomicU64,
    samples: Mutex<Vec<u64>>,
}

const BUCKET_NAMES: [&str; 8] = [
    "<20us", "20-50us", "50-100us", "100-500us", "500us-1ms", "1-5ms", "5-10ms", ">10ms",
];

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_ns: AtomicU64::new(0),
            samples: Mutex::new(Vec::with_capacity(100_000)),
        }
    }

    fn record(&self, latency_ns: u64) {
        let bucket = match latency_ns {
            0..=19_999 => 0,
            20_000..=49_999 => 1,
            50_000..=99_999 => 2,
            100_000..=499_999 => 3,
            500_000..=999_999 => 4,
            1_000_000..=4_999_999 => 5,
            5_000_000..=9_999_999 => 6,
            _ => 7,
        };
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.sum_ns.fetch_add(latency_ns, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        let mut samples = self.samples.lock();
        if samples.len() < 100_000 {
            samples.push(latency_ns);
        }
    }

    fn print_report(&self) {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            println!("  No samples collected");
            return;
        }

        let mut samples = self.samples.lock().clone();
        samples.sort_unstable();
        let percentile = |p: f64| {
            let idx = ((samples.len() as f64 * p / 100.0) as usize).min(samples.len() - 1);
            samples[idx] as f64 / 1000.0
        };
        let avg = self.sum_ns.load(Ordering::Relaxed) / count;

        println!("\n📊 ROUND-TRIP LATENCY");
        println!("=====================");
        println!("  Samples:    {}", count);
        println!("  Avg:        {:.2} us", avg as f64 / 1000.0);
        println!("  P50:        {:.2} us", percentile(50.0));
        println!("  P99:        {:.2} us", percentile(99.0));
        println!("  Max:        {:.2} us", percentile(100.0));

        println!("\n  Histogram:");
        for (i, name) in BUCKET_NAMES.iter().enumerate() {
            let bucket_count = self.buckets[i].load(Ordering::Relaxed);
            if bucket_count > 0 {
                let pct = bucket_count as f64 / count as f64 * 100.0;
                let bar = "█".repeat(((pct / 2.0) as usize).min(40));
                println!("    {:10} {:8} ({:5.1}%) {}", name, bucket_count, pct, bar);
            }
        }
    }
}

/// Probe configuration
struct ProbeArgs {
    host: String,
    connections: usize,
    messages: usize,
    size: usize,
    timeout_ms: u64,
    verbose: bool,
}

impl Default for ProbeArgs {
    fn default() -> Self {
        Self {
            host: "127.0.0.1:9999".to_string(),
            connections: 8,
            messages: 1000,
            size: 64,
            timeout_ms: 3000,
            verbose: false,
        }
    }
}

struct Ping {
    sent_at: Instant,
    remaining: usize,
    received: usize,
}

/// Observer yang menjalankan ping-pong di setiap channel
struct Prober {
    payload: Bytes,
    messages: usize,
    pings: Mutex<HashMap<ChannelId, Ping>>,
    histogram: LatencyHistogram,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl Prober {
    fn finished(&self) -> usize {
        self.completed.load(Ordering::Acquire) + self.failed.load(Ordering::Acquire)
    }
}

impl ChannelObserver for Prober {
    fn on_channel_up(&self, pool: &PoolHandle, id: ChannelId, peer: SocketAddr) {
        debug!(channel = %id, %peer, "probe connected");
        self.pings.lock().insert(
            id,
            Ping {
                sent_at: Instant::now(),
                remaining: self.messages,
                received: 0,
            },
        );
        if let Err(e) = pool.send(id, Blob::from(self.payload.clone())) {
            eprintln!("⚠️ [{}] Send failed: {}", id, e);
            let _ = pool.shutdown(id);
        }
    }

    fn on_channel_down(&self, _pool: &PoolHandle, id: ChannelId, reason: DownReason) {
        let ping = self.pings.lock().remove(&id);
        match ping {
            Some(ping) if ping.remaining == 0 => {
                self.completed.fetch_add(1, Ordering::AcqRel);
            }
            _ => {
                eprintln!("❌ [{}] Channel down early: {}", id, reason);
                self.failed.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    fn on_data_available(&self, pool: &PoolHandle, id: ChannelId, data: Blob) {
        let size = self.payload.len();
        let mut send_next = false;
        let mut close = false;
        {
            let mut pings = self.pings.lock();
            let Some(ping) = pings.get_mut(&id) else {
                return;
            };
            ping.received += data.len();
            while ping.received >= size && ping.remaining > 0 {
                ping.received -= size;
                ping.remaining -= 1;
                self.histogram
                    .record(ping.sent_at.elapsed().as_nanos() as u64);
                if ping.remaining > 0 {
                    ping.sent_at = Instant::now();
                    send_next = true;
                } else {
                    close = true;
                }
            }
        }

        if close {
            let _ = pool.shutdown(id);
        } else if send_next {
            if let Err(e) = pool.send(id, Blob::from(self.payload.clone())) {
                eprintln!("⚠️ [{}] Send failed: {}", id, e);
                let _ = pool.shutdown(id);
            }
        }
    }
}

fn run_probe(args: ProbeArgs) -> Result<()> {
    println!("🦀 TETHER PROBE - Round-trip Benchmark");
    println!("======================================\n");

    println!("Configuration:");
    println!("  Server:       {}", args.host);
    println!("  Connections:  {}", args.connections);
    println!("  Messages:     {} per connection", args.messages);
    println!("  Payload:      {} bytes", args.size);
    println!();

    let addr: SocketAddr = args
        .host
        .parse()
        .with_context(|| format!("invalid server address {}", args.host))?;
    anyhow::ensure!(args.size > 0, "payload size must be positive");

    let prober = Arc::new(Prober {
        payload: Bytes::from(vec![0xA5u8; args.size]),
        messages: args.messages.max(1),
        pings: Mutex::new(HashMap::new()),
        histogram: LatencyHistogram::new(),
        completed: AtomicUsize::new(0),
        failed: AtomicUsize::new(0),
    });

    let config = Config {
        connect_timeout: Duration::from_millis(args.timeout_ms),
        ..Config::default()
    };
    let pool = ChannelPool::new(config, prober.clone()).context("failed to start channel pool")?;

    println!("🔌 Connecting...");
    let start_time = Instant::now();
    for _ in 0..args.connections {
        let id = pool.connect(addr)?;
        if args.verbose {
            println!("   [{}] connecting to {}", id, addr);
        }
    }

    while prober.finished() < args.connections {
        std::thread::sleep(Duration::from_millis(10));
        if pool.live_managers() == 0 {
            anyhow::bail!("all workers failed");
        }
    }
    let elapsed = start_time.elapsed();

    let completed = prober.completed.load(Ordering::Acquire);
    let failed = prober.failed.load(Ordering::Acquire);
    println!("\n✅ Done in {:.2}s", elapsed.as_secs_f64());
    println!("   Completed:  {}", completed);
    if failed > 0 {
        println!("   Failed:     {} ⚠️", failed);
    }
    prober.histogram.print_report();

    Ok(())
}

fn parse_args() -> ProbeArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ProbeArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                if i + 1 < args.len() {
                    config.host = args[i + 1].clone();
                    i += 1;
                }
            }
            "--connections" | "-n" => {
                if i + 1 < args.len() {
                    config.connections = args[i + 1].parse().unwrap_or(8);
                    i += 1;
                }
            }
            "--messages" | "-m" => {
                if i + 1 < args.len() {
                    config.messages = args[i + 1].parse().unwrap_or(1000);
                    i += 1;
                }
            }
            "--size" => {
                if i + 1 < args.len() {
                    config.size = args[i + 1].parse().unwrap_or(64);
                    i += 1;
                }
            }
            "--timeout-ms" => {
                if i + 1 < args.len() {
                    config.timeout_ms = args[i + 1].parse().unwrap_or(3000);
                    i += 1;
                }
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--help" | "-h" => {
                println!("Tether Probe - round-trip latency client\n");
                println!("Usage: tether_probe [OPTIONS]\n");
                println!("Options:");
                println!("      --host <ADDR>        Server address (default: 127.0.0.1:9999)");
                println!("  -n, --connections <N>    Parallel channels (default: 8)");
                println!("  -m, --messages <N>       Messages per channel (default: 1000)");
                println!("      --size <BYTES>       Payload size (default: 64)");
                println!("      --timeout-ms <MS>    Connect timeout (default: 3000)");
                println!("  -v, --verbose            Verbose output");
                println!("  -h, --help               Show this help");
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

fn main() {
    let args = parse_args();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tether=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run_probe(args) {
        eprintln!("❌ Probe error: {:#}", e);
        std::process::exit(1);
    }
}
