//! Live Echo Test - Many Connections Through One Pool
//!
//! Echo server in-process di atas `SessionPool`, lalu beberapa thread
//! injector menulis payload deterministik dan memverifikasi echo-nya
//! byte per byte.
//!
//! Usage:
//!   cargo test --release --test live_echo_test -- --nocapture

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tether::{Blob, ChannelPool, Config, Error, Session, SessionContext, SessionPool};

struct EchoSession {
    dropped: Arc<AtomicU64>,
}

impl Session for EchoSession {
    fn on_message(&mut self, ctx: &SessionContext, data: Blob) {
        let len = data.len() as u64;
        match ctx.send(data) {
            Ok(()) => {}
            Err(Error::WouldBlock(_)) => {
                self.dropped.fetch_add(len, Ordering::Relaxed);
            }
            Err(e) => eprintln!("⚠️ [{}] Echo failed: {}", ctx.id(), e),
        }
    }
}

fn start_echo(config: Config) -> (ChannelPool, SocketAddr, Arc<AtomicU64>) {
    let dropped = Arc::new(AtomicU64::new(0));
    let factory_dropped = Arc::clone(&dropped);
    let sessions = Arc::new(SessionPool::new(move |_ctx: &SessionContext| {
        Box::new(EchoSession {
            dropped: Arc::clone(&factory_dropped),
        }) as Box<dyn Session>
    }));
    let pool = ChannelPool::new(config, sessions).expect("pool");
    let addr = pool.listen("127.0.0.1:0".parse().unwrap()).expect("listen");
    (pool, addr, dropped)
}

/// Payload deterministik per (client, sequence)
fn payload(client: u64, sequence: u64, len: usize) -> Vec<u8> {
    let mut hash = client.wrapping_mul(6364136223846793005).wrapping_add(sequence);
    (0..len)
        .map(|_| {
            hash = hash.wrapping_mul(6364136223846793005).wrapping_add(1);
            (hash >> 33) as u8
        })
        .collect()
}

/// Statistics collector
struct EchoStats {
    round_trips: AtomicU64,
    errors: AtomicU64,
    total_latency_ns: AtomicU64,
    max_latency_ns: AtomicU64,
}

impl EchoStats {
    fn new() -> Self {
        Self {
            round_trips: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            total_latency_ns: AtomicU64::new(0),
            max_latency_ns: AtomicU64::new(0),
        }
    }

    fn record(&self, latency_ns: u64) {
        self.round_trips.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ns.fetch_add(latency_ns, Ordering::Relaxed);

        // Update max (CAS loop)
        let mut current = self.max_latency_ns.load(Ordering::Relaxed);
        while latency_ns > current {
            match self.max_latency_ns.compare_exchange_weak(
                current,
                latency_ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(c) => current = c,
            }
        }
    }

    fn print_report(&self, duration: Duration) {
        let trips = self.round_trips.load(Ordering::Relaxed);
        let avg = if trips > 0 {
            self.total_latency_ns.load(Ordering::Relaxed) / trips
        } else {
            0
        };

        println!("\n📊 ECHO TEST RESULTS");
        println!("====================");
        println!("  Duration:      {:.2}s", duration.as_secs_f64());
        println!("  Round trips:   {}", trips);
        println!("  Errors:        {}", self.errors.load(Ordering::Relaxed));
        println!("  Avg latency:   {:.2} μs", avg as f64 / 1000.0);
        println!(
            "  Max latency:   {:.2} μs",
            self.max_latency_ns.load(Ordering::Relaxed) as f64 / 1000.0
        );
    }
}

fn echo_client(addr: SocketAddr, client: u64, rounds: u64, len: usize, stats: Arc<EchoStats>) {
    let mut stream = match TcpStream::connect(addr) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to connect: {}", e);
            stats.errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    stream.set_nodelay(true).ok();
    stream.set_read_timeout(Some(Duration::from_secs(10))).ok();

    let mut echoed = vec![0u8; len];
    for sequence in 0..rounds {
        let data = payload(client, sequence, len);
        let start = Instant::now();

        if stream.write_all(&data).is_err() || stream.read_exact(&mut echoed).is_err() {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if echoed != data {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
        stats.record(start.elapsed().as_nanos() as u64);
    }
}

#[test]
fn test_many_clients_round_trip() {
    println!("\n🧪 LIVE ECHO TEST - 16 clients x 200 round trips");
    println!("=================================================\n");

    let config = Config {
        worker_thread_count: 4,
        ..Config::default()
    };
    let (pool, addr, dropped) = start_echo(config);
    let stats = Arc::new(EchoStats::new());

    let start = Instant::now();
    let handles: Vec<_> = (0..16u64)
        .map(|client| {
            let stats = Arc::clone(&stats);
            thread::spawn(move || echo_client(addr, client, 200, 512, stats))
        })
        .collect();
    for handle in handles {
        handle.join().ok();
    }
    let duration = start.elapsed();

    stats.print_report(duration);

    assert_eq!(stats.errors.load(Ordering::Relaxed), 0, "echo mismatch or I/O error");
    assert_eq!(stats.round_trips.load(Ordering::Relaxed), 16 * 200);
    assert_eq!(dropped.load(Ordering::Relaxed), 0);

    // Semua client sudah disconnect: pool harus kembali kosong
    let deadline = Instant::now() + Duration::from_secs(5);
    while pool.channel_count() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(pool.channel_count(), 0);
    assert_eq!(pool.manager_loads(), vec![0; 4]);
}

#[test]
fn test_burst_larger_than_socket_buffers() {
    println!("\n🧪 BURST TEST - 8MB echoed through one channel");
    println!("==============================================\n");

    // Watermark besar: tidak ada drop, tapi tetap banyak partial write
    let config = Config {
        worker_thread_count: 1,
        write_high_watermark: 64 * 1024 * 1024,
        write_low_watermark: 1024 * 1024,
        ..Config::default()
    };
    let (_pool, addr, dropped) = start_echo(config);

    let total = 8 * 1024 * 1024;
    let data = Arc::new(payload(7, 0, total));

    let mut writer = TcpStream::connect(addr).unwrap();
    let mut reader = writer.try_clone().unwrap();
    reader.set_read_timeout(Some(Duration::from_secs(20))).unwrap();

    let start = Instant::now();
    let write_data = Arc::clone(&data);
    let write_thread = thread::spawn(move || {
        for chunk in write_data.chunks(64 * 1024) {
            writer.write_all(chunk).unwrap();
        }
        writer
    });

    let mut echoed = vec![0u8; total];
    reader.read_exact(&mut echoed).unwrap();
    let _writer = write_thread.join().unwrap();
    let duration = start.elapsed();

    println!(
        "  {} MB in {:.2}ms ({:.1} MB/s)",
        total / (1024 * 1024),
        duration.as_secs_f64() * 1000.0,
        total as f64 / (1024.0 * 1024.0) / duration.as_secs_f64()
    );

    assert_eq!(dropped.load(Ordering::Relaxed), 0);
    assert!(echoed == *data, "echoed bytes differ from payload");
}
