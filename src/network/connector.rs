//! Connector: outbound connect non-blocking dengan timeout dan retry
//!
//! State machine per request: CONNECTING -> {CONNECTED, FAILED, TIMED_OUT}.
//! Satu timer untuk seluruh timeout (mencakup semua retry). Callback
//! terminal dipanggil tepat sekali, selalu dari dalam `dispatch`, kecuali
//! request dibatalkan lewat `ConnectHandle`.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::{DownReason, Error};
use crate::reactor::{EventManager, TimerId};

/// Hasil akhir satu panggilan `connect`
#[derive(Debug)]
pub enum ConnectOutcome {
    Connected {
        stream: TcpStream,
        peer: SocketAddr,
        attempts: u32,
    },
    Failed {
        error: io::Error,
        attempts: u32,
    },
    TimedOut {
        attempts: u32,
    },
}

impl ConnectOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            ConnectOutcome::Connected { attempts, .. }
            | ConnectOutcome::Failed { attempts, .. }
            | ConnectOutcome::TimedOut { attempts } => *attempts,
        }
    }

    /// Alasan DOWN untuk outcome yang gagal
    pub fn down_reason(&self) -> Option<DownReason> {
        match self {
            ConnectOutcome::Connected { .. } => None,
            ConnectOutcome::TimedOut { .. } => Some(DownReason::ConnectTimeout),
            ConnectOutcome::Failed { error, .. } if error.kind() == io::ErrorKind::ConnectionRefused => {
                Some(DownReason::ConnectRefused)
            }
            ConnectOutcome::Failed { .. } => Some(DownReason::ConnectError),
        }
    }

    /// Konversi outcome gagal ke `Error`
    pub fn into_error(self) -> Option<Error> {
        match self {
            ConnectOutcome::Connected { .. } => None,
            ConnectOutcome::TimedOut { attempts } => Some(Error::ConnectTimeout { attempts }),
            ConnectOutcome::Failed { error, attempts } => {
                if error.kind() == io::ErrorKind::ConnectionRefused {
                    Some(Error::ConnectRefused { attempts })
                } else {
                    Some(Error::Io(error))
                }
            }
        }
    }
}

type DoneCallback<C> = Box<dyn FnOnce(&mut EventManager<C>, &mut C, ConnectOutcome) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Connected,
    Failed,
    TimedOut,
    Cancelled,
}

struct Request<C> {
    addr: SocketAddr,
    deadline: Instant,
    retries_left: u32,
    attempts: u32,
    phase: Phase,
    stream: Option<TcpStream>,
    fd: RawFd,
    timer: Option<TimerId>,
    on_done: Option<DoneCallback<C>>,
}

type Shared<C> = Arc<Mutex<Request<C>>>;

/// Handle ke connect yang sedang berjalan
pub struct ConnectHandle<C> {
    shared: Shared<C>,
}

impl<C: 'static> ConnectHandle<C> {
    /// Batalkan connect tanpa memanggil callback.
    ///
    /// Socket in-flight ditutup dan timer timeout dilepas. Returns `false`
    /// jika outcome sudah dilaporkan (atau sudah dibatalkan).
    pub fn cancel(&self, mgr: &mut EventManager<C>) -> bool {
        let on_done = {
            let mut req = self.shared.lock();
            if req.phase != Phase::Connecting {
                return false;
            }
            req.phase = Phase::Cancelled;
            if let Some(timer) = req.timer.take() {
                mgr.cancel_timer(timer);
            }
            if req.stream.take().is_some() {
                mgr.deregister(req.fd);
            }
            req.fd = -1;
            trace!(addr = %req.addr, attempts = req.attempts, "connect cancelled");
            req.on_done.take()
        };
        drop(on_done);
        true
    }

    pub fn is_pending(&self) -> bool {
        self.shared.lock().phase == Phase::Connecting
    }
}

enum Probe {
    Pending,
    Connected(SocketAddr),
    Failed(io::Error),
}

/// Cek hasil connect non-blocking setelah socket writable
fn probe(stream: &TcpStream) -> Probe {
    match stream.take_error() {
        Ok(Some(e)) | Err(e) => return Probe::Failed(e),
        Ok(None) => {}
    }
    match stream.peer_addr() {
        Ok(peer) => Probe::Connected(peer),
        Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Probe::Pending,
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Probe::Pending,
        Err(e) => Probe::Failed(e),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Connector {
    timeout: Duration,
    retries: u32,
}

impl Connector {
    pub fn new(timeout: Duration, retries: u32) -> Self {
        Self { timeout, retries }
    }

    /// Timeout dan jumlah retry dari `Config`
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.connect_timeout, config.connect_retry_limit)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Mulai connect ke `addr`; `on_done` dipanggil tepat sekali, kecuali
    /// connect dibatalkan lewat `ConnectHandle::cancel`.
    ///
    /// Error sinkron dari syscall connect diperlakukan sama seperti error
    /// asinkron (retry atau FAILED), dan tetap dilaporkan lewat dispatch.
    pub fn connect<C, F>(&self, mgr: &mut EventManager<C>, addr: SocketAddr, on_done: F) -> ConnectHandle<C>
    where
        C: 'static,
        F: FnOnce(&mut EventManager<C>, &mut C, ConnectOutcome) + Send + 'static,
    {
        let deadline = Instant::now() + self.timeout;
        let shared: Shared<C> = Arc::new(Mutex::new(Request {
            addr,
            deadline,
            retries_left: self.retries,
            attempts: 0,
            phase: Phase::Connecting,
            stream: None,
            fd: -1,
            timer: None,
            on_done: Some(Box::new(on_done)),
        }));

        let timer_shared = Arc::clone(&shared);
        let timer = mgr.register_timer(deadline, move |mgr, ctx| on_timeout(mgr, ctx, &timer_shared));
        shared.lock().timer = Some(timer);

        if let Some(outcome) = start_attempt(mgr, &shared) {
            // Laporkan di dispatch berikutnya, bukan di dalam connect()
            let report = Arc::clone(&shared);
            mgr.register_timer(Instant::now(), move |mgr, ctx| finish(mgr, ctx, &report, outcome));
        }
        ConnectHandle { shared }
    }
}

/// Mulai attempt baru; retry langsung jika gagal secara sinkron.
///
/// Returns outcome terminal jika semua attempt habis tanpa ada yang
/// sedang in-flight.
fn start_attempt<C: 'static>(mgr: &mut EventManager<C>, shared: &Shared<C>) -> Option<ConnectOutcome> {
    loop {
        let mut req = shared.lock();
        req.attempts += 1;
        trace!(addr = %req.addr, attempt = req.attempts, "connect attempt");

        let error = match TcpStream::connect(req.addr) {
            Ok(stream) => {
                let fd = stream.as_raw_fd();
                let cb_shared = Arc::clone(shared);
                match mgr.register_write(fd, move |mgr, ctx| on_writable(mgr, ctx, &cb_shared)) {
                    Ok(()) => {
                        req.stream = Some(stream);
                        req.fd = fd;
                        return None;
                    }
                    Err(Error::Io(e)) => e,
                    Err(e) => io::Error::new(io::ErrorKind::Other, e.to_string()),
                }
            }
            Err(e) => e,
        };

        if req.retries_left > 0 && Instant::now() < req.deadline {
            req.retries_left -= 1;
            debug!(addr = %req.addr, error = %error, "connect failed, retrying");
            continue;
        }
        return Some(ConnectOutcome::Failed {
            error,
            attempts: req.attempts,
        });
    }
}

fn on_writable<C: 'static>(mgr: &mut EventManager<C>, ctx: &mut C, shared: &Shared<C>) {
    let result = {
        let req = shared.lock();
        if req.phase != Phase::Connecting {
            return;
        }
        match req.stream.as_ref() {
            Some(stream) => probe(stream),
            None => return,
        }
    };

    match result {
        Probe::Pending => {}
        Probe::Connected(peer) => {
            let stream = {
                let mut req = shared.lock();
                mgr.deregister(req.fd);
                req.stream.take()
            };
            if let Some(stream) = stream {
                let attempts = shared.lock().attempts;
                finish(mgr, ctx, shared, ConnectOutcome::Connected { stream, peer, attempts });
            }
        }
        Probe::Failed(error) => {
            let retry = {
                let mut req = shared.lock();
                mgr.deregister(req.fd);
                req.stream = None;
                req.fd = -1;
                if req.retries_left > 0 && Instant::now() < req.deadline {
                    req.retries_left -= 1;
                    debug!(addr = %req.addr, error = %error, "connect failed, retrying");
                    true
                } else {
                    false
                }
            };

            let outcome = if retry {
                start_attempt(mgr, shared)
            } else {
                let attempts = shared.lock().attempts;
                Some(ConnectOutcome::Failed { error, attempts })
            };
            if let Some(outcome) = outcome {
                finish(mgr, ctx, shared, outcome);
            }
        }
    }
}

fn on_timeout<C: 'static>(mgr: &mut EventManager<C>, ctx: &mut C, shared: &Shared<C>) {
    let attempts = {
        let mut req = shared.lock();
        if req.phase != Phase::Connecting {
            return;
        }
        req.timer = None;
        if req.stream.is_some() {
            mgr.deregister(req.fd);
        }
        // Drop socket = batalkan connect yang masih in-flight
        req.stream = None;
        req.attempts
    };
    finish(mgr, ctx, shared, ConnectOutcome::TimedOut { attempts });
}

/// Transisi ke state terminal dan panggil callback (sekali saja)
fn finish<C: 'static>(mgr: &mut EventManager<C>, ctx: &mut C, shared: &Shared<C>, outcome: ConnectOutcome) {
    let on_done = {
        let mut req = shared.lock();
        if req.phase != Phase::Connecting {
            return;
        }
        req.phase = match outcome {
            ConnectOutcome::Connected { .. } => Phase::Connected,
            ConnectOutcome::Failed { .. } => Phase::Failed,
            ConnectOutcome::TimedOut { .. } => Phase::TimedOut,
        };
        if let Some(timer) = req.timer.take() {
            mgr.cancel_timer(timer);
        }
        req.on_done.take()
    };

    if let Some(on_done) = on_done {
        on_done(mgr, ctx, outcome);
    }
}
