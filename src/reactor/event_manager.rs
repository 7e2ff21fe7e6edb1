//! Event Manager: readiness demultiplexer di atas mio
//!
//! Satu `EventManager` = satu `mio::Poll` + satu dispatch loop, dijalankan
//! oleh tepat satu thread. Callback menerima `&mut EventManager<C>` dan
//! `&mut C` (konteks milik worker), jadi callback bisa re-register,
//! deregister, dan memasang timer tanpa shared mutability.
//!
//! Registrasi berbasis raw descriptor (`SourceFd`), satu registrasi per fd.
//! mio bersifat edge-triggered: callback wajib membaca/menulis sampai
//! `WouldBlock`.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::trace;

use super::timer::{TimerId, TimerQueue};
use crate::error::{Error, Result};

/// Callback untuk readiness I/O, dipanggil berulang selama terdaftar
pub type IoCallback<C> = Box<dyn FnMut(&mut EventManager<C>, &mut C) + Send>;

/// Callback sekali pakai untuk timer dan task lintas thread
pub type Task<C> = Box<dyn FnOnce(&mut EventManager<C>, &mut C) + Send>;

const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

struct Registration<C> {
    read: Option<IoCallback<C>>,
    write: Option<IoCallback<C>>,
    wants_read: bool,
    wants_write: bool,
    generation: u64,
}

impl<C> Registration<C> {
    fn slot(&mut self, dir: Direction) -> &mut Option<IoCallback<C>> {
        match dir {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }

    fn wants(&self, dir: Direction) -> bool {
        match dir {
            Direction::Read => self.wants_read,
            Direction::Write => self.wants_write,
        }
    }
}

fn to_interest(read: bool, write: bool) -> Option<Interest> {
    match (read, write) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

/// Cek apakah descriptor masih terbuka (F_GETFD gagal dengan EBADF jika tidak)
fn fd_is_open(fd: RawFd) -> bool {
    if fd < 0 {
        return false;
    }
    // SAFETY: F_GETFD hanya membaca flag descriptor, tidak menyentuh memori
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

fn ctl_error(fd: RawFd, e: io::Error) -> Error {
    if e.raw_os_error() == Some(libc::EBADF) {
        Error::InvalidDescriptor(fd)
    } else {
        Error::Io(e)
    }
}

struct RemoteInner<C> {
    waker: Waker,
    tasks: Mutex<Vec<Task<C>>>,
    closed: AtomicBool,
}

/// Handle lintas thread ke sebuah `EventManager`.
///
/// `post` tidak pernah mengeksekusi task di tempat; task selalu jalan di
/// thread pemilik manager pada `dispatch` berikutnya.
pub struct Remote<C> {
    inner: Arc<RemoteInner<C>>,
}

impl<C> Clone for Remote<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> Remote<C> {
    pub fn post<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut EventManager<C>, &mut C) + Send + 'static,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ManagerStopped);
        }
        self.inner.tasks.lock().push(Box::new(task));
        self.inner.waker.wake()?;
        Ok(())
    }

    /// Minta dispatch loop berhenti setelah iterasi berjalan
    pub fn stop(&self) -> Result<()> {
        self.post(|mgr, _| mgr.stop())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

pub struct EventManager<C> {
    poll: Poll,
    events: Events,
    registrations: HashMap<RawFd, Registration<C>>,
    timers: TimerQueue<Task<C>>,
    remote: Remote<C>,
    next_generation: u64,
    running: bool,
}

impl<C> EventManager<C> {
    pub fn new() -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            registrations: HashMap::new(),
            timers: TimerQueue::new(),
            remote: Remote {
                inner: Arc::new(RemoteInner {
                    waker,
                    tasks: Mutex::new(Vec::new()),
                    closed: AtomicBool::new(false),
                }),
            },
            next_generation: 0,
            running: false,
        })
    }

    pub fn remote(&self) -> Remote<C> {
        self.remote.clone()
    }

    /// Pasang (atau ganti) callback read untuk `fd`
    pub fn register_read<F>(&mut self, fd: RawFd, callback: F) -> Result<()>
    where
        F: FnMut(&mut EventManager<C>, &mut C) + Send + 'static,
    {
        self.install(fd, Direction::Read, Box::new(callback))
    }

    /// Pasang (atau ganti) callback write untuk `fd`
    pub fn register_write<F>(&mut self, fd: RawFd, callback: F) -> Result<()>
    where
        F: FnMut(&mut EventManager<C>, &mut C) + Send + 'static,
    {
        self.install(fd, Direction::Write, Box::new(callback))
    }

    pub fn clear_read(&mut self, fd: RawFd) -> Result<()> {
        self.clear(fd, Direction::Read)
    }

    pub fn clear_write(&mut self, fd: RawFd) -> Result<()> {
        self.clear(fd, Direction::Write)
    }

    /// Hapus semua interest untuk `fd`. Idempotent.
    ///
    /// Harus dipanggil sebelum descriptor ditutup.
    pub fn deregister(&mut self, fd: RawFd) {
        if self.registrations.remove(&fd).is_some() {
            // fd yang sudah ditutup otomatis keluar dari epoll set
            if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                trace!(fd, error = %e, "deregister of stale descriptor");
            }
        }
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.registrations.contains_key(&fd)
    }

    /// Interest saat ini untuk `fd` sebagai `(read, write)`
    pub fn interest(&self, fd: RawFd) -> Option<(bool, bool)> {
        self.registrations
            .get(&fd)
            .map(|r| (r.wants_read, r.wants_write))
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    pub fn register_timer<F>(&mut self, deadline: Instant, callback: F) -> TimerId
    where
        F: FnOnce(&mut EventManager<C>, &mut C) + Send + 'static,
    {
        self.timers.insert(deadline, Box::new(callback))
    }

    pub fn register_timer_after<F>(&mut self, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce(&mut EventManager<C>, &mut C) + Send + 'static,
    {
        self.register_timer(Instant::now() + delay, callback)
    }

    /// Returns `true` jika timer masih pending dan berhasil dibatalkan
    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id).is_some()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Satu putaran dispatch.
    ///
    /// Block sampai `timeout` (atau tanpa batas jika `None`, tapi tidak
    /// melewati deadline timer terdekat). Semua event dari satu syscall
    /// diproses, urut berdasarkan nilai descriptor. Returns jumlah callback
    /// yang dipanggil (task + I/O + timer), 0 jika timeout.
    pub fn dispatch(&mut self, ctx: &mut C, timeout: Option<Duration>) -> Result<usize> {
        let timeout = self.poll_timeout(timeout);

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() != io::ErrorKind::Interrupted {
                return Err(Error::MultiplexFatal(e));
            }
            self.events.clear();
        }

        let mut ready: Vec<(RawFd, bool, bool)> = Vec::new();
        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let readable = event.is_readable() || event.is_read_closed() || event.is_error();
            let writable = event.is_writable() || event.is_write_closed() || event.is_error();
            ready.push((event.token().0 as RawFd, readable, writable));
        }
        ready.sort_unstable_by_key(|&(fd, _, _)| fd);

        let mut invoked = self.run_tasks(ctx);

        for (fd, readable, writable) in ready {
            if readable && self.invoke(fd, Direction::Read, ctx) {
                invoked += 1;
            }
            if writable && self.invoke(fd, Direction::Write, ctx) {
                invoked += 1;
            }
        }

        invoked += self.fire_timers(ctx);
        Ok(invoked)
    }

    /// Jalankan dispatch loop sampai `stop()` dipanggil
    pub fn run(&mut self, ctx: &mut C) -> Result<()> {
        self.running = true;
        while self.running {
            self.dispatch(ctx, None)?;
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn install(&mut self, fd: RawFd, dir: Direction, callback: IoCallback<C>) -> Result<()> {
        if !fd_is_open(fd) {
            return Err(Error::InvalidDescriptor(fd));
        }

        let token = Token(fd as usize);
        match self.registrations.get_mut(&fd) {
            Some(reg) => {
                let read = reg.wants_read || dir == Direction::Read;
                let write = reg.wants_write || dir == Direction::Write;
                if (read, write) != (reg.wants_read, reg.wants_write) {
                    if let Some(interest) = to_interest(read, write) {
                        self.poll
                            .registry()
                            .reregister(&mut SourceFd(&fd), token, interest)
                            .map_err(|e| ctl_error(fd, e))?;
                    }
                }
                reg.wants_read = read;
                reg.wants_write = write;
                *reg.slot(dir) = Some(callback);
            }
            None => {
                let interest = match dir {
                    Direction::Read => Interest::READABLE,
                    Direction::Write => Interest::WRITABLE,
                };
                self.poll
                    .registry()
                    .register(&mut SourceFd(&fd), token, interest)
                    .map_err(|e| ctl_error(fd, e))?;

                let generation = self.next_generation;
                self.next_generation += 1;

                let mut reg = Registration {
                    read: None,
                    write: None,
                    wants_read: dir == Direction::Read,
                    wants_write: dir == Direction::Write,
                    generation,
                };
                *reg.slot(dir) = Some(callback);
                self.registrations.insert(fd, reg);
            }
        }
        Ok(())
    }

    fn clear(&mut self, fd: RawFd, dir: Direction) -> Result<()> {
        let Some(reg) = self.registrations.get_mut(&fd) else {
            return Ok(());
        };
        if !reg.wants(dir) {
            return Ok(());
        }

        let read = reg.wants_read && dir != Direction::Read;
        let write = reg.wants_write && dir != Direction::Write;
        match to_interest(read, write) {
            Some(interest) => {
                self.poll
                    .registry()
                    .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
                    .map_err(|e| ctl_error(fd, e))?;
                reg.wants_read = read;
                reg.wants_write = write;
                *reg.slot(dir) = None;
            }
            None => self.deregister(fd),
        }
        Ok(())
    }

    /// Panggil callback `dir` milik `fd`, lalu kembalikan ke slot-nya jika
    /// registrasi yang sama masih menginginkannya.
    fn invoke(&mut self, fd: RawFd, dir: Direction, ctx: &mut C) -> bool {
        let (mut callback, generation) = match self.registrations.get_mut(&fd) {
            Some(reg) => match reg.slot(dir).take() {
                Some(cb) => (cb, reg.generation),
                None => return false,
            },
            None => return false,
        };

        callback(self, ctx);

        if let Some(reg) = self.registrations.get_mut(&fd) {
            if reg.generation == generation && reg.wants(dir) && reg.slot(dir).is_none() {
                *reg.slot(dir) = Some(callback);
            }
        }
        true
    }

    fn run_tasks(&mut self, ctx: &mut C) -> usize {
        let tasks = std::mem::take(&mut *self.remote.inner.tasks.lock());
        let n = tasks.len();
        for task in tasks {
            task(self, ctx);
        }
        n
    }

    fn fire_timers(&mut self, ctx: &mut C) -> usize {
        let mut fired = 0;
        for id in self.timers.expired(Instant::now()) {
            // Bisa sudah di-cancel oleh timer sebelumnya di batch ini
            if let Some(callback) = self.timers.take(id) {
                callback(self, ctx);
                fired += 1;
            }
        }
        fired
    }

    fn poll_timeout(&mut self, requested: Option<Duration>) -> Option<Duration> {
        if !self.remote.inner.tasks.lock().is_empty() {
            return Some(Duration::ZERO);
        }
        match self.timers.next_deadline() {
            None => requested,
            Some(deadline) => {
                let until = deadline.saturating_duration_since(Instant::now());
                Some(requested.map_or(until, |t| t.min(until)))
            }
        }
    }
}

impl<C> Drop for EventManager<C> {
    fn drop(&mut self) {
        self.remote.inner.closed.store(true, Ordering::Release);
        // Task yang tertinggal tidak akan pernah jalan
        self.remote.inner.tasks.lock().clear();
    }
}
