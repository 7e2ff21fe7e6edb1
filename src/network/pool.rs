//! Channel Pool: worker thread + event manager per worker
//!
//! Setiap worker memiliki satu `EventManager<Shard>` dan satu `Shard`
//! (channel, listener, dan read arena miliknya). Semua I/O untuk satu
//! channel terjadi di thread worker pemiliknya; operasi dari thread lain
//! (`send`, `shutdown`, adopsi channel hasil accept) di-post sebagai task.
//!
//! Registry global (id -> worker + watermark) dijaga satu mutex yang hanya
//! dipegang selama insert/lookup/remove, tidak pernah selama callback.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::Deref;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::channel::{Channel, ChannelId, ChannelState, SharedWatermark, ShutdownMode, Watermark};
use super::connector::{ConnectHandle, ConnectOutcome, Connector};
use super::stream::{bind_listener, tune_stream, ByteStream};
use crate::config::Config;
use crate::core::{Blob, ReadArena};
use crate::error::{DownReason, Error, Result};
use crate::reactor::{EventManager, Remote};

/// Notifikasi perubahan state channel.
///
/// Dipanggil dari thread worker pemilik channel, tanpa lock registry.
/// Jangan drop `ChannelPool` dari dalam callback ini (join ke thread sendiri).
pub trait ChannelObserver: Send + Sync {
    fn on_channel_up(&self, pool: &PoolHandle, id: ChannelId, peer: SocketAddr);

    fn on_channel_down(&self, pool: &PoolHandle, id: ChannelId, reason: DownReason);

    fn on_data_available(&self, pool: &PoolHandle, id: ChannelId, data: Blob);

    fn on_high_watermark(&self, _pool: &PoolHandle, _id: ChannelId) {}

    fn on_low_watermark(&self, _pool: &PoolHandle, _id: ChannelId) {}

    /// Dispatch loop sebuah worker mati; semua channel-nya sudah DOWN
    fn on_manager_failed(&self, _pool: &PoolHandle, _manager: usize, _error: &Error) {}
}

struct Route {
    manager: usize,
    state: ChannelState,
    watermark: Option<SharedWatermark>,
}

struct ManagerSlot {
    remote: Remote<Shard>,
    /// Jumlah channel (termasuk yang masih connecting)
    load: AtomicUsize,
    alive: AtomicBool,
}

struct PoolShared {
    config: Config,
    observer: Arc<dyn ChannelObserver>,
    registry: Mutex<HashMap<ChannelId, Route>>,
    managers: Vec<ManagerSlot>,
    next_id: AtomicU64,
}

impl PoolShared {
    fn next_id(&self) -> ChannelId {
        ChannelId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn new_watermark(&self) -> SharedWatermark {
        Arc::new(Mutex::new(Watermark::new(
            self.config.write_high_watermark,
            self.config.write_low_watermark,
        )))
    }

    /// Pilih worker dengan channel paling sedikit (tie -> index terkecil)
    fn least_loaded(&self) -> Result<usize> {
        self.managers
            .iter()
            .enumerate()
            .filter(|(_, m)| m.alive.load(Ordering::Acquire))
            .min_by_key(|(i, m)| (m.load.load(Ordering::Acquire), *i))
            .map(|(i, _)| i)
            .ok_or(Error::ManagerStopped)
    }

    /// Assign channel baru ke worker paling ringan dan daftarkan route-nya.
    ///
    /// Pemilihan dan increment load terjadi di bawah lock registry supaya
    /// assignment berurutan tetap seimbang.
    fn assign(&self, id: ChannelId, state: ChannelState, watermark: Option<SharedWatermark>) -> Result<usize> {
        let mut registry = self.registry.lock();
        let manager = self.least_loaded()?;
        self.managers[manager].load.fetch_add(1, Ordering::AcqRel);
        registry.insert(
            id,
            Route {
                manager,
                state,
                watermark,
            },
        );
        Ok(manager)
    }

    /// Hapus route; load dikurangi hanya jika route memang ada
    fn release(&self, id: ChannelId) -> Option<Route> {
        let route = self.registry.lock().remove(&id)?;
        self.managers[route.manager].load.fetch_sub(1, Ordering::AcqRel);
        Some(route)
    }

    fn is_routed(&self, id: ChannelId) -> bool {
        self.registry.lock().contains_key(&id)
    }

    /// Keluarkan worker dari assignment. Flag di-set di bawah lock registry,
    /// jadi setelah return tidak ada route baru yang menunjuk ke worker ini.
    fn retire(&self, manager: usize) {
        let _registry = self.registry.lock();
        self.managers[manager].alive.store(false, Ordering::Release);
    }

    /// Lepas semua route yang masih menunjuk ke `manager`
    fn release_manager(&self, manager: usize) -> Vec<ChannelId> {
        let mut registry = self.registry.lock();
        let mut ids: Vec<ChannelId> = registry
            .iter()
            .filter(|(_, route)| route.manager == manager)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        for id in &ids {
            registry.remove(id);
        }
        self.managers[manager].load.fetch_sub(ids.len(), Ordering::AcqRel);
        ids
    }

    fn set_state(&self, id: ChannelId, state: ChannelState) {
        if let Some(route) = self.registry.lock().get_mut(&id) {
            route.state = state;
        }
    }

    /// Connecting -> Up. Returns `false` jika connect sudah dibatalkan.
    fn promote(&self, id: ChannelId, watermark: SharedWatermark) -> bool {
        match self.registry.lock().get_mut(&id) {
            Some(route) => {
                route.state = ChannelState::Up;
                route.watermark = Some(watermark);
                true
            }
            None => false,
        }
    }
}

/// Handle cloneable ke pool; aman dipakai dari thread mana pun,
/// termasuk dari dalam callback observer.
#[derive(Clone)]
pub struct PoolHandle {
    shared: Arc<PoolShared>,
}

impl PoolHandle {
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Buka listening socket dengan backlog dari config
    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.listen_with_backlog(addr, self.shared.config.listen_backlog)
    }

    /// Buka listening socket; koneksi yang di-accept menjadi channel UP
    /// di worker paling ringan. Returns alamat lokal yang ter-bind.
    pub fn listen_with_backlog(&self, addr: SocketAddr, backlog: u32) -> Result<SocketAddr> {
        let listener = bind_listener(addr, backlog)?;
        let local = listener.local_addr()?;
        let manager = self.shared.least_loaded()?;

        self.shared.managers[manager]
            .remote
            .post(move |mgr, shard| shard.add_listener(mgr, listener))?;

        info!(addr = %local, backlog, worker = manager, "listening");
        Ok(local)
    }

    /// Connect dengan timeout dan retry dari config
    pub fn connect(&self, addr: SocketAddr) -> Result<ChannelId> {
        self.start_connect(addr, Connector::from_config(&self.shared.config))
    }

    /// Mulai outbound connect. Id langsung dikembalikan; hasilnya datang
    /// sebagai `on_channel_up` atau `on_channel_down` dengan alasan connect.
    pub fn connect_with(&self, addr: SocketAddr, timeout: Duration, retries: u32) -> Result<ChannelId> {
        self.start_connect(addr, Connector::new(timeout, retries))
    }

    fn start_connect(&self, addr: SocketAddr, connector: Connector) -> Result<ChannelId> {
        let id = self.shared.next_id();
        let manager = self.shared.assign(id, ChannelState::Connecting, None)?;

        let posted = self.shared.managers[manager]
            .remote
            .post(move |mgr, shard| shard.begin_connect(mgr, id, addr, connector));
        if let Err(e) = posted {
            self.shared.release(id);
            return Err(e);
        }

        debug!(
            channel = %id,
            %addr,
            worker = manager,
            timeout_ms = connector.timeout().as_millis() as u64,
            retries = connector.retries(),
            "connecting"
        );
        Ok(id)
    }

    /// Queue data ke channel.
    ///
    /// Budget watermark di-reserve di thread pemanggil, jadi backpressure
    /// langsung terlihat sebagai `Error::WouldBlock`. Enqueue sebenarnya
    /// terjadi di worker pemilik channel.
    pub fn send(&self, id: ChannelId, data: Blob) -> Result<()> {
        let (manager, watermark) = {
            let registry = self.shared.registry.lock();
            let route = registry.get(&id).ok_or(Error::UnknownChannel(id))?;
            if route.state == ChannelState::Connecting {
                return Err(Error::NotReady(id));
            }
            if !route.state.accepts_writes() {
                return Err(Error::ChannelDown);
            }
            let watermark = route.watermark.clone().ok_or(Error::NotReady(id))?;
            (route.manager, watermark)
        };

        let len = data.len();
        let crossed_high = match watermark.lock().reserve(len) {
            Ok(crossed) => crossed,
            Err(Error::Backpressure) => return Err(Error::WouldBlock(id)),
            Err(e) => return Err(e),
        };

        let posted = self.shared.managers[manager]
            .remote
            .post(move |mgr, shard| shard.deliver(mgr, id, data, crossed_high));
        if let Err(e) = posted {
            watermark.lock().release(len);
            return Err(e);
        }
        Ok(())
    }

    /// Full close. No-op untuk channel yang sudah DOWN atau tidak dikenal.
    pub fn shutdown(&self, id: ChannelId) -> Result<()> {
        self.shutdown_with(id, ShutdownMode::Both)
    }

    /// Half atau full close. Untuk channel yang masih connecting hanya
    /// `ShutdownMode::Both` berlaku: connect dibatalkan dan channel DOWN
    /// dengan `LocalShutdown`.
    pub fn shutdown_with(&self, id: ChannelId, mode: ShutdownMode) -> Result<()> {
        let (manager, state) = {
            let registry = self.shared.registry.lock();
            match registry.get(&id) {
                Some(route) => (route.manager, route.state),
                None => return Ok(()),
            }
        };

        if state == ChannelState::Connecting && mode != ShutdownMode::Both {
            return Ok(());
        }

        self.shared.managers[manager]
            .remote
            .post(move |mgr, shard| shard.shutdown_channel(mgr, id, mode))
    }

    /// Tutup semua channel dan listener di semua worker.
    ///
    /// Aman dipanggil bersamaan dengan callback yang sedang berjalan:
    /// penutupan dieksekusi sebagai task di masing-masing worker.
    pub fn shutdown_all(&self) -> Result<()> {
        for (index, slot) in self.shared.managers.iter().enumerate() {
            if !slot.alive.load(Ordering::Acquire) {
                continue;
            }
            match slot.remote.post(|mgr, shard| shard.close_all(mgr, DownReason::LocalShutdown)) {
                Ok(()) | Err(Error::ManagerStopped) => {}
                Err(e) => warn!(worker = index, error = %e, "failed to post shutdown"),
            }
        }
        Ok(())
    }

    /// Jumlah channel yang sudah UP (belum DOWN)
    pub fn channel_count(&self) -> usize {
        self.shared
            .registry
            .lock()
            .values()
            .filter(|r| r.state != ChannelState::Connecting)
            .count()
    }

    /// Jumlah channel per worker, urut berdasarkan index worker
    pub fn manager_loads(&self) -> Vec<usize> {
        self.shared
            .managers
            .iter()
            .map(|m| m.load.load(Ordering::Acquire))
            .collect()
    }

    /// Worker yang masih hidup
    pub fn live_managers(&self) -> usize {
        self.shared
            .managers
            .iter()
            .filter(|m| m.alive.load(Ordering::Acquire))
            .count()
    }

    /// State channel menurut registry; `None` jika sudah CLOSED atau tidak dikenal
    pub fn state(&self, id: ChannelId) -> Option<ChannelState> {
        self.shared.registry.lock().get(&id).map(|r| r.state)
    }
}

/// Pool utama. Drop = tutup semua channel, stop semua worker, join thread.
pub struct ChannelPool {
    handle: PoolHandle,
    threads: Vec<JoinHandle<()>>,
}

impl ChannelPool {
    pub fn new(config: Config, observer: Arc<dyn ChannelObserver>) -> Result<Self> {
        config.validate()?;

        let mut managers = Vec::with_capacity(config.worker_thread_count);
        for _ in 0..config.worker_thread_count {
            managers.push(EventManager::<Shard>::new()?);
        }

        let shared = Arc::new(PoolShared {
            managers: managers
                .iter()
                .map(|m| ManagerSlot {
                    remote: m.remote(),
                    load: AtomicUsize::new(0),
                    alive: AtomicBool::new(true),
                })
                .collect(),
            config,
            observer,
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });
        let handle = PoolHandle { shared };

        let mut threads = Vec::with_capacity(managers.len());
        for (index, mgr) in managers.into_iter().enumerate() {
            let shard = Shard::new(index, handle.clone());
            let thread = thread::Builder::new()
                .name(format!("tether-worker-{}", index))
                .spawn(move || worker_main(mgr, shard))?;
            threads.push(thread);
        }

        info!(workers = threads.len(), "channel pool started");
        Ok(Self { handle, threads })
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }
}

impl Deref for ChannelPool {
    type Target = PoolHandle;

    fn deref(&self) -> &PoolHandle {
        &self.handle
    }
}

impl Drop for ChannelPool {
    fn drop(&mut self) {
        let _ = self.handle.shutdown_all();
        for slot in &self.handle.shared.managers {
            let _ = slot.remote.stop();
        }
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("worker thread panicked");
            }
        }
        debug!("channel pool stopped");
    }
}

fn worker_main(mut mgr: EventManager<Shard>, mut shard: Shard) {
    debug!(worker = shard.index, "event manager running");
    match mgr.run(&mut shard) {
        Ok(()) => shard.drain(&mut mgr, DownReason::LocalShutdown),
        Err(e) => fail_manager(&mut mgr, &mut shard, e),
    }
    debug!(worker = shard.index, "event manager exited");
}

/// Multiplexer gagal: semua channel DOWN, worker dikeluarkan dari rotasi
fn fail_manager(mgr: &mut EventManager<Shard>, shard: &mut Shard, e: Error) {
    error!(worker = shard.index, error = %e, "dispatch loop failed");
    shard.drain(mgr, DownReason::MultiplexFatal);
    mgr.stop();

    shard
        .observer()
        .on_manager_failed(&shard.pool, shard.index, &e);
}

/// State milik satu worker thread
pub(crate) struct Shard {
    index: usize,
    channels: HashMap<ChannelId, Channel<TcpStream>>,
    /// Outbound connect yang belum punya outcome
    connecting: HashMap<ChannelId, ConnectHandle<Shard>>,
    listeners: HashMap<RawFd, TcpListener>,
    arena: ReadArena,
    pool: PoolHandle,
}

impl Shard {
    fn new(index: usize, pool: PoolHandle) -> Self {
        Self {
            index,
            channels: HashMap::new(),
            connecting: HashMap::new(),
            listeners: HashMap::new(),
            arena: ReadArena::new(pool.shared.config.read_buffer_segment_size),
            pool,
        }
    }

    fn observer(&self) -> Arc<dyn ChannelObserver> {
        Arc::clone(&self.pool.shared.observer)
    }

    fn add_listener(&mut self, mgr: &mut EventManager<Shard>, listener: TcpListener) {
        let fd = listener.as_raw_fd();
        if let Err(e) = mgr.register_read(fd, move |mgr, shard: &mut Shard| shard.accept_ready(mgr, fd)) {
            error!(worker = self.index, error = %e, "failed to register listener");
            return;
        }
        self.listeners.insert(fd, listener);
    }

    fn accept_ready(&mut self, mgr: &mut EventManager<Shard>, fd: RawFd) {
        loop {
            let Some(listener) = self.listeners.get(&fd) else {
                return;
            };
            match listener.accept() {
                Ok((stream, peer)) => self.dispatch_accepted(mgr, stream, peer),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Mis. EMFILE; coba lagi di readiness berikutnya
                    warn!(worker = self.index, error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Kirim koneksi hasil accept ke worker paling ringan
    fn dispatch_accepted(&mut self, mgr: &mut EventManager<Shard>, stream: TcpStream, peer: SocketAddr) {
        let shared = Arc::clone(&self.pool.shared);
        let id = shared.next_id();
        let watermark = shared.new_watermark();

        let target = match shared.assign(id, ChannelState::Up, Some(Arc::clone(&watermark))) {
            Ok(target) => target,
            Err(e) => {
                warn!(%peer, error = %e, "no live worker for accepted connection");
                return;
            }
        };

        if target == self.index {
            self.adopt(mgr, id, stream, peer, watermark);
            return;
        }

        let posted = shared.managers[target]
            .remote
            .post(move |mgr, shard| shard.adopt(mgr, id, stream, peer, watermark));
        if let Err(e) = posted {
            warn!(channel = %id, worker = target, error = %e, "worker gone, dropping connection");
            shared.release(id);
        }
    }

    /// Daftarkan stream yang sudah connected sebagai channel UP di worker ini
    fn adopt(
        &mut self,
        mgr: &mut EventManager<Shard>,
        id: ChannelId,
        stream: TcpStream,
        peer: SocketAddr,
        watermark: SharedWatermark,
    ) {
        if !self.pool.shared.is_routed(id) {
            // Route sudah dilepas (dan DOWN sudah dilaporkan) sebelum task ini jalan
            debug!(channel = %id, %peer, "dropping stream for released channel");
            return;
        }
        tune_stream(&stream);
        let fd = stream.as_raw_fd();

        if let Err(e) = mgr.register_read(fd, move |mgr, shard: &mut Shard| shard.on_readable(mgr, id)) {
            warn!(channel = %id, error = %e, "failed to register channel");
            if self.pool.shared.release(id).is_some() {
                self.observer()
                    .on_channel_down(&self.pool, id, DownReason::ReadError);
            }
            return;
        }

        self.channels
            .insert(id, Channel::new(id, stream, peer, watermark));
        debug!(channel = %id, %peer, worker = self.index, "channel up");
        self.observer().on_channel_up(&self.pool, id, peer);
    }

    fn begin_connect(&mut self, mgr: &mut EventManager<Shard>, id: ChannelId, addr: SocketAddr, connector: Connector) {
        if !self.pool.shared.is_routed(id) {
            return;
        }
        let handle = connector.connect(mgr, addr, move |mgr, shard: &mut Shard, outcome| {
            shard.on_connect_outcome(mgr, id, addr, outcome)
        });
        self.connecting.insert(id, handle);
    }

    fn on_connect_outcome(&mut self, mgr: &mut EventManager<Shard>, id: ChannelId, addr: SocketAddr, outcome: ConnectOutcome) {
        self.connecting.remove(&id);
        match outcome {
            ConnectOutcome::Connected { stream, peer, attempts } => {
                let watermark = self.pool.shared.new_watermark();
                if !self.pool.shared.promote(id, Arc::clone(&watermark)) {
                    debug!(channel = %id, %peer, "connect completed for released channel");
                    return;
                }
                debug!(channel = %id, %peer, attempts, "connected");
                self.adopt(mgr, id, stream, peer, watermark);
            }
            failed => {
                let reason = failed.down_reason().unwrap_or(DownReason::ConnectError);
                let attempts = failed.attempts();
                if let Some(e) = failed.into_error() {
                    warn!(channel = %id, %addr, attempts, error = %e, "connect failed");
                }
                if self.pool.shared.release(id).is_some() {
                    self.observer().on_channel_down(&self.pool, id, reason);
                }
            }
        }
    }

    /// Batalkan connect yang belum selesai, lepas route, lalu DOWN
    fn cancel_connect(&mut self, mgr: &mut EventManager<Shard>, id: ChannelId, reason: DownReason) {
        if let Some(handle) = self.connecting.remove(&id) {
            handle.cancel(mgr);
        }
        if self.pool.shared.release(id).is_some() {
            debug!(channel = %id, %reason, "connect cancelled");
            self.observer().on_channel_down(&self.pool, id, reason);
        }
    }

    fn on_readable(&mut self, mgr: &mut EventManager<Shard>, id: ChannelId) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        let outcome = channel.read_available(&mut self.arena);

        if !outcome.data.is_empty() {
            self.observer()
                .on_data_available(&self.pool, id, outcome.data);
        }
        if let Some(reason) = outcome.down {
            self.close_channel(mgr, id, reason);
        }
    }

    /// Enqueue data yang sudah di-reserve oleh `PoolHandle::send`
    fn deliver(&mut self, mgr: &mut EventManager<Shard>, id: ChannelId, data: Blob, crossed_high: bool) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        let len = data.len();
        if let Err(e) = channel.enqueue_reserved(data) {
            debug!(channel = %id, len, error = %e, "dropping send to write-disabled channel");
            return;
        }
        if crossed_high {
            self.observer().on_high_watermark(&self.pool, id);
        }
        self.pump(mgr, id);
    }

    /// Flush outbound queue dan sesuaikan write interest
    fn pump(&mut self, mgr: &mut EventManager<Shard>, id: ChannelId) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        let fd = channel.stream().raw_fd();
        let out = channel.flush();

        if let Some(reason) = out.down {
            self.close_channel(mgr, id, reason);
            return;
        }

        let has_write = mgr.interest(fd).map_or(false, |(_, write)| write);
        if !out.drained && !has_write {
            if let Err(e) = mgr.register_write(fd, move |mgr, shard: &mut Shard| shard.pump(mgr, id)) {
                warn!(channel = %id, error = %e, "failed to arm write interest");
                self.close_channel(mgr, id, DownReason::WriteError);
                return;
            }
        } else if out.drained && has_write {
            if let Err(e) = mgr.clear_write(fd) {
                debug!(channel = %id, error = %e, "failed to clear write interest");
            }
        }

        if out.low_watermark {
            self.observer().on_low_watermark(&self.pool, id);
        }
    }

    fn shutdown_channel(&mut self, mgr: &mut EventManager<Shard>, id: ChannelId, mode: ShutdownMode) {
        let Some(channel) = self.channels.get_mut(&id) else {
            if mode == ShutdownMode::Both {
                self.cancel_connect(mgr, id, DownReason::LocalShutdown);
            }
            return;
        };
        let fd = channel.stream().raw_fd();

        if let Some(reason) = channel.shutdown(mode) {
            self.close_channel(mgr, id, reason);
            return;
        }

        let state = channel.state();
        let (read, write) = channel.wanted_interest();
        if !read {
            if let Err(e) = mgr.clear_read(fd) {
                debug!(channel = %id, error = %e, "failed to clear read interest");
            }
        }
        if !write {
            if let Err(e) = mgr.clear_write(fd) {
                debug!(channel = %id, error = %e, "failed to clear write interest");
            }
        }
        self.pool.shared.set_state(id, state);
        debug!(channel = %id, ?state, "half-closed");
    }

    /// DOWN -> deregister -> CLOSED -> notifikasi. Tepat sekali per channel.
    fn close_channel(&mut self, mgr: &mut EventManager<Shard>, id: ChannelId, reason: DownReason) {
        let Some(mut channel) = self.channels.remove(&id) else {
            return;
        };
        channel.fail(reason);
        mgr.deregister(channel.stream().raw_fd());
        self.pool.shared.release(id);
        channel.close();

        debug!(
            channel = %id,
            %reason,
            read = channel.bytes_read(),
            written = channel.bytes_written(),
            "channel closed"
        );
        drop(channel);

        self.observer().on_channel_down(&self.pool, id, reason);
    }

    fn close_all(&mut self, mgr: &mut EventManager<Shard>, reason: DownReason) {
        for (fd, listener) in self.listeners.drain() {
            mgr.deregister(fd);
            drop(listener);
        }

        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in ids {
            self.close_channel(mgr, id, reason);
        }

        let pending: Vec<ChannelId> = self.connecting.keys().copied().collect();
        for id in pending {
            self.cancel_connect(mgr, id, reason);
        }
    }

    /// Worker berhenti: tutup semuanya, termasuk route yang task-nya
    /// (connect, adopt) masih antri dan tidak akan pernah jalan.
    fn drain(&mut self, mgr: &mut EventManager<Shard>, reason: DownReason) {
        let shared = Arc::clone(&self.pool.shared);
        shared.retire(self.index);
        self.close_all(mgr, reason);

        let orphans = shared.release_manager(self.index);
        if !orphans.is_empty() {
            debug!(worker = self.index, count = orphans.len(), %reason, "releasing queued channels");
        }
        let observer = self.observer();
        for id in orphans {
            observer.on_channel_down(&self.pool, id, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::stream::tests::saturated_listener;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;
    use std::sync::mpsc;
    use std::time::Instant;

    #[derive(Debug, PartialEq)]
    enum Event {
        Up(ChannelId),
        Down(ChannelId, DownReason),
        Data(ChannelId, Vec<u8>),
        Failed(usize),
    }

    struct Recorder {
        tx: Mutex<mpsc::Sender<Event>>,
    }

    impl ChannelObserver for Recorder {
        fn on_channel_up(&self, _pool: &PoolHandle, id: ChannelId, _peer: SocketAddr) {
            let _ = self.tx.lock().send(Event::Up(id));
        }

        fn on_channel_down(&self, _pool: &PoolHandle, id: ChannelId, reason: DownReason) {
            let _ = self.tx.lock().send(Event::Down(id, reason));
        }

        fn on_data_available(&self, _pool: &PoolHandle, id: ChannelId, data: Blob) {
            let _ = self.tx.lock().send(Event::Data(id, data.to_vec()));
        }

        fn on_manager_failed(&self, _pool: &PoolHandle, manager: usize, _error: &Error) {
            let _ = self.tx.lock().send(Event::Failed(manager));
        }
    }

    fn pool(workers: usize) -> (ChannelPool, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        let config = Config {
            worker_thread_count: workers,
            ..Config::default()
        };
        let pool = ChannelPool::new(config, Arc::new(Recorder { tx: Mutex::new(tx) })).unwrap();
        (pool, rx)
    }

    fn next(rx: &mpsc::Receiver<Event>) -> Event {
        rx.recv_timeout(Duration::from_secs(5)).expect("no event")
    }

    #[test]
    fn test_rejects_invalid_config() {
        let (tx, _rx) = mpsc::channel();
        let config = Config {
            worker_thread_count: 0,
            ..Config::default()
        };
        let result = ChannelPool::new(config, Arc::new(Recorder { tx: Mutex::new(tx) }));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_accept_read_and_peer_close() {
        let (pool, rx) = pool(1);
        let addr = pool.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        let mut client = StdTcpStream::connect(addr).unwrap();
        let Event::Up(id) = next(&rx) else {
            panic!("expected channel up");
        };
        assert_eq!(pool.state(id), Some(ChannelState::Up));

        client.write_all(b"hello").unwrap();
        assert_eq!(next(&rx), Event::Data(id, b"hello".to_vec()));

        drop(client);
        assert_eq!(next(&rx), Event::Down(id, DownReason::PeerClosed));
        assert_eq!(pool.state(id), None);
        assert_eq!(pool.channel_count(), 0);
    }

    #[test]
    fn test_send_reaches_peer() {
        let (pool, rx) = pool(2);
        let addr = pool.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        let mut client = StdTcpStream::connect(addr).unwrap();
        let Event::Up(id) = next(&rx) else {
            panic!("expected channel up");
        };

        pool.send(id, Blob::from(b"pong".as_slice())).unwrap();
        let mut buf = [0u8; 4];
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn test_shutdown_twice_single_down() {
        let (pool, rx) = pool(1);
        let addr = pool.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        let _client = StdTcpStream::connect(addr).unwrap();
        let Event::Up(id) = next(&rx) else {
            panic!("expected channel up");
        };

        pool.shutdown(id).unwrap();
        pool.shutdown(id).unwrap();
        assert_eq!(next(&rx), Event::Down(id, DownReason::LocalShutdown));
        // Shutdown ketiga setelah DOWN: no-op
        pool.shutdown(id).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(matches!(pool.send(id, Blob::new()), Err(Error::UnknownChannel(_))));
    }

    #[test]
    fn test_send_after_write_shutdown_never_reaches_peer() {
        let (pool, rx) = pool(1);
        let addr = pool.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        let mut client = StdTcpStream::connect(addr).unwrap();
        let Event::Up(id) = next(&rx) else {
            panic!("expected channel up");
        };

        // Registry bisa masih UP saat send; worker tetap menolak enqueue
        pool.shutdown_with(id, ShutdownMode::Write).unwrap();
        match pool.send(id, Blob::from(b"late".as_slice())) {
            Ok(()) | Err(Error::ChannelDown) => {}
            other => panic!("unexpected {:?}", other),
        }

        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_connect_refused_reports_down() {
        let (pool, rx) = pool(1);
        let addr = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };

        let id = pool.connect_with(addr, Duration::from_secs(1), 1).unwrap();
        assert_eq!(next(&rx), Event::Down(id, DownReason::ConnectRefused));
        assert_eq!(pool.manager_loads(), vec![0]);
    }

    #[test]
    fn test_send_while_connecting_is_not_ready() {
        let (pool, _rx) = pool(1);
        let listener = saturated_listener();
        let id = pool
            .connect_with(listener.addr, Duration::from_secs(5), 0)
            .unwrap();
        match pool.send(id, Blob::from(vec![1u8])) {
            Err(Error::NotReady(got)) => assert_eq!(got, id),
            other => panic!("expected NotReady, got {:?}", other.err()),
        }
        assert_eq!(pool.state(id), Some(ChannelState::Connecting));
        assert_eq!(pool.channel_count(), 0);
    }

    #[test]
    fn test_shutdown_cancels_pending_connect() {
        let (pool, rx) = pool(1);
        let listener = saturated_listener();
        let id = pool
            .connect_with(listener.addr, Duration::from_secs(3), 0)
            .unwrap();

        // Half-close belum berlaku untuk channel yang masih connecting
        pool.shutdown_with(id, ShutdownMode::Write).unwrap();
        assert_eq!(pool.state(id), Some(ChannelState::Connecting));

        let start = Instant::now();
        pool.shutdown(id).unwrap();
        assert_eq!(next(&rx), Event::Down(id, DownReason::LocalShutdown));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(pool.state(id), None);
        assert_eq!(pool.manager_loads(), vec![0]);

        // Timeout connect terlewati: tidak ada notifikasi kedua
        assert!(rx.recv_timeout(Duration::from_millis(3500)).is_err());
    }

    #[test]
    fn test_shutdown_all_cancels_pending_connect() {
        let (pool, rx) = pool(2);
        let listener = saturated_listener();
        let id = pool
            .connect_with(listener.addr, Duration::from_secs(3), 0)
            .unwrap();
        // Connect task sudah jalan di worker
        std::thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        pool.shutdown_all().unwrap();
        assert_eq!(next(&rx), Event::Down(id, DownReason::LocalShutdown));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(pool.state(id), None);
        assert_eq!(pool.manager_loads(), vec![0, 0]);
        assert!(rx.recv_timeout(Duration::from_millis(3500)).is_err());
    }

    #[test]
    fn test_manager_failure_downs_pending_connect() {
        let (pool, rx) = pool(1);
        let listener = saturated_listener();
        let id = pool
            .connect_with(listener.addr, Duration::from_secs(1), 0)
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));

        pool.shared.managers[0]
            .remote
            .post(|mgr, shard| {
                let e = Error::MultiplexFatal(std::io::Error::from_raw_os_error(libc::EBADF));
                fail_manager(mgr, shard, e);
            })
            .unwrap();

        assert_eq!(next(&rx), Event::Down(id, DownReason::MultiplexFatal));
        assert_eq!(next(&rx), Event::Failed(0));
        assert_eq!(pool.state(id), None);
        assert_eq!(pool.manager_loads(), vec![0]);

        // Lewat timeout 1s: connect sudah dibatalkan, tidak ada DOWN kedua
        assert!(rx.recv_timeout(Duration::from_millis(1500)).is_err());
    }

    #[test]
    fn test_manager_failure_downs_queued_routes() {
        let (pool, rx) = pool(1);
        let listener = saturated_listener();

        // Gagal dulu, lalu connect diantrikan di belakangnya dalam batch yang sama
        let addr = listener.addr;
        let shared = Arc::clone(&pool.shared);
        let (id_tx, id_rx) = mpsc::channel();
        pool.shared.managers[0]
            .remote
            .post(move |mgr, shard| {
                let handle = PoolHandle { shared };
                let id = handle
                    .connect_with(addr, Duration::from_secs(1), 0)
                    .unwrap();
                id_tx.send(id).unwrap();
                let e = Error::MultiplexFatal(std::io::Error::from_raw_os_error(libc::EBADF));
                fail_manager(mgr, shard, e);
            })
            .unwrap();

        let id = id_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(next(&rx), Event::Down(id, DownReason::MultiplexFatal));
        assert_eq!(next(&rx), Event::Failed(0));
        assert_eq!(pool.state(id), None);
        assert_eq!(pool.manager_loads(), vec![0]);
        assert!(rx.recv_timeout(Duration::from_millis(1500)).is_err());
    }

    #[test]
    fn test_manager_failure_downs_all_channels() {
        let (pool, rx) = pool(1);
        let addr = pool.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        let _a = StdTcpStream::connect(addr).unwrap();
        let _b = StdTcpStream::connect(addr).unwrap();
        let mut ups = Vec::new();
        for _ in 0..2 {
            match next(&rx) {
                Event::Up(id) => ups.push(id),
                other => panic!("unexpected {:?}", other),
            }
        }

        pool.shared.managers[0]
            .remote
            .post(|mgr, shard| {
                let e = Error::MultiplexFatal(std::io::Error::from_raw_os_error(libc::EBADF));
                fail_manager(mgr, shard, e);
            })
            .unwrap();

        let mut downs = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(Event::Down(id, DownReason::MultiplexFatal)) => downs.push(id),
                Ok(Event::Failed(0)) => break,
                Ok(other) => panic!("unexpected {:?}", other),
                Err(_) => {}
            }
        }
        downs.sort();
        assert_eq!(downs, ups);
        assert_eq!(pool.live_managers(), 0);
        assert!(matches!(
            pool.connect("127.0.0.1:9".parse().unwrap()),
            Err(Error::ManagerStopped)
        ));
    }
}
