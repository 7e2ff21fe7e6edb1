//! Session Layer: satu objek session per channel
//!
//! `SessionPool` adalah `ChannelObserver` yang membuat session lewat
//! factory saat channel UP, meneruskan data dan notifikasi watermark ke
//! session tersebut, lalu membuangnya saat channel DOWN.

mod pool;

use std::net::SocketAddr;

use crate::core::Blob;
use crate::error::{DownReason, Result};
use crate::network::{ChannelId, PoolHandle, ShutdownMode};

pub use pool::{SessionPool, SessionState};

/// Handle yang diberikan ke session: identitas channel + akses ke pool
#[derive(Clone)]
pub struct SessionContext {
    id: ChannelId,
    peer: SocketAddr,
    pool: PoolHandle,
}

impl SessionContext {
    pub(crate) fn new(id: ChannelId, peer: SocketAddr, pool: PoolHandle) -> Self {
        Self { id, peer, pool }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Kirim data ke peer channel ini.
    ///
    /// `Error::WouldBlock` berarti high-watermark terlampaui; tunggu
    /// `Session::on_low_watermark` sebelum mengirim lagi.
    pub fn send(&self, data: impl Into<Blob>) -> Result<()> {
        self.pool.send(self.id, data.into())
    }

    /// Tutup channel; `on_shutdown` menyusul dengan `LocalShutdown`
    pub fn close(&self) -> Result<()> {
        self.pool.shutdown(self.id)
    }

    pub fn close_write(&self) -> Result<()> {
        self.pool.shutdown_with(self.id, ShutdownMode::Write)
    }

    pub fn pool(&self) -> &PoolHandle {
        &self.pool
    }
}

/// Logika aplikasi untuk satu channel.
///
/// Semua callback untuk satu session dipanggil berurutan, tidak pernah
/// bersamaan.
pub trait Session: Send {
    fn on_message(&mut self, ctx: &SessionContext, data: Blob);

    fn on_high_watermark(&mut self, _ctx: &SessionContext) {}

    fn on_low_watermark(&mut self, _ctx: &SessionContext) {}

    /// Callback terakhir sebelum session di-drop
    fn on_shutdown(&mut self, _ctx: &SessionContext, _reason: DownReason) {}
}

/// Pembuat session baru untuk setiap channel yang UP
pub trait SessionFactory: Send + Sync {
    fn create(&self, ctx: &SessionContext) -> Box<dyn Session>;
}

impl<F> SessionFactory for F
where
    F: Fn(&SessionContext) -> Box<dyn Session> + Send + Sync,
{
    fn create(&self, ctx: &SessionContext) -> Box<dyn Session> {
        self(ctx)
    }
}
