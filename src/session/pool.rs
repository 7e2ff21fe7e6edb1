use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use super::{Session, SessionContext, SessionFactory};
use crate::core::Blob;
use crate::error::{DownReason, Error};
use crate::network::{ChannelId, ChannelObserver, PoolHandle};

/// State session per channel id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Tidak ada session untuk id ini
    None,
    /// Factory sedang membuat session
    Allocating,
    Up,
    /// `on_shutdown` sedang berjalan; session segera di-drop
    Down,
}

struct Slot {
    state: SessionState,
    ctx: SessionContext,
    session: Option<Box<dyn Session>>,
}

/// Observer yang memetakan setiap channel ke satu `Session`.
///
/// Map dijaga mutex yang hanya dipegang untuk insert/lookup/remove.
/// Callback session berjalan di bawah lock slot-nya sendiri, jadi satu
/// session tidak pernah dipanggil bersamaan.
pub struct SessionPool<F> {
    factory: F,
    sessions: Mutex<HashMap<ChannelId, Arc<Mutex<Slot>>>>,
}

impl<F: SessionFactory> SessionPool<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Jumlah session hidup (ALLOCATING atau UP)
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn state(&self, id: ChannelId) -> SessionState {
        let slot = self.sessions.lock().get(&id).cloned();
        match slot {
            Some(slot) => slot.lock().state,
            None => SessionState::None,
        }
    }

    fn slot(&self, id: ChannelId) -> Option<Arc<Mutex<Slot>>> {
        self.sessions.lock().get(&id).cloned()
    }

    fn with_session(&self, id: ChannelId, f: impl FnOnce(&mut Box<dyn Session>, &SessionContext)) {
        let Some(slot) = self.slot(id) else {
            trace!(channel = %id, "no session for channel");
            return;
        };
        let mut guard = slot.lock();
        let slot = &mut *guard;
        if slot.state != SessionState::Up {
            return;
        }
        if let Some(session) = slot.session.as_mut() {
            f(session, &slot.ctx);
        }
    }
}

impl<F: SessionFactory> ChannelObserver for SessionPool<F> {
    fn on_channel_up(&self, pool: &PoolHandle, id: ChannelId, peer: SocketAddr) {
        let ctx = SessionContext::new(id, peer, pool.clone());
        let slot = Arc::new(Mutex::new(Slot {
            state: SessionState::Allocating,
            ctx: ctx.clone(),
            session: None,
        }));
        self.sessions.lock().insert(id, Arc::clone(&slot));

        // Factory dipanggil tanpa lock map maupun slot
        let session = self.factory.create(&ctx);

        let mut slot = slot.lock();
        slot.session = Some(session);
        slot.state = SessionState::Up;
        debug!(channel = %id, %peer, "session up");
    }

    fn on_channel_down(&self, _pool: &PoolHandle, id: ChannelId, reason: DownReason) {
        let Some(slot) = self.sessions.lock().remove(&id) else {
            return;
        };
        let mut guard = slot.lock();
        let slot = &mut *guard;
        slot.state = SessionState::Down;

        if let Some(mut session) = slot.session.take() {
            session.on_shutdown(&slot.ctx, reason);
            drop(session);
        }
        debug!(channel = %id, %reason, "session down");
    }

    fn on_data_available(&self, _pool: &PoolHandle, id: ChannelId, data: Blob) {
        self.with_session(id, |session, ctx| session.on_message(ctx, data));
    }

    fn on_high_watermark(&self, _pool: &PoolHandle, id: ChannelId) {
        self.with_session(id, |session, ctx| session.on_high_watermark(ctx));
    }

    fn on_low_watermark(&self, _pool: &PoolHandle, id: ChannelId) {
        self.with_session(id, |session, ctx| session.on_low_watermark(ctx));
    }

    fn on_manager_failed(&self, _pool: &PoolHandle, manager: usize, error: &Error) {
        error!(worker = manager, %error, "worker lost, its sessions were shut down");
    }
}
