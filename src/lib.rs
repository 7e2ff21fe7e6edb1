//! Tether - Event-driven multiplexed TCP channel layer
//!
//! Arsitektur:
//! - Reactor: satu `EventManager` (mio) per worker thread
//! - Zero-Copy: inbound/outbound memakai segment `Bytes` yang di-share
//! - Backpressure: high/low watermark per channel
//! - Session: satu objek aplikasi per channel, hidup dari UP sampai DOWN

pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod reactor;
pub mod session;

pub use crate::config::Config;
pub use crate::core::Blob;
pub use crate::error::{DownReason, Error, Result};
pub use crate::network::{ChannelId, ChannelObserver, ChannelPool, PoolHandle};
pub use crate::session::{Session, SessionContext, SessionFactory, SessionPool};
