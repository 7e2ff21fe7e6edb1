//! Network Layer: channel, connector dan channel pool
//!
//! Menggunakan mio (epoll/kqueue) lewat `reactor::EventManager`.
//!
//! Fitur:
//! - Non-blocking read/write dengan vectored write
//! - Backpressure high/low watermark per channel
//! - Outbound connect dengan timeout + retry
//! - Pool worker thread dengan assignment least-loaded
//!
//! Note: untuk server siap pakai, lihat src/bin/tether_echo.rs

mod channel;
mod connector;
mod pool;
mod stream;

pub use channel::{
    Channel, ChannelId, ChannelState, FlushOutcome, ReadOutcome, SharedWatermark, ShutdownMode,
    Watermark,
};
pub use connector::{ConnectHandle, ConnectOutcome, Connector};
pub use pool::{ChannelObserver, ChannelPool, PoolHandle};
pub use stream::ByteStream;
