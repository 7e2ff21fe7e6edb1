//! Error taxonomy untuk channel, connector dan event manager.
//!
//! `Error` dipakai oleh semua operasi publik; `DownReason` adalah alasan
//! yang dibawa oleh notifikasi `on_channel_down`.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

use crate::network::ChannelId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Descriptor sudah ditutup (atau tidak pernah valid)
    #[error("invalid descriptor {0}")]
    InvalidDescriptor(RawFd),

    #[error("connect timed out after {attempts} attempt(s)")]
    ConnectTimeout { attempts: u32 },

    #[error("connection refused after {attempts} attempt(s)")]
    ConnectRefused { attempts: u32 },

    /// High-watermark terlampaui, tunggu `on_low_watermark`
    #[error("outbound queue above high watermark")]
    Backpressure,

    /// Pool-level form of `Backpressure`
    #[error("send would block on channel {0}")]
    WouldBlock(ChannelId),

    /// Syscall multiplexing (epoll/kqueue) sendiri yang gagal
    #[error("multiplexer failed: {0}")]
    MultiplexFatal(#[source] io::Error),

    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("channel no longer accepts writes")]
    ChannelDown,

    /// Outbound connect untuk channel ini belum selesai
    #[error("channel {0} is still connecting")]
    NotReady(ChannelId),

    #[error("event manager stopped")]
    ManagerStopped,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Apakah error ini bisa dicoba lagi tanpa intervensi pemilik.
    ///
    /// Read/write error pada channel tidak pernah dikembalikan sebagai
    /// `Error`; channel langsung DOWN dengan `DownReason::ReadError` atau
    /// `DownReason::WriteError`.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Backpressure | Error::WouldBlock(_))
    }
}

/// Alasan sebuah channel masuk ke state DOWN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownReason {
    /// Peer menutup koneksi (read 0 byte)
    PeerClosed,
    ReadError,
    WriteError,
    /// Shutdown diminta secara eksplisit oleh owner atau session
    LocalShutdown,
    ConnectTimeout,
    ConnectRefused,
    /// Connect gagal dengan error selain refused/timeout
    ConnectError,
    /// Event manager pemilik channel mati
    MultiplexFatal,
}

impl DownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownReason::PeerClosed => "PEER_CLOSED",
            DownReason::ReadError => "READ_ERROR",
            DownReason::WriteError => "WRITE_ERROR",
            DownReason::LocalShutdown => "LOCAL_SHUTDOWN",
            DownReason::ConnectTimeout => "CONNECT_TIMEOUT",
            DownReason::ConnectRefused => "CONNECT_REFUSED",
            DownReason::ConnectError => "CONNECT_ERROR",
            DownReason::MultiplexFatal => "MULTIPLEX_FATAL",
        }
    }
}

impl fmt::Display for DownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
