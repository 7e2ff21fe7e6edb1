//! Socket capability interface
//!
//! `Channel` dan `Connector` hanya butuh read/write/shutdown/peer address/
//! error probe dari socket. Backend dipilih saat konstruksi lewat parameter
//! generic; saat ini backend-nya adalah `mio::net::TcpStream`.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockRef, Socket, Type};

pub trait ByteStream: Read + Write + Send {
    fn shutdown(&mut self, how: Shutdown) -> io::Result<()>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Ambil (dan clear) `SO_ERROR`
    fn take_error(&self) -> io::Result<Option<io::Error>>;

    /// Descriptor untuk registrasi di event manager
    fn raw_fd(&self) -> RawFd;
}

impl ByteStream for mio::net::TcpStream {
    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        mio::net::TcpStream::shutdown(self, how)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        mio::net::TcpStream::peer_addr(self)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        mio::net::TcpStream::take_error(self)
    }

    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }
}

/// Listening socket non-blocking dengan backlog eksplisit.
///
/// `std::net::TcpListener::bind` selalu memakai backlog 128, jadi socket
/// dibangun manual lewat socket2.
pub(crate) fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<mio::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    Ok(mio::net::TcpListener::from_std(socket.into()))
}

/// Socket options untuk channel baru: TCP_NODELAY + buffer kernel 256KB.
///
/// Error diabaikan - tidak semua platform mendukung semua opsi.
pub(crate) fn tune_stream(stream: &mio::net::TcpStream) {
    let _ = stream.set_nodelay(true);

    let sock = SockRef::from(stream);
    let _ = sock.set_send_buffer_size(256 * 1024);
    let _ = sock.set_recv_buffer_size(256 * 1024);
}
