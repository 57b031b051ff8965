//! Non-blocking TCP: outbound connects, the listener, and byte channels.

use crate::transport::{ByteChannel, TransportError, TransportResult, TransportStats, is_would_block};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use tracing::{debug, trace};

/// An outbound connect in progress.
pub struct TcpConnector {
    socket: Socket,
    remote: SocketAddr,
}

impl TcpConnector {
    /// Begin a non-blocking connect to `remote`.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or the connect is
    /// refused synchronously.
    pub fn start(remote: SocketAddr) -> TransportResult<Self> {
        let socket = Socket::new(Domain::for_address(remote), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_tcp_nodelay(true)?;

        match socket.connect(&remote.into()) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => {}
            Err(e) => return Err(TransportError::ConnectionFailed(format!("{remote}: {e}"))),
        }
        trace!("TCP connect to {} started", remote);
        Ok(Self { socket, remote })
    }

    /// Address being connected to
    #[must_use]
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Check for completion without blocking.
    ///
    /// Returns `Ok(None)` while the connect is still pending.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if the connect failed.
    pub fn poll_connected(&mut self) -> TransportResult<Option<TcpChannel>> {
        if let Some(e) = self.socket.take_error()? {
            return Err(TransportError::ConnectionFailed(format!("{}: {e}", self.remote)));
        }
        match self.socket.peer_addr() {
            Ok(_) => {
                let stream: TcpStream = self.socket.try_clone()?.into();
                debug!("TCP connected to {}", self.remote);
                Ok(Some(TcpChannel::new(stream, self.remote)))
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected || is_would_block(&e) => Ok(None),
            Err(e) => Err(TransportError::ConnectionFailed(format!("{}: {e}", self.remote))),
        }
    }
}

fn connect_in_progress(err: &io::Error) -> bool {
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    is_would_block(err)
}

/// Non-blocking TCP listener for inbound friend connections.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind and listen on `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BindFailed`] if the address is unavailable.
    pub fn bind(addr: SocketAddr) -> TransportResult<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket
            .bind(&addr.into())
            .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;
        socket.listen(128)?;
        Ok(Self {
            listener: socket.into(),
        })
    }

    /// Bound address
    ///
    /// # Errors
    ///
    /// Propagates the OS error.
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one pending connection, if any.
    ///
    /// # Errors
    ///
    /// Returns an error on listener failure; `Ok(None)` when nothing is waiting.
    pub fn accept(&self) -> TransportResult<Option<TcpChannel>> {
        match self.listener.accept() {
            Ok((stream, remote)) => {
                stream.set_nonblocking(true)?;
                stream.set_nodelay(true)?;
                debug!("Accepted TCP connection from {}", remote);
                Ok(Some(TcpChannel::new(stream, remote)))
            }
            Err(e) if is_would_block(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Established TCP byte channel.
pub struct TcpChannel {
    stream: TcpStream,
    remote: SocketAddr,
    open: bool,
    stats: TransportStats,
}

impl TcpChannel {
    fn new(stream: TcpStream, remote: SocketAddr) -> Self {
        Self {
            stream,
            remote,
            open: true,
            stats: TransportStats::new(),
        }
    }
}

impl Read for TcpChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.open {
            return Ok(0);
        }
        match self.stream.read(buf) {
            Ok(0) if !buf.is_empty() => {
                self.open = false;
                Ok(0)
            }
            Ok(n) => {
                self.stats.record_recv(n);
                Ok(n)
            }
            Err(e) => {
                if !is_would_block(&e) {
                    self.open = false;
                }
                Err(e)
            }
        }
    }
}

impl Write for TcpChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.open {
            return Err(io::ErrorKind::NotConnected.into());
        }
        match self.stream.write(buf) {
            Ok(n) => {
                self.stats.record_send(n);
                Ok(n)
            }
            Err(e) => {
                if !is_would_block(&e) {
                    self.open = false;
                }
                Err(e)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl ByteChannel for TcpChannel {
    fn peer_addr(&self) -> SocketAddr {
        self.remote
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn shutdown(&mut self) {
        if self.open {
            self.open = false;
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    fn stats(&self) -> TransportStats {
        self.stats
    }
}
