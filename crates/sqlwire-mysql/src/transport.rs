//! Byte transport under the packet layer.
//!
//! A [`Socket`] is a TCP or unix-domain stream that charges the time every
//! blocking read and write takes against an [`IoBudget`]. When the budget
//! runs out the next operation fails with [`io::ErrorKind::TimedOut`], so a
//! single command cannot exceed its timeout no matter how many packets it
//! reads. [`Transport`] layers optional TLS on top.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};

use sqlwire_core::error::{ConnectionError, ConnectionErrorKind};
use sqlwire_core::{Error, Result};

use crate::config::MySqlConfig;

/// Time left for the current command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoBudget {
    remaining: Option<Duration>,
}

impl IoBudget {
    /// A budget of `limit`, or no limit at all.
    pub fn new(limit: Option<Duration>) -> Self {
        Self { remaining: limit }
    }

    pub fn unlimited() -> Self {
        Self { remaining: None }
    }

    /// Start over with a fresh limit.
    pub fn reset(&mut self, limit: Option<Duration>) {
        self.remaining = limit;
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(Duration::ZERO)
    }

    fn charge(&mut self, elapsed: Duration) {
        if let Some(remaining) = &mut self.remaining {
            *remaining = remaining.saturating_sub(elapsed);
        }
    }
}

#[derive(Debug)]
enum SocketKind {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

/// A connected stream with a time budget.
#[derive(Debug)]
pub struct Socket {
    kind: SocketKind,
    budget: IoBudget,
    /// Timeout currently set on the OS socket, to skip redundant syscalls
    applied: Option<Option<Duration>>,
}

impl Socket {
    /// Connect to the server named by `config`.
    ///
    /// Every resolved address is tried in turn within `connect_timeout`.
    #[allow(clippy::result_large_err)]
    pub fn connect(config: &MySqlConfig) -> Result<Self> {
        if let Some(path) = &config.socket_path {
            return Self::connect_unix(path);
        }

        let target = config.socket_addr();
        let addrs = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| connect_error(e, format!("failed to resolve {target}")))?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, config.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    tracing::debug!(%addr, "connected over tcp");
                    return Ok(Self::from_kind(SocketKind::Tcp(stream)));
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "connect attempt failed");
                    last_error = Some(e);
                }
            }
        }
        let err = last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
        });
        Err(connect_error(err, format!("failed to connect to {target}")))
    }

    #[cfg(unix)]
    #[allow(clippy::result_large_err)]
    fn connect_unix(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .map_err(|e| connect_error(e, format!("failed to connect to {}", path.display())))?;
        tracing::debug!(socket = %path.display(), "connected over unix socket");
        Ok(Self::from_kind(SocketKind::Unix(stream)))
    }

    #[cfg(not(unix))]
    #[allow(clippy::result_large_err)]
    fn connect_unix(path: &Path) -> Result<Self> {
        Err(Error::config(format!(
            "unix socket {} is not supported on this platform",
            path.display()
        )))
    }

    /// Wrap an already connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        Self::from_kind(SocketKind::Tcp(stream))
    }

    fn from_kind(kind: SocketKind) -> Self {
        Self {
            kind,
            budget: IoBudget::unlimited(),
            applied: None,
        }
    }

    /// Unix sockets never leave the host.
    pub fn is_local(&self) -> bool {
        match &self.kind {
            SocketKind::Tcp(_) => false,
            #[cfg(unix)]
            SocketKind::Unix(_) => true,
        }
    }

    pub fn budget(&self) -> IoBudget {
        self.budget
    }

    pub fn reset_budget(&mut self, limit: Option<Duration>) {
        self.budget.reset(limit);
    }

    /// Close both directions. Further reads fail immediately.
    pub fn shutdown(&self) {
        let result = match &self.kind {
            SocketKind::Tcp(stream) => stream.shutdown(Shutdown::Both),
            #[cfg(unix)]
            SocketKind::Unix(stream) => stream.shutdown(Shutdown::Both),
        };
        if let Err(e) = result {
            tracing::trace!(error = %e, "socket shutdown failed");
        }
    }

    /// Apply the remaining budget as the OS timeout for the next operation.
    fn arm(&mut self) -> io::Result<()> {
        let timeout = self.budget.remaining();
        if timeout == Some(Duration::ZERO) {
            return Err(timed_out());
        }
        if self.applied != Some(timeout) {
            match &self.kind {
                SocketKind::Tcp(stream) => {
                    stream.set_read_timeout(timeout)?;
                    stream.set_write_timeout(timeout)?;
                }
                #[cfg(unix)]
                SocketKind::Unix(stream) => {
                    stream.set_read_timeout(timeout)?;
                    stream.set_write_timeout(timeout)?;
                }
            }
            self.applied = Some(timeout);
        }
        Ok(())
    }

    fn timed<T>(
        &mut self,
        op: impl FnOnce(&mut SocketKind) -> io::Result<T>,
    ) -> io::Result<T> {
        self.arm()?;
        let start = Instant::now();
        let result = op(&mut self.kind);
        self.budget.charge(start.elapsed());
        result.map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => timed_out(),
            _ => e,
        })
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.timed(|kind| match kind {
            SocketKind::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            SocketKind::Unix(stream) => stream.read(buf),
        })
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.timed(|kind| match kind {
            SocketKind::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            SocketKind::Unix(stream) => stream.write(buf),
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.kind {
            SocketKind::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            SocketKind::Unix(stream) => stream.flush(),
        }
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "command time budget exhausted")
}

/// Was this I/O failure the budget running out?
pub fn is_timeout(err: &Error) -> bool {
    matches!(err, Error::Io(e) if e.kind() == io::ErrorKind::TimedOut)
}

fn connect_error(err: io::Error, message: String) -> Error {
    let kind = if err.kind() == io::ErrorKind::ConnectionRefused {
        ConnectionErrorKind::Refused
    } else {
        ConnectionErrorKind::Connect
    };
    Error::Connection(ConnectionError {
        kind,
        message: format!("{message}: {err}"),
        source: Some(Box::new(err)),
    })
}

/// A socket, possibly wrapped in TLS.
#[derive(Debug)]
pub enum Transport {
    Plain(Socket),
    #[cfg(feature = "tls")]
    Tls(Box<crate::tls::TlsStream<Socket>>),
}

impl Transport {
    pub fn socket(&self) -> &Socket {
        match self {
            Transport::Plain(socket) => socket,
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => stream.get_ref(),
        }
    }

    pub fn socket_mut(&mut self) -> &mut Socket {
        match self {
            Transport::Plain(socket) => socket,
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => stream.get_mut(),
        }
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self, Transport::Plain(_))
    }

    /// TLS or a unix socket: safe for cleartext passwords.
    pub fn is_secure(&self) -> bool {
        self.is_tls() || self.socket().is_local()
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(socket) => socket.read(buf),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(socket) => socket.write(buf),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(socket) => socket.flush(),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => stream.flush(),
        }
    }
}
