//! The transport boundary.
//!
//! A [`Conduit`] is what the session layer requires of any transport: an
//! established, ordered, full-duplex byte stream that can be cloned into
//! independent reader/writer handles, shut down from any thread, and given
//! read/write deadlines. Plain TCP is the transport this build ships;
//! anything fancier (TLS, WebSocket) stays behind this trait.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::cancel::Cancel;
use crate::config::Address;

/// How long the accept loop sleeps between polls of a non-blocking listener.
pub(crate) const ACCEPT_POLL: Duration = Duration::from_millis(50);

pub trait Conduit: Read + Write + Send {
  /// Returns an independent handle to the same underlying stream.
  fn try_clone(&self) -> io::Result<Box<dyn Conduit>>;

  /// Shuts the stream down in both directions, waking blocked readers.
  fn shutdown(&self) -> io::Result<()>;

  fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

  fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Conduit for TcpStream {
  fn try_clone(&self) -> io::Result<Box<dyn Conduit>> {
    Ok(Box::new(TcpStream::try_clone(self)?))
  }

  fn shutdown(&self) -> io::Result<()> {
    TcpStream::shutdown(self, Shutdown::Both)
  }

  fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
    TcpStream::set_read_timeout(self, timeout)
  }

  fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
    TcpStream::set_write_timeout(self, timeout)
  }
}

#[cfg(unix)]
impl Conduit for UnixStream {
  fn try_clone(&self) -> io::Result<Box<dyn Conduit>> {
    Ok(Box::new(UnixStream::try_clone(self)?))
  }

  fn shutdown(&self) -> io::Result<()> {
    UnixStream::shutdown(self, Shutdown::Both)
  }

  fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
    UnixStream::set_read_timeout(self, timeout)
  }

  fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
    UnixStream::set_write_timeout(self, timeout)
  }
}

/// The process stdio pair as a conduit: reads come from stdin, writes go to
/// stdout. Closing is a no-op; the process owns its stdio.
pub struct StdioConduit;

impl StdioConduit {
  pub fn new() -> Self {
    StdioConduit
  }
}

impl Default for StdioConduit {
  fn default() -> Self {
    Self::new()
  }
}

impl Read for StdioConduit {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    io::stdin().read(buf)
  }
}

impl Write for StdioConduit {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    let n = io::stdout().write(buf)?;
    io::stdout().flush()?;
    Ok(n)
  }

  fn flush(&mut self) -> io::Result<()> {
    io::stdout().flush()
  }
}

impl Conduit for StdioConduit {
  fn try_clone(&self) -> io::Result<Box<dyn Conduit>> {
    Ok(Box::new(StdioConduit))
  }

  fn shutdown(&self) -> io::Result<()> {
    Ok(())
  }

  fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
    Ok(())
  }

  fn set_write_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
    Ok(())
  }
}

/// Dials the configured address and returns the established transport.
pub fn connect(addr: &Address) -> io::Result<TcpStream> {
  let target = (addr.host.as_str(), addr.port);
  let mut last = None;
  for resolved in target.to_socket_addrs()? {
    match TcpStream::connect(resolved) {
      Ok(stream) => return Ok(stream),
      Err(err) => last = Some(err),
    }
  }
  Err(last.unwrap_or_else(|| {
    io::Error::new(io::ErrorKind::NotFound, format!("{} did not resolve", addr))
  }))
}

/// Binds the configured address and waits for exactly one peer, polling so
/// cancellation can interrupt the wait.
pub fn listen_one(addr: &Address, cancel: &Cancel) -> io::Result<TcpStream> {
  let listener = TcpListener::bind((addr.host.as_str(), addr.port))?;
  listener.set_nonblocking(true)?;
  accept_one(&listener, cancel)
}

/// Accepts one connection from a non-blocking listener.
pub(crate) fn accept_one(listener: &TcpListener, cancel: &Cancel) -> io::Result<TcpStream> {
  loop {
    if cancel.is_cancelled() {
      return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "cancelled"));
    }
    match listener.accept() {
      Ok((stream, _)) => {
        stream.set_nonblocking(false)?;
        return Ok(stream);
      }
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
        std::thread::sleep(ACCEPT_POLL);
      }
      Err(err) => return Err(err),
    }
  }
}
