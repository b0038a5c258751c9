//! SOCKS CONNECT over the tunnel.
//!
//! The master never dials: it forwards the request to the slave, reads
//! the slave's RFC reply off the tunnel stream, hands it to the client
//! verbatim, and only then starts piping. A failed dial therefore shows
//! the client exactly what the slave's network saw.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, warn};

use super::{unspecified, wire};
use crate::mux::Stream;
use crate::net::Conduit;
use crate::pipe::pipe;
use crate::proto::Message;
use crate::session::SessionCore;
use wire::Reply;

/// Master half: request the dial, relay the reply, then splice.
pub(crate) fn serve(
  core: &Arc<SessionCore>,
  mut client: TcpStream,
  request: wire::Request,
) -> Result<()> {
  let stream = core.send_with_stream(&Message::SocksConnect {
    host: request.addr.host_string(),
    port: request.port,
  })?;
  stream.set_read_timeout(Some(core.tuning.control_op))?;

  let mut reply_reader = stream.clone();
  let raw = match wire::read_reply_raw(&mut reply_reader) {
    Ok(raw) => raw,
    Err(err) => {
      let _ = wire::write_reply(&mut client, Reply::GeneralFailure, unspecified());
      stream.close();
      return Err(err.into());
    }
  };
  client.write_all(&raw)?;
  if raw[1] != Reply::Succeeded.code() {
    debug!("connect to {} refused with code {:#04x}", request.addr, raw[1]);
    stream.close();
    return Ok(());
  }

  stream.set_read_timeout(None)?;
  pipe(Box::new(client), Box::new(stream))?;
  Ok(())
}

/// Dial half, running on the slave: resolve, connect, answer with the
/// RFC reply, then splice.
pub(crate) fn dial_side(mut stream: Stream, host: String, port: u16, dial_timeout: Duration) {
  match dial(&host, port, dial_timeout) {
    Ok(conn) => {
      let bound = conn.local_addr().unwrap_or_else(|_| unspecified());
      if wire::write_reply(&mut stream, Reply::Succeeded, bound).is_err() {
        stream.close();
        return;
      }
      if let Err(err) = pipe(Box::new(stream), Box::new(conn)) {
        warn!("socks tunnel to {host}:{port} failed: {err}");
      }
    }
    Err(reply) => {
      debug!("socks dial {host}:{port} answered {reply:?}");
      let _ = wire::write_reply(&mut stream, reply, unspecified());
      stream.close();
    }
  }
}

fn dial(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, Reply> {
  let addrs: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
    Ok(addrs) => addrs.collect(),
    Err(_) => return Err(Reply::HostUnreachable),
  };
  if addrs.is_empty() {
    return Err(Reply::HostUnreachable);
  }
  let mut reply = Reply::GeneralFailure;
  for addr in addrs {
    match TcpStream::connect_timeout(&addr, timeout) {
      Ok(conn) => return Ok(conn),
      Err(err) => reply = reply_for_dial_error(&err),
    }
  }
  Err(reply)
}

fn reply_for_dial_error(err: &io::Error) -> Reply {
  match err.kind() {
    io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
    io::ErrorKind::NetworkUnreachable => Reply::NetworkUnreachable,
    io::ErrorKind::HostUnreachable => Reply::HostUnreachable,
    _ => Reply::GeneralFailure,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn dial_errors_map_to_rfc_reply_codes() {
    assert_eq!(
      reply_for_dial_error(&io::Error::from(io::ErrorKind::ConnectionRefused)),
      Reply::ConnectionRefused
    );
    assert_eq!(
      reply_for_dial_error(&io::Error::from(io::ErrorKind::NetworkUnreachable)),
      Reply::NetworkUnreachable
    );
    assert_eq!(
      reply_for_dial_error(&io::Error::from(io::ErrorKind::HostUnreachable)),
      Reply::HostUnreachable
    );
    assert_eq!(
      reply_for_dial_error(&io::Error::from(io::ErrorKind::PermissionDenied)),
      Reply::GeneralFailure
    );
  }

  #[test]
  fn refused_dial_yields_connection_refused() {
    // Bind a listener to learn a free port, then close it and dial.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    let reply = dial("127.0.0.1", port, Duration::from_secs(2)).expect_err("refused");
    assert_eq!(reply, Reply::ConnectionRefused);
  }
}
