//! SOCKS5 proxy (RFC 1928) on the master side.
//!
//! Only the no-authentication method is negotiated and only CONNECT and
//! UDP ASSOCIATE are served. Dials happen on the slave: each CONNECT maps
//! to one tunnel stream, each ASSOCIATE to one stream carrying datagram
//! envelopes both ways. Per-connection protocol errors answer with the
//! matching reply code and close that connection only.

pub mod wire;

pub(crate) mod associate;
pub(crate) mod connect;

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use anyhow::{Result, bail};
use log::{debug, info, warn};

use crate::config::Endpoint;
use crate::net::ACCEPT_POLL;
use crate::session::SessionCore;
use wire::Reply;

/// Binds the SOCKS listener and serves clients until cancellation.
pub(crate) fn spawn_server(core: &Arc<SessionCore>, bind: &Endpoint) -> io::Result<()> {
  let listener = TcpListener::bind((bind.host.as_str(), bind.port))?;
  listener.set_nonblocking(true)?;
  info!("socks5 proxy listening on {}", listener.local_addr()?);
  let core = core.clone();
  let relay_host = bind.host.clone();
  thread::Builder::new()
    .name("socks-accept".to_string())
    .spawn(move || accept_loop(core, listener, relay_host))
    .expect("failed to spawn socks accept loop");
  Ok(())
}

fn accept_loop(core: Arc<SessionCore>, listener: TcpListener, relay_host: String) {
  loop {
    if core.cancel.is_cancelled() {
      return;
    }
    match listener.accept() {
      Ok((conn, peer)) => {
        debug!("socks client {peer}");
        let core = core.clone();
        let relay_host = relay_host.clone();
        thread::Builder::new()
          .name("socks-conn".to_string())
          .spawn(move || {
            if let Err(err) = handle_connection(&core, conn, &relay_host) {
              debug!("socks connection from {peer} ended: {err:#}");
            }
          })
          .expect("failed to spawn socks connection");
      }
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
      Err(err) => {
        warn!("socks accept failed: {err}");
        return;
      }
    }
  }
}

fn handle_connection(
  core: &Arc<SessionCore>,
  mut conn: TcpStream,
  relay_host: &str,
) -> Result<()> {
  conn.set_read_timeout(Some(core.tuning.socks_parse))?;
  let methods = wire::read_methods(&mut conn)?;
  if !methods.contains(&wire::METHOD_NO_AUTH) {
    let _ = wire::write_method_selection(&mut conn, wire::METHOD_NO_ACCEPTABLE);
    bail!("no acceptable authentication method");
  }
  wire::write_method_selection(&mut conn, wire::METHOD_NO_AUTH)?;

  let request = match wire::read_request(&mut conn) {
    Ok(request) => request,
    Err(err) => {
      let _ = wire::write_reply(&mut conn, err.reply(), unspecified());
      return Err(err.into());
    }
  };
  conn.set_read_timeout(None)?;

  match request.command {
    wire::CMD_CONNECT => connect::serve(core, conn, request),
    wire::CMD_UDP_ASSOCIATE => associate::serve(core, conn, request, relay_host),
    command => {
      let _ = wire::write_reply(&mut conn, Reply::CommandNotSupported, unspecified());
      bail!("command {command:#04x} is not supported");
    }
  }
}

pub(crate) fn unspecified() -> SocketAddr {
  SocketAddr::from(([0, 0, 0, 0], 0))
}
