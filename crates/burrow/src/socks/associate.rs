//! SOCKS UDP ASSOCIATE over the tunnel.
//!
//! The master binds the relay socket its client talks to; the slave binds
//! an ephemeral socket next to the real destinations. Datagrams cross the
//! tunnel as `SocksDatagram` envelopes on one dedicated stream. The
//! association lives exactly as long as the controlling TCP connection:
//! its read loop is the lifetime anchor, everything else is torn down
//! when it returns.

use std::io::Read;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result};
use log::{debug, warn};
use parking_lot::Mutex;

use super::{unspecified, wire};
use crate::cancel::Cancel;
use crate::config::Tuning;
use crate::error::is_timeout;
use crate::forward::MAX_DATAGRAM;
use crate::mux::Stream;
use crate::proto::{Message, read_frame, write_frame};
use crate::session::SessionCore;
use wire::{DestAddr, Reply};

/// Master half: bind the relay, reply with its address, translate between
/// SOCKS datagrams and tunnel envelopes until the TCP connection ends.
pub(crate) fn serve(
  core: &Arc<SessionCore>,
  mut client: TcpStream,
  request: wire::Request,
  relay_host: &str,
) -> Result<()> {
  let stream = core.send_with_stream(&Message::SocksAssociate)?;
  let relay = match UdpSocket::bind((relay_host, 0)) {
    Ok(relay) => relay,
    Err(err) => {
      let _ = wire::write_reply(&mut client, Reply::GeneralFailure, unspecified());
      stream.close();
      return Err(err).context("binding the udp relay");
    }
  };
  let bound = relay.local_addr().context("relay local address")?;
  wire::write_reply(&mut client, Reply::Succeeded, bound)?;
  debug!("udp relay bound on {bound}");

  // The client may pin its source endpoint in the request; otherwise the
  // first datagram defines it.
  let pinned = match &request.addr {
    DestAddr::Ip(ip) if request.port != 0 && !ip.is_unspecified() => {
      Some(SocketAddr::new(*ip, request.port))
    }
    _ => None,
  };
  let client_endpoint = Arc::new(Mutex::new(pinned));
  let stop = Arc::new(AtomicBool::new(false));
  relay
    .set_read_timeout(Some(core.tuning.poll))
    .context("relay read timeout")?;

  let outbound = {
    let relay = relay.try_clone().context("cloning the relay socket")?;
    let stream = stream.clone();
    let client_endpoint = client_endpoint.clone();
    let stop = stop.clone();
    let cancel = core.cancel.clone();
    thread::Builder::new()
      .name("socks-udp-out".to_string())
      .spawn(move || local_to_remote(relay, stream, client_endpoint, stop, cancel))
      .expect("failed to spawn udp out pump")
  };
  let inbound = {
    let relay = relay.try_clone().context("cloning the relay socket")?;
    let stream = stream.clone();
    let client_endpoint = client_endpoint.clone();
    thread::Builder::new()
      .name("socks-udp-in".to_string())
      .spawn(move || remote_to_local(relay, stream, client_endpoint))
      .expect("failed to spawn udp in pump")
  };

  // Lifetime anchor: nothing meaningful flows here, but when the client
  // hangs up the association is over.
  client.set_read_timeout(Some(core.tuning.poll))?;
  let mut scratch = [0u8; 512];
  loop {
    if core.cancel.is_cancelled() || stop.load(Ordering::SeqCst) {
      break;
    }
    match client.read(&mut scratch) {
      Ok(0) => break,
      Ok(_) => {}
      Err(err) if is_timeout(&err) => {}
      Err(_) => break,
    }
  }
  stop.store(true, Ordering::SeqCst);
  stream.close();
  let _ = outbound.join();
  let _ = inbound.join();
  debug!("udp association on {bound} closed");
  Ok(())
}

/// Relay socket to tunnel: parse each SOCKS datagram, drop fragments,
/// wrap the payload in an envelope.
fn local_to_remote(
  relay: UdpSocket,
  mut stream: Stream,
  client_endpoint: Arc<Mutex<Option<SocketAddr>>>,
  stop: Arc<AtomicBool>,
  cancel: Cancel,
) {
  let mut buf = [0u8; MAX_DATAGRAM];
  loop {
    if stop.load(Ordering::SeqCst) || cancel.is_cancelled() {
      return;
    }
    let (n, from) = match relay.recv_from(&mut buf) {
      Ok(received) => received,
      Err(err) if is_timeout(&err) => continue,
      Err(_) => return,
    };
    {
      let mut expected = client_endpoint.lock();
      match *expected {
        None => *expected = Some(from),
        Some(endpoint) if endpoint != from => {
          debug!("dropping datagram from unexpected source {from}");
          continue;
        }
        Some(_) => {}
      }
    }
    let (frag, addr, port, payload) = match wire::parse_udp_datagram(&buf[..n]) {
      Ok(parsed) => parsed,
      Err(err) => {
        debug!("malformed udp request: {err}");
        continue;
      }
    };
    if frag != 0 {
      warn!("dropping fragmented datagram (frag={frag})");
      continue;
    }
    let envelope = Message::SocksDatagram {
      host: addr.host_string(),
      port,
      data: payload.to_vec(),
    };
    if write_frame(&mut stream, &envelope).is_err() {
      stop.store(true, Ordering::SeqCst);
      return;
    }
  }
}

/// Tunnel to relay socket: rebuild the SOCKS header around each reply and
/// send it to the learned client endpoint.
fn remote_to_local(
  relay: UdpSocket,
  mut stream: Stream,
  client_endpoint: Arc<Mutex<Option<SocketAddr>>>,
) {
  loop {
    match read_frame::<_, Message>(&mut stream) {
      Ok(Message::SocksDatagram { host, port, data }) => {
        let packet = wire::encode_udp_datagram(&host, port, &data);
        let target = *client_endpoint.lock();
        match target {
          Some(target) => {
            let _ = relay.send_to(&packet, target);
          }
          None => debug!("no client endpoint learned yet, dropping a reply"),
        }
      }
      Ok(other) => debug!("unexpected {} inside the relay stream", other.kind()),
      Err(_) => return,
    }
  }
}

/// Dial half, running on the slave: a real UDP socket, envelopes out to
/// their destinations, replies wrapped back into envelopes.
pub(crate) fn dial_side(stream: Stream, tuning: Tuning, cancel: Cancel) {
  let socket = match UdpSocket::bind(("0.0.0.0", 0)) {
    Ok(socket) => socket,
    Err(err) => {
      warn!("cannot bind a udp socket for the association: {err}");
      stream.close();
      return;
    }
  };
  let _ = socket.set_read_timeout(Some(tuning.poll));
  let stop = Arc::new(AtomicBool::new(false));

  let outbound = {
    let socket = match socket.try_clone() {
      Ok(socket) => socket,
      Err(err) => {
        warn!("cannot clone the association socket: {err}");
        stream.close();
        return;
      }
    };
    let mut from_tunnel = stream.clone();
    let stop = stop.clone();
    thread::Builder::new()
      .name("socks-udp-dial-out".to_string())
      .spawn(move || {
        loop {
          match read_frame::<_, Message>(&mut from_tunnel) {
            Ok(Message::SocksDatagram { host, port, data }) => {
              match (host.as_str(), port)
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next())
              {
                Some(addr) => {
                  let _ = socket.send_to(&data, addr);
                }
                None => debug!("cannot resolve {host}:{port}"),
              }
            }
            Ok(other) => debug!("unexpected {} inside the relay stream", other.kind()),
            Err(_) => {
              stop.store(true, Ordering::SeqCst);
              return;
            }
          }
        }
      })
      .expect("failed to spawn association out pump")
  };

  let mut back = stream.clone();
  let mut buf = [0u8; MAX_DATAGRAM];
  loop {
    if stop.load(Ordering::SeqCst) || cancel.is_cancelled() {
      break;
    }
    match socket.recv_from(&mut buf) {
      Ok((n, from)) => {
        let envelope = Message::SocksDatagram {
          host: from.ip().to_string(),
          port: from.port(),
          data: buf[..n].to_vec(),
        };
        if write_frame(&mut back, &envelope).is_err() {
          break;
        }
      }
      Err(err) if is_timeout(&err) => {}
      Err(_) => break,
    }
  }
  stream.close();
  let _ = outbound.join();
}
