//! Local and remote port forwards.
//!
//! The bound side (master for local forwards, slave for remote forwards)
//! listens and requests one tunnel stream per accepted connection with a
//! `Connect` control message; the other side dials the target and splices.
//! UDP forwards get one stream per observed peer endpoint, with datagrams
//! framed as a big-endian `u32` length followed by the payload. Flows are
//! swept after an idle period.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::cancel::Cancel;
use crate::config::{ForwardSpec, Tuning};
use crate::error::{is_benign, is_timeout};
use crate::mux::Stream;
use crate::net::ACCEPT_POLL;
use crate::pipe::pipe;
use crate::proto::{Message, Proto};
use crate::session::SessionCore;

/// Largest datagram a forward or relay will carry.
pub(crate) const MAX_DATAGRAM: usize = 64 * 1024;

/// Starts every configured forward listener. Binding happens here so
/// startup failures surface before any thread spawns.
pub(crate) fn spawn_listeners(core: &Arc<SessionCore>, specs: &[ForwardSpec]) -> io::Result<()> {
  for spec in specs {
    spawn_listener(core.clone(), spec.clone())?;
  }
  Ok(())
}

/// Binds one forward endpoint and serves it until cancellation.
pub(crate) fn spawn_listener(core: Arc<SessionCore>, spec: ForwardSpec) -> io::Result<()> {
  match spec.proto {
    Proto::Tcp => {
      let listener = TcpListener::bind((spec.local.host.as_str(), spec.local.port))?;
      listener.set_nonblocking(true)?;
      info!("forwarding {spec}");
      thread::Builder::new()
        .name("fwd-listen".to_string())
        .spawn(move || tcp_listen_loop(core, spec, listener))
        .expect("failed to spawn forward listener");
    }
    Proto::Udp => {
      let socket = UdpSocket::bind((spec.local.host.as_str(), spec.local.port))?;
      socket.set_read_timeout(Some(core.tuning.poll))?;
      info!("forwarding {spec}");
      thread::Builder::new()
        .name("fwd-udp".to_string())
        .spawn(move || udp_relay_loop(core, spec, socket))
        .expect("failed to spawn forward relay");
    }
  }
  Ok(())
}

fn connect_message(spec: &ForwardSpec) -> Message {
  Message::Connect {
    proto: spec.proto,
    host: spec.remote.host.clone(),
    port: spec.remote.port,
  }
}

fn tcp_listen_loop(core: Arc<SessionCore>, spec: ForwardSpec, listener: TcpListener) {
  loop {
    if core.cancel.is_cancelled() {
      return;
    }
    match listener.accept() {
      Ok((conn, peer)) => {
        debug!("forward connection from {peer}");
        match core.send_with_stream(&connect_message(&spec)) {
          Ok(stream) => {
            thread::Builder::new()
              .name("fwd-conn".to_string())
              .spawn(move || {
                if let Err(err) = pipe(Box::new(conn), Box::new(stream)) {
                  warn!("forward connection from {peer} failed: {err}");
                }
              })
              .expect("failed to spawn forward connection");
          }
          Err(err) => {
            warn!("cannot reach the peer for {spec}: {err}");
            return;
          }
        }
      }
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
      Err(err) => {
        warn!("accept failed on {}: {err}", spec.local);
        return;
      }
    }
  }
}

struct Flow {
  stream: Stream,
  last_used: Instant,
}

/// Bound side of a UDP forward: one tunnel stream per peer endpoint.
fn udp_relay_loop(core: Arc<SessionCore>, spec: ForwardSpec, socket: UdpSocket) {
  let mut flows: HashMap<SocketAddr, Flow> = HashMap::new();
  let mut buf = [0u8; MAX_DATAGRAM];
  loop {
    if core.cancel.is_cancelled() {
      break;
    }
    match socket.recv_from(&mut buf) {
      Ok((n, peer)) => {
        if !flows.contains_key(&peer) {
          match open_flow(&core, &spec, &socket, peer) {
            Ok(flow) => {
              debug!("new udp flow from {peer}");
              flows.insert(peer, flow);
            }
            Err(err) => {
              warn!("cannot open a flow for {peer}: {err}");
              continue;
            }
          }
        }
        if let Some(flow) = flows.get_mut(&peer) {
          flow.last_used = Instant::now();
          if write_datagram(&mut flow.stream, &buf[..n]).is_err() {
            flow.stream.close();
            flows.remove(&peer);
          }
        }
      }
      Err(err) if is_timeout(&err) => {}
      Err(err) => {
        warn!("udp receive failed on {}: {err}", spec.local);
        break;
      }
    }
    let idle = core.tuning.udp_idle;
    flows.retain(|peer, flow| {
      if flow.last_used.elapsed() > idle {
        debug!("udp flow for {peer} idled out");
        flow.stream.close();
        false
      } else {
        true
      }
    });
  }
  for (_, flow) in flows {
    flow.stream.close();
  }
}

fn open_flow(
  core: &Arc<SessionCore>,
  spec: &ForwardSpec,
  socket: &UdpSocket,
  peer: SocketAddr,
) -> io::Result<Flow> {
  let stream = core.send_with_stream(&connect_message(spec))?;
  let mut from_tunnel = stream.clone();
  let socket = socket.try_clone()?;
  thread::Builder::new()
    .name("fwd-udp-return".to_string())
    .spawn(move || {
      loop {
        match read_datagram(&mut from_tunnel) {
          Ok(Some(data)) => {
            if socket.send_to(&data, peer).is_err() {
              return;
            }
          }
          Ok(None) => return,
          Err(err) => {
            if !is_benign(&err) {
              debug!("udp return flow for {peer} failed: {err}");
            }
            return;
          }
        }
      }
    })
    .expect("failed to spawn udp return pump");
  Ok(Flow {
    stream,
    last_used: Instant::now(),
  })
}

/// Dials the requested target and splices it to the tunnel stream. Runs
/// on whichever side received the connect request.
pub(crate) fn dial_and_pipe(
  proto: Proto,
  host: String,
  port: u16,
  stream: Stream,
  tuning: Tuning,
  cancel: Cancel,
) {
  match proto {
    Proto::Tcp => match dial_tcp(&host, port, tuning.control_op) {
      Ok(conn) => {
        if let Err(err) = pipe(Box::new(stream), Box::new(conn)) {
          warn!("tunnel to {host}:{port} failed: {err}");
        }
      }
      Err(err) => {
        warn!("connect to {host}:{port} failed: {err}");
        stream.close();
      }
    },
    Proto::Udp => udp_dial_loop(stream, &host, port, tuning, cancel),
  }
}

pub(crate) fn dial_tcp(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
  let mut last = None;
  for addr in (host, port).to_socket_addrs()? {
    match TcpStream::connect_timeout(&addr, timeout) {
      Ok(conn) => return Ok(conn),
      Err(err) => last = Some(err),
    }
  }
  Err(last.unwrap_or_else(|| {
    io::Error::new(
      io::ErrorKind::NotFound,
      format!("{host}:{port} did not resolve"),
    )
  }))
}

/// Dial side of a UDP flow: an ephemeral socket connected to the target.
fn udp_dial_loop(stream: Stream, host: &str, port: u16, tuning: Tuning, cancel: Cancel) {
  let socket = match UdpSocket::bind(("0.0.0.0", 0)) {
    Ok(socket) => socket,
    Err(err) => {
      warn!("cannot bind a relay socket: {err}");
      stream.close();
      return;
    }
  };
  if let Err(err) = socket.connect((host, port)) {
    warn!("udp connect to {host}:{port} failed: {err}");
    stream.close();
    return;
  }
  let _ = socket.set_read_timeout(Some(tuning.poll));

  let last_used = Arc::new(Mutex::new(Instant::now()));
  let sender = {
    let socket = match socket.try_clone() {
      Ok(socket) => socket,
      Err(err) => {
        warn!("cannot clone the relay socket: {err}");
        stream.close();
        return;
      }
    };
    let mut from_tunnel = stream.clone();
    let last_used = last_used.clone();
    thread::Builder::new()
      .name("fwd-udp-out".to_string())
      .spawn(move || {
        loop {
          match read_datagram(&mut from_tunnel) {
            Ok(Some(data)) => {
              *last_used.lock() = Instant::now();
              if socket.send(&data).is_err() {
                return;
              }
            }
            _ => return,
          }
        }
      })
      .expect("failed to spawn udp out pump")
  };

  let mut back = stream.clone();
  let mut buf = [0u8; MAX_DATAGRAM];
  loop {
    if cancel.is_cancelled() {
      break;
    }
    if last_used.lock().elapsed() > tuning.udp_idle {
      debug!("udp tunnel to {host}:{port} idled out");
      break;
    }
    match socket.recv(&mut buf) {
      Ok(n) => {
        *last_used.lock() = Instant::now();
        if write_datagram(&mut back, &buf[..n]).is_err() {
          break;
        }
      }
      Err(err) if is_timeout(&err) => {}
      Err(err) => {
        debug!("udp receive failed: {err}");
        break;
      }
    }
  }
  stream.close();
  let _ = sender.join();
}

/// Frames one datagram onto a stream: big-endian length, then payload.
pub(crate) fn write_datagram<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
  let len = payload.len() as u32;
  writer.write_all(&len.to_be_bytes())?;
  writer.write_all(payload)
}

/// Reads one framed datagram. `None` means the stream ended cleanly
/// between frames.
pub(crate) fn read_datagram<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
  let mut head = [0u8; 4];
  if !read_exact_or_eof(reader, &mut head)? {
    return Ok(None);
  }
  let len = u32::from_be_bytes(head) as usize;
  if len > MAX_DATAGRAM {
    return Err(io::Error::new(
      io::ErrorKind::InvalidData,
      format!("datagram of {len} bytes exceeds the limit"),
    ));
  }
  let mut data = vec![0u8; len];
  reader.read_exact(&mut data)?;
  Ok(Some(data))
}

/// Like `read_exact`, but a clean end-of-stream before the first byte
/// returns `false` instead of an error.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
  let mut filled = 0;
  while filled < buf.len() {
    match reader.read(&mut buf[filled..]) {
      Ok(0) => {
        if filled == 0 {
          return Ok(false);
        }
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
      }
      Ok(n) => filled += n,
      Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
      Err(err) => return Err(err),
    }
  }
  Ok(true)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn datagram_framing_roundtrip() {
    let mut wire = Vec::new();
    write_datagram(&mut wire, b"first").expect("write");
    write_datagram(&mut wire, b"").expect("write");
    write_datagram(&mut wire, b"second datagram").expect("write");

    let mut reader = io::Cursor::new(wire);
    assert_eq!(read_datagram(&mut reader).expect("read"), Some(b"first".to_vec()));
    assert_eq!(read_datagram(&mut reader).expect("read"), Some(Vec::new()));
    assert_eq!(
      read_datagram(&mut reader).expect("read"),
      Some(b"second datagram".to_vec())
    );
    assert_eq!(read_datagram(&mut reader).expect("read"), None);
  }

  #[test]
  fn truncated_datagram_is_an_error() {
    let mut wire = Vec::new();
    write_datagram(&mut wire, b"whole").expect("write");
    wire.truncate(wire.len() - 2);
    let mut reader = io::Cursor::new(wire);
    assert!(read_datagram(&mut reader).is_err());
  }

  #[test]
  fn oversized_datagram_is_rejected() {
    let mut wire = Vec::new();
    wire.extend_from_slice(&(MAX_DATAGRAM as u32 + 1).to_be_bytes());
    let mut reader = io::Cursor::new(wire);
    assert!(read_datagram(&mut reader).is_err());
  }
}
