//! Stream multiplexer.
//!
//! Turns one transport conduit into many independent, ordered, flow
//! controlled byte streams. The master side constructs the client role and
//! opens streams with odd ids; the slave side constructs the server role
//! and accepts them. Streams reach `accept` in exactly the order the peer
//! opened them: all frames are written under a single writer lock and the
//! demux thread queues inbound streams in arrival order.
//!
//! A keepalive thread pings the peer periodically and declares the
//! transport dead after two silent intervals. Closing the multiplexer
//! closes the transport and fails every stream with a benign error.

mod frame;
mod stream;

pub use stream::Stream;

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use log::{debug, trace};
use parking_lot::Mutex;

use crate::error::is_benign;
use crate::net::Conduit;
use frame::{FrameType, HEADER_LEN, Header, MAX_DATA_LEN, flags};
use stream::StreamState;

pub use frame::INITIAL_WINDOW;

/// How often the keepalive thread wakes to check liveness and send pings.
const KEEPALIVE_TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy)]
pub struct MuxConfig {
  /// Ping cadence; the transport is declared dead after two silent
  /// intervals.
  pub keepalive_interval: Duration,
  /// Per-stream, per-direction flow-control window in bytes.
  pub window: u32,
}

impl Default for MuxConfig {
  fn default() -> Self {
    MuxConfig {
      keepalive_interval: Duration::from_secs(30),
      window: INITIAL_WINDOW,
    }
  }
}

pub(crate) struct Shared {
  pub(crate) cfg: MuxConfig,
  writer: Mutex<Box<dyn Conduit>>,
  closer: Mutex<Box<dyn Conduit>>,
  streams: Mutex<HashMap<u32, Arc<StreamState>>>,
  accept_tx: Mutex<Option<Sender<Stream>>>,
  accept_rx: Receiver<Stream>,
  next_id: AtomicU32,
  closed: AtomicBool,
  close_reason: Mutex<Option<String>>,
  last_rx: Mutex<Instant>,
}

impl Shared {
  /// Writes one frame under the writer lock. Any write failure is fatal to
  /// the whole multiplexer: a partial frame desynchronizes the peer.
  pub(crate) fn send_frame(
    self: &Arc<Self>,
    header: Header,
    payload: &[u8],
    timeout: Option<Duration>,
  ) -> io::Result<()> {
    let result = {
      let mut writer = self.writer.lock();
      if timeout.is_some() {
        let _ = writer.set_write_timeout(timeout);
      }
      let result = writer
        .write_all(&header.encode())
        .and_then(|()| {
          if payload.is_empty() {
            Ok(())
          } else {
            writer.write_all(payload)
          }
        });
      if timeout.is_some() {
        let _ = writer.set_write_timeout(None);
      }
      result
    };
    if let Err(err) = result {
      self.shutdown(&format!("transport write failed: {err}"));
      return Err(err);
    }
    trace!(
      "sent {} frame, stream {}, len {}",
      header.ty, header.stream_id, header.length
    );
    Ok(())
  }

  pub(crate) fn flush_transport(self: &Arc<Self>) -> io::Result<()> {
    self.writer.lock().flush()
  }

  /// Drops a stream from the table once its owner is done with it.
  pub(crate) fn forget(&self, id: u32) {
    self.streams.lock().remove(&id);
  }

  fn shutdown(self: &Arc<Self>, reason: &str) {
    if self.closed.swap(true, Ordering::SeqCst) {
      return;
    }
    *self.close_reason.lock() = Some(reason.to_string());
    debug!("mux shut down: {reason}");
    let _ = self.closer.lock().shutdown();
    self.accept_tx.lock().take();
    while self.accept_rx.try_recv().is_ok() {}
    let states: Vec<_> = self.streams.lock().drain().map(|(_, s)| s).collect();
    for state in states {
      state.abort();
    }
  }

  fn register_inbound(self: &Arc<Self>, id: u32) -> bool {
    let state = StreamState::new(id, self.cfg.window);
    {
      let mut streams = self.streams.lock();
      if streams.contains_key(&id) {
        drop(streams);
        self.shutdown(&format!("peer reused stream id {id}"));
        return false;
      }
      streams.insert(id, state.clone());
    }
    let stream = Stream {
      shared: self.clone(),
      state,
    };
    let guard = self.accept_tx.lock();
    match guard.as_ref() {
      Some(tx) => {
        let _ = tx.send(stream);
        true
      }
      None => false,
    }
  }

  fn lookup(&self, id: u32) -> Option<Arc<StreamState>> {
    self.streams.lock().get(&id).cloned()
  }

  fn closed_error(&self) -> io::Error {
    let reason = self
      .close_reason
      .lock()
      .clone()
      .unwrap_or_else(|| "multiplexer closed".to_string());
    io::Error::new(io::ErrorKind::ConnectionAborted, reason)
  }
}

#[derive(Clone)]
pub struct Mux {
  shared: Arc<Shared>,
}

impl Mux {
  /// Client role: opens streams with odd ids. Taken by the master.
  pub fn client(transport: Box<dyn Conduit>, cfg: MuxConfig) -> io::Result<Mux> {
    Mux::start(transport, cfg, true)
  }

  /// Server role: opens streams with even ids. Taken by the slave.
  pub fn server(transport: Box<dyn Conduit>, cfg: MuxConfig) -> io::Result<Mux> {
    Mux::start(transport, cfg, false)
  }

  fn start(transport: Box<dyn Conduit>, cfg: MuxConfig, client: bool) -> io::Result<Mux> {
    let reader = transport.try_clone()?;
    let closer = transport.try_clone()?;
    let (accept_tx, accept_rx) = unbounded();
    let shared = Arc::new(Shared {
      cfg,
      writer: Mutex::new(transport),
      closer: Mutex::new(closer),
      streams: Mutex::new(HashMap::new()),
      accept_tx: Mutex::new(Some(accept_tx)),
      accept_rx,
      next_id: AtomicU32::new(if client { 1 } else { 2 }),
      closed: AtomicBool::new(false),
      close_reason: Mutex::new(None),
      last_rx: Mutex::new(Instant::now()),
    });

    let demux_shared = shared.clone();
    thread::Builder::new()
      .name("mux-demux".to_string())
      .spawn(move || demux_loop(demux_shared, reader))
      .expect("failed to spawn mux demux thread");

    let keepalive_shared = shared.clone();
    thread::Builder::new()
      .name("mux-keepalive".to_string())
      .spawn(move || keepalive_loop(keepalive_shared))
      .expect("failed to spawn mux keepalive thread");

    Ok(Mux { shared })
  }

  /// Opens a new outbound stream. The peer sees it on `accept` in the
  /// order `open` calls hit the transport.
  pub fn open(&self) -> io::Result<Stream> {
    if self.is_closed() {
      return Err(self.shared.closed_error());
    }
    let id = self.shared.next_id.fetch_add(2, Ordering::SeqCst);
    let state = StreamState::new(id, self.shared.cfg.window);
    self.shared.streams.lock().insert(id, state.clone());
    if let Err(err) = self.shared.send_frame(Header::syn(id), &[], None) {
      self.shared.forget(id);
      return Err(err);
    }
    Ok(Stream {
      shared: self.shared.clone(),
      state,
    })
  }

  /// Blocks until the peer opens a stream or the multiplexer closes.
  pub fn accept(&self) -> io::Result<Stream> {
    self
      .shared
      .accept_rx
      .recv()
      .map_err(|_| self.shared.closed_error())
  }

  /// Like `accept`, but gives up with `TimedOut` after `timeout`.
  pub fn accept_timeout(&self, timeout: Duration) -> io::Result<Stream> {
    match self.shared.accept_rx.recv_timeout(timeout) {
      Ok(stream) => Ok(stream),
      Err(RecvTimeoutError::Timeout) => Err(io::Error::new(
        io::ErrorKind::TimedOut,
        "timed out waiting for a stream",
      )),
      Err(RecvTimeoutError::Disconnected) => Err(self.shared.closed_error()),
    }
  }

  /// Announces shutdown to the peer and tears everything down.
  pub fn close(&self) {
    if !self.is_closed() {
      let _ = self.shared.send_frame(Header::goaway(), &[], None);
    }
    self.shared.shutdown("closed");
  }

  pub fn is_closed(&self) -> bool {
    self.shared.closed.load(Ordering::SeqCst)
  }
}

fn demux_loop(shared: Arc<Shared>, mut reader: Box<dyn Conduit>) {
  let reason = loop {
    let mut head = [0u8; HEADER_LEN];
    if let Err(err) = read_exact(&mut reader, &mut head) {
      break if is_benign(&err) {
        "transport closed".to_string()
      } else {
        format!("transport read failed: {err}")
      };
    }
    let header = match Header::decode(&head) {
      Ok(header) => header,
      Err(err) => break format!("protocol violation: {err}"),
    };
    *shared.last_rx.lock() = Instant::now();
    trace!(
      "received {} frame, stream {}, len {}",
      header.ty, header.stream_id, header.length
    );

    match header.ty {
      FrameType::Data => {
        if header.has(flags::SYN) && !shared.register_inbound(header.stream_id) {
          break "shutting down".to_string();
        }
        let state = shared.lookup(header.stream_id);
        let len = header.length as usize;
        if len > MAX_DATA_LEN {
          break format!("oversized data frame ({len} bytes)");
        }
        if len > 0 {
          let mut payload = vec![0u8; len];
          if let Err(err) = read_exact(&mut reader, &mut payload) {
            break format!("transport read failed: {err}");
          }
          match &state {
            Some(state) => {
              if state.push_data(&payload, shared.cfg.window).is_err() {
                break format!("stream {} overflowed its window", header.stream_id);
              }
            }
            None => {
              debug!(
                "discarding {len} bytes for unknown stream {}",
                header.stream_id
              );
            }
          }
        }
        if let Some(state) = &state {
          if header.has(flags::FIN) {
            state.mark_eof();
          }
          if header.has(flags::RST) {
            state.mark_reset();
          }
        }
      }
      FrameType::WindowUpdate => {
        if header.has(flags::SYN) && !shared.register_inbound(header.stream_id) {
          break "shutting down".to_string();
        }
        if let Some(state) = shared.lookup(header.stream_id) {
          if header.length > 0 {
            state.add_credit(header.length);
          }
          if header.has(flags::FIN) {
            state.mark_eof();
          }
          if header.has(flags::RST) {
            state.mark_reset();
          }
        }
      }
      FrameType::Ping => {
        if !header.has(flags::ACK)
          && shared
            .send_frame(Header::ping_ack(header.length), &[], None)
            .is_err()
        {
          break "shutting down".to_string();
        }
      }
      FrameType::GoAway => break "peer closed".to_string(),
    }
  };
  shared.shutdown(&reason);
}

fn keepalive_loop(shared: Arc<Shared>) {
  let interval = shared.cfg.keepalive_interval;
  let mut counter: u32 = 0;
  let mut next_ping = Instant::now() + interval;
  loop {
    thread::sleep(KEEPALIVE_TICK.min(interval));
    if shared.closed.load(Ordering::SeqCst) {
      return;
    }
    let idle = shared.last_rx.lock().elapsed();
    if idle > interval * 2 {
      shared.shutdown("keepalive timeout");
      return;
    }
    if Instant::now() >= next_ping {
      counter = counter.wrapping_add(1);
      if shared.send_frame(Header::ping(counter), &[], None).is_err() {
        return;
      }
      next_ping = Instant::now() + interval;
    }
  }
}

fn read_exact(reader: &mut Box<dyn Conduit>, buf: &mut [u8]) -> io::Result<()> {
  use std::io::Read;
  let mut filled = 0;
  while filled < buf.len() {
    match reader.read(&mut buf[filled..]) {
      Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
      Ok(n) => filled += n,
      Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
      Err(err) => return Err(err),
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::{Read as _, Write as _};
  use std::os::unix::net::UnixStream;

  fn test_config() -> MuxConfig {
    MuxConfig {
      keepalive_interval: Duration::from_millis(250),
      window: 64 * 1024,
    }
  }

  fn mux_pair() -> (Mux, Mux) {
    let (near, far) = UnixStream::pair().expect("socket pair");
    let client = Mux::client(Box::new(near), test_config()).expect("client mux");
    let server = Mux::server(Box::new(far), test_config()).expect("server mux");
    (client, server)
  }

  #[test]
  fn streams_are_accepted_in_open_order() {
    let (client, server) = mux_pair();
    let mut opened = Vec::new();
    for i in 0u8..5 {
      let mut stream = client.open().expect("open");
      stream.write_all(&[i]).expect("write");
      opened.push(stream);
    }
    for i in 0u8..5 {
      let mut accepted = server.accept().expect("accept");
      let mut byte = [0u8; 1];
      accepted.read_exact(&mut byte).expect("read");
      assert_eq!(byte[0], i, "stream accepted out of order");
    }
  }

  #[test]
  fn data_flows_both_directions() {
    let (client, server) = mux_pair();
    let mut near = client.open().expect("open");
    near.write_all(b"to server").expect("write");
    let mut far = server.accept().expect("accept");

    let mut buf = [0u8; 9];
    far.read_exact(&mut buf).expect("read");
    assert_eq!(&buf, b"to server");

    far.write_all(b"to client").expect("write");
    near.read_exact(&mut buf).expect("read");
    assert_eq!(&buf, b"to client");
  }

  #[test]
  fn close_reaches_the_peer_as_eof() {
    let (client, server) = mux_pair();
    let near = client.open().expect("open");
    let mut far = server.accept().expect("accept");

    near.close();
    let mut buf = [0u8; 8];
    assert_eq!(far.read(&mut buf).expect("read"), 0);
  }

  #[test]
  fn large_transfer_exercises_window_refills() {
    let (client, server) = mux_pair();
    let mut near = client.open().expect("open");
    let mut far = server.accept().expect("accept");

    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let writer = thread::spawn(move || {
      near.write_all(&payload).expect("write");
      near.close();
    });

    let mut received = Vec::new();
    far.read_to_end(&mut received).expect("read");
    assert_eq!(received.len(), expected.len());
    assert_eq!(received, expected);
    writer.join().expect("writer");
  }

  #[test]
  fn accept_timeout_expires() {
    let (_client, server) = mux_pair();
    let err = server
      .accept_timeout(Duration::from_millis(50))
      .expect_err("no stream was opened");
    assert_eq!(err.kind(), io::ErrorKind::TimedOut);
  }

  #[test]
  fn closing_the_mux_fails_pending_operations() {
    let (client, server) = mux_pair();
    let mut near = client.open().expect("open");
    let _far = server.accept().expect("accept");

    server.close();

    // The peer's read unblocks with EOF once the transport goes away.
    let mut buf = [0u8; 8];
    let n = near.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0);
    assert!(client.accept().is_err());
    assert!(server.open().is_err());
  }

  #[test]
  fn close_unblocks_a_parked_accept() {
    let (_client, server) = mux_pair();
    let parked = server.clone();
    let waiter = thread::spawn(move || parked.accept());

    thread::sleep(Duration::from_millis(100));
    server.close();
    let started = Instant::now();
    assert!(waiter.join().expect("join").is_err());
    assert!(started.elapsed() < Duration::from_secs(2));

    // Closing again must stay a no-op.
    server.close();
    assert!(server.is_closed());
  }

  #[test]
  fn keepalive_holds_an_idle_connection_open() {
    let (client, server) = mux_pair();
    // Several ping intervals with no application traffic.
    thread::sleep(Duration::from_millis(1000));
    assert!(!client.is_closed());
    assert!(!server.is_closed());
    client.close();
  }

  #[test]
  fn read_deadline_fires_without_data() {
    let (client, server) = mux_pair();
    let near = client.open().expect("open");
    let _far = server.accept().expect("accept");

    near
      .set_read_timeout(Some(Duration::from_millis(50)))
      .expect("set timeout");
    let mut near = near;
    let mut buf = [0u8; 1];
    let err = near.read(&mut buf).expect_err("no data pending");
    assert_eq!(err.kind(), io::ErrorKind::TimedOut);
  }
}
