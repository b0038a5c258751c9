//! A single multiplexed stream.
//!
//! `Stream` is a clonable handle; clones share buffers and flow-control
//! state, like `TcpStream::try_clone`. Reads block on a condvar fed by the
//! demux thread, writes block on the peer's credit window. Deadlines apply
//! per handle-wide setting, matching socket semantics.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::Shared;
use super::frame::{Header, MAX_DATA_LEN};
use crate::net::Conduit;

pub(super) struct RecvBuf {
  pub buf: VecDeque<u8>,
  /// Peer sent FIN; no more data after the buffer drains.
  pub eof: bool,
  /// Peer reset the stream.
  pub reset: bool,
  /// `close()` was called on this side.
  pub closed_local: bool,
  /// The multiplexer went away underneath us.
  pub aborted: bool,
  /// Bytes consumed since the last window refill sent to the peer.
  pub consumed: u32,
}

pub(super) struct SendState {
  pub window: u32,
  pub fin_sent: bool,
  pub reset: bool,
  pub aborted: bool,
}

pub(super) struct StreamState {
  pub id: u32,
  pub recv: Mutex<RecvBuf>,
  pub readable: Condvar,
  pub send: Mutex<SendState>,
  pub writable: Condvar,
  pub read_timeout: Mutex<Option<Duration>>,
  pub write_timeout: Mutex<Option<Duration>>,
}

impl StreamState {
  pub fn new(id: u32, window: u32) -> Arc<StreamState> {
    Arc::new(StreamState {
      id,
      recv: Mutex::new(RecvBuf {
        buf: VecDeque::new(),
        eof: false,
        reset: false,
        closed_local: false,
        aborted: false,
        consumed: 0,
      }),
      readable: Condvar::new(),
      send: Mutex::new(SendState {
        window,
        fin_sent: false,
        reset: false,
        aborted: false,
      }),
      writable: Condvar::new(),
      read_timeout: Mutex::new(None),
      write_timeout: Mutex::new(None),
    })
  }

  /// Appends inbound payload, enforcing the advertised receive window.
  pub fn push_data(&self, payload: &[u8], window: u32) -> Result<(), ()> {
    let mut recv = self.recv.lock();
    if recv.closed_local || recv.reset {
      // Data raced our close; drop it.
      return Ok(());
    }
    if recv.buf.len() + payload.len() > window as usize {
      return Err(());
    }
    recv.buf.extend(payload);
    drop(recv);
    self.readable.notify_all();
    Ok(())
  }

  pub fn mark_eof(&self) {
    self.recv.lock().eof = true;
    self.readable.notify_all();
  }

  pub fn mark_reset(&self) {
    self.recv.lock().reset = true;
    self.send.lock().reset = true;
    self.readable.notify_all();
    self.writable.notify_all();
  }

  pub fn add_credit(&self, delta: u32) {
    let mut send = self.send.lock();
    send.window = send.window.saturating_add(delta);
    drop(send);
    self.writable.notify_all();
  }

  /// Fails every pending and future operation; used on mux teardown.
  pub fn abort(&self) {
    self.recv.lock().aborted = true;
    self.send.lock().aborted = true;
    self.readable.notify_all();
    self.writable.notify_all();
  }
}

pub struct Stream {
  pub(super) shared: Arc<Shared>,
  pub(super) state: Arc<StreamState>,
}

impl Clone for Stream {
  fn clone(&self) -> Self {
    Stream {
      shared: self.shared.clone(),
      state: self.state.clone(),
    }
  }
}

impl std::fmt::Debug for Stream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Stream").field("id", &self.state.id).finish()
  }
}

impl Stream {
  pub fn id(&self) -> u32 {
    self.state.id
  }

  /// Closes the stream in both directions. Sends FIN once, wakes local
  /// readers and writers, and forgets the stream on this side. Safe to
  /// call multiple times and from clones.
  pub fn close(&self) {
    let send_fin = {
      let mut send = self.state.send.lock();
      if send.fin_sent || send.reset || send.aborted {
        false
      } else {
        send.fin_sent = true;
        true
      }
    };
    if send_fin {
      let _ = self
        .shared
        .send_frame(Header::fin(self.state.id), &[], None);
    }
    self.state.recv.lock().closed_local = true;
    self.state.readable.notify_all();
    self.state.writable.notify_all();
    self.shared.forget(self.state.id);
  }
}

impl Read for Stream {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    if buf.is_empty() {
      return Ok(0);
    }
    let deadline = self
      .state
      .read_timeout
      .lock()
      .map(|timeout| Instant::now() + timeout);
    let mut recv = self.state.recv.lock();
    loop {
      if !recv.buf.is_empty() {
        let n = buf.len().min(recv.buf.len());
        for (slot, byte) in buf.iter_mut().zip(recv.buf.drain(..n)) {
          *slot = byte;
        }
        recv.consumed = recv.consumed.saturating_add(n as u32);
        let half_window = self.shared.cfg.window / 2;
        let refill = if recv.consumed >= half_window && !recv.eof && !recv.closed_local {
          let delta = recv.consumed;
          recv.consumed = 0;
          Some(delta)
        } else {
          None
        };
        drop(recv);
        if let Some(delta) = refill {
          let _ = self
            .shared
            .send_frame(Header::window_update(self.state.id, delta), &[], None);
        }
        return Ok(n);
      }
      if recv.reset {
        return Err(io::Error::new(
          io::ErrorKind::ConnectionReset,
          "stream reset by peer",
        ));
      }
      if recv.eof || recv.closed_local || recv.aborted {
        return Ok(0);
      }
      match deadline {
        None => {
          self.state.readable.wait(&mut recv);
        }
        Some(deadline) => {
          if self
            .state
            .readable
            .wait_until(&mut recv, deadline)
            .timed_out()
            && recv.buf.is_empty()
            && !recv.eof
            && !recv.reset
            && !recv.closed_local
            && !recv.aborted
          {
            return Err(io::Error::new(
              io::ErrorKind::TimedOut,
              "stream read timed out",
            ));
          }
        }
      }
    }
  }
}

impl Write for Stream {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    if buf.is_empty() {
      return Ok(0);
    }
    let deadline = self
      .state
      .write_timeout
      .lock()
      .map(|timeout| Instant::now() + timeout);
    let mut written = 0usize;
    while written < buf.len() {
      let chunk = {
        let mut send = self.state.send.lock();
        loop {
          if send.aborted {
            return finish_write(written, io::ErrorKind::ConnectionAborted, "multiplexer closed");
          }
          if send.reset {
            return finish_write(written, io::ErrorKind::ConnectionReset, "stream reset by peer");
          }
          if send.fin_sent {
            return finish_write(written, io::ErrorKind::BrokenPipe, "stream closed");
          }
          if send.window > 0 {
            break;
          }
          match deadline {
            None => {
              self.state.writable.wait(&mut send);
            }
            Some(deadline) => {
              if self
                .state
                .writable
                .wait_until(&mut send, deadline)
                .timed_out()
                && send.window == 0
                && !send.aborted
                && !send.reset
                && !send.fin_sent
              {
                return finish_write(written, io::ErrorKind::TimedOut, "stream write timed out");
              }
            }
          }
        }
        let n = (buf.len() - written)
          .min(send.window as usize)
          .min(MAX_DATA_LEN);
        send.window -= n as u32;
        n
      };
      let timeout = *self.state.write_timeout.lock();
      self.shared.send_frame(
        Header::data(self.state.id, chunk as u32),
        &buf[written..written + chunk],
        timeout,
      )?;
      written += chunk;
    }
    Ok(written)
  }

  fn flush(&mut self) -> io::Result<()> {
    self.shared.flush_transport()
  }
}

fn finish_write(written: usize, kind: io::ErrorKind, message: &str) -> io::Result<usize> {
  if written > 0 {
    Ok(written)
  } else {
    Err(io::Error::new(kind, message))
  }
}

impl Conduit for Stream {
  fn try_clone(&self) -> io::Result<Box<dyn Conduit>> {
    Ok(Box::new(self.clone()))
  }

  fn shutdown(&self) -> io::Result<()> {
    self.close();
    Ok(())
  }

  fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
    *self.state.read_timeout.lock() = timeout;
    Ok(())
  }

  fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
    *self.state.write_timeout.lock() = timeout;
    Ok(())
  }
}
