//! Session establishment and the master/slave control plane.
//!
//! A session owns the multiplexer and the two control streams riding its
//! first two stream slots: the master opens both, sending on the first and
//! receiving on the second; the slave accepts them in the same order. The
//! identity handshake exchanges `Hello` messages under a bounded deadline.
//!
//! Whenever a control message needs data streams, the sender opens them
//! while still holding the control write lock. Sends and opens therefore
//! hit the transport in one order, and the receiver can pair each message
//! with the streams it accepts next. A broken pairing is fatal to the
//! whole session; a partially delivered service is never left running.

mod master;
mod slave;

pub use master::MasterSession;
pub use slave::SlaveSession;

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::Mutex;

use crate::cancel::Cancel;
use crate::config::Tuning;
use crate::error::{SessionError, is_benign};
use crate::mux::{Mux, Stream};
use crate::proto::{ControlChannel, Message};

/// State shared between a session's services and its receive loop.
pub(crate) struct SessionCore {
  pub mux: Mux,
  ctl_out: Mutex<ControlChannel>,
  pub cancel: Cancel,
  pub tuning: Tuning,
}

impl SessionCore {
  pub fn new(mux: Mux, ctl_out: ControlChannel, tuning: Tuning) -> Arc<SessionCore> {
    let cancel = Cancel::new();
    {
      let mux = mux.clone();
      cancel.on_cancel(move || mux.close());
    }
    Arc::new(SessionCore {
      mux,
      ctl_out: Mutex::new(ctl_out),
      cancel,
      tuning,
    })
  }

  /// Sends a control message that needs no data stream.
  pub fn send(&self, message: &Message) -> io::Result<()> {
    self.ctl_out.lock().send(message)
  }

  /// Sends a message and opens its paired data stream while holding the
  /// control write lock, keeping message order and stream order aligned
  /// across concurrent callers.
  pub fn send_with_stream(&self, message: &Message) -> io::Result<Stream> {
    let mut ctl = self.ctl_out.lock();
    ctl.send(message)?;
    self.mux.open()
  }

  /// Two-stream variant for the pty foreground.
  pub fn send_with_stream_pair(&self, message: &Message) -> io::Result<(Stream, Stream)> {
    let mut ctl = self.ctl_out.lock();
    ctl.send(message)?;
    let first = self.mux.open()?;
    let second = self.mux.open()?;
    Ok((first, second))
  }

  /// Accepts the data stream paired with a just-received message. Failing
  /// to get it within the control deadline breaks the pairing invariant.
  pub fn accept_paired(&self) -> Result<Stream, SessionError> {
    self
      .mux
      .accept_timeout(self.tuning.control_op)
      .map_err(|err| SessionError::StreamPairing(err.to_string()))
  }
}

/// Waits for the peer's `Hello`, discarding anything else arriving early.
pub(crate) fn wait_hello(
  ctl: &mut ControlChannel,
  budget: Duration,
) -> Result<String, SessionError> {
  let deadline = Instant::now() + budget;
  loop {
    let now = Instant::now();
    if now >= deadline {
      return Err(SessionError::HandshakeTimeout);
    }
    match ctl.recv_timeout(deadline - now) {
      Ok(Message::Hello { id }) => return Ok(id),
      Ok(other) => debug!("ignoring {} before the handshake finished", other.kind()),
      Err(err) if err.kind() == io::ErrorKind::TimedOut => {
        return Err(SessionError::HandshakeTimeout);
      }
      Err(err) if err.kind() == io::ErrorKind::InvalidData => {
        return Err(SessionError::Decode(err.to_string()));
      }
      Err(err) if is_benign(&err) => return Err(SessionError::HandshakePeerClosed),
      Err(err) => return Err(SessionError::Io(err)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{MasterConfig, SharedConfig, SlaveConfig};
  use std::os::unix::net::UnixStream;
  use std::thread;

  fn shared(id: &str) -> SharedConfig {
    SharedConfig {
      address: "tcp://127.0.0.1:1".parse().expect("addr"),
      id: id.to_string(),
      verbose: false,
      timeout: Duration::from_secs(5),
    }
  }

  fn master_config(id: &str) -> MasterConfig {
    MasterConfig {
      shared: shared(id),
      exec: String::new(),
      pty: false,
      log_file: None,
      locals: Vec::new(),
      remotes: Vec::new(),
      socks: None,
    }
  }

  #[test]
  fn handshake_exchanges_identities() {
    let (near, far) = UnixStream::pair().expect("pair");
    let tuning = Tuning::default();

    let slave = thread::spawn(move || {
      SlaveSession::establish(Box::new(far), &SlaveConfig { shared: shared("bravo") }, tuning)
    });
    let master = MasterSession::establish(Box::new(near), &master_config("alpha"), tuning)
      .expect("master handshake");
    let slave = slave.join().expect("join").expect("slave handshake");

    assert_eq!(master.peer_id(), "bravo");
    assert_eq!(slave.peer_id(), "alpha");
    master.cancel_handle().cancel();
  }

  #[test]
  fn handshake_times_out_against_a_silent_peer() {
    let (near, _far) = UnixStream::pair().expect("pair");
    let tuning = Tuning {
      handshake: Duration::from_millis(200),
      ..Tuning::default()
    };
    let started = Instant::now();
    let err = MasterSession::establish(Box::new(near), &master_config("alpha"), tuning)
      .expect_err("peer never answers");
    assert!(matches!(err, SessionError::HandshakeTimeout));
    assert!(started.elapsed() < Duration::from_secs(5));
  }

  #[test]
  fn handshake_reports_a_closed_peer() {
    let (near, far) = UnixStream::pair().expect("pair");
    drop(far);
    let err = MasterSession::establish(
      Box::new(near),
      &master_config("alpha"),
      Tuning::default(),
    )
    .expect_err("peer is gone");
    assert!(
      matches!(
        err,
        SessionError::HandshakePeerClosed | SessionError::Io(_)
      ),
      "unexpected error: {err}"
    );
  }
}
