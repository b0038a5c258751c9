//! Bidirectional copy between two conduits.
//!
//! Both directions are pumped concurrently. The first direction to finish,
//! whether by end-of-stream or error, shuts both endpoints down exactly
//! once, which unblocks the opposite direction. The call returns the first
//! non-benign error, or `Ok` for a normal teardown.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use log::debug;
use parking_lot::Mutex;

use crate::error::is_benign;
use crate::net::Conduit;

const COPY_BUF: usize = 16 * 1024;

/// Shuts both endpoints down at most once, from whichever direction
/// finishes first.
#[derive(Clone)]
struct Closer {
  done: Arc<AtomicBool>,
  endpoints: Arc<Mutex<(Box<dyn Conduit>, Box<dyn Conduit>)>>,
}

impl Closer {
  fn new(a: Box<dyn Conduit>, b: Box<dyn Conduit>) -> Self {
    Self {
      done: Arc::new(AtomicBool::new(false)),
      endpoints: Arc::new(Mutex::new((a, b))),
    }
  }

  fn close_both(&self) {
    if self.done.swap(true, Ordering::SeqCst) {
      return;
    }
    let guard = self.endpoints.lock();
    let _ = guard.0.shutdown();
    let _ = guard.1.shutdown();
  }
}

/// Copies `a <-> b` until either side terminates, then closes both.
pub fn pipe(a: Box<dyn Conduit>, b: Box<dyn Conduit>) -> io::Result<()> {
  let a_read = a.try_clone()?;
  let a_write = a.try_clone()?;
  let b_read = b.try_clone()?;
  let b_write = b.try_clone()?;
  let closer = Closer::new(a, b);

  let forward_closer = closer.clone();
  let forward = thread::Builder::new()
    .name("pipe-forward".to_string())
    .spawn(move || {
      let result = copy_until_close(a_read, b_write);
      forward_closer.close_both();
      result
    })
    .expect("failed to spawn pipe thread");

  let back_result = copy_until_close(b_read, a_write);
  closer.close_both();

  let forward_result = forward.join().unwrap_or(Ok(()));
  first_real_error(back_result, forward_result)
}

/// One copy direction. Benign read/write errors end the direction cleanly.
fn copy_until_close(mut reader: Box<dyn Conduit>, mut writer: Box<dyn Conduit>) -> io::Result<()> {
  let mut buf = [0u8; COPY_BUF];
  loop {
    let n = match reader.read(&mut buf) {
      Ok(0) => return Ok(()),
      Ok(n) => n,
      Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
      Err(err) if is_benign(&err) => {
        debug!("copy read ended: {err}");
        return Ok(());
      }
      Err(err) => return Err(err),
    };
    match writer.write_all(&buf[..n]).and_then(|()| writer.flush()) {
      Ok(()) => {}
      Err(err) if is_benign(&err) => {
        debug!("copy write ended: {err}");
        return Ok(());
      }
      Err(err) => return Err(err),
    }
  }
}

fn first_real_error(first: io::Result<()>, second: io::Result<()>) -> io::Result<()> {
  match (first, second) {
    (Err(err), _) => Err(err),
    (Ok(()), Err(err)) => Err(err),
    (Ok(()), Ok(())) => Ok(()),
  }
}
