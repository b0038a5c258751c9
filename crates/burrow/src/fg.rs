//! The foreground job: raw stdio or a command, optionally under a pty.
//!
//! The master opens one data stream (two with a pty: data plus a size
//! control stream carrying `WinSize` updates) and splices its stdio into
//! it. The slave either pipes its own stdio, runs the command with piped
//! stdio, or runs it inside a pty and applies the size updates. When the
//! foreground finishes on the master, the whole session is torn down.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::terminal;
use log::debug;
use parking_lot::Mutex;

use crate::cancel::Cancel;
use crate::config::MasterConfig;
use crate::exec;
use crate::mux::Stream;
use crate::net::Conduit;
use crate::pipe::pipe;
use crate::proto::{Message, WinSize, read_frame, write_frame};
use crate::session::SessionCore;
use crate::term::RawModeGuard;

/// How often the master samples the local terminal size.
const SIZE_POLL: Duration = Duration::from_secs(1);

/// Master side: request the foreground from the slave and splice stdio
/// into it. Blocks until the foreground is over.
pub(crate) fn run_master(
  core: &Arc<SessionCore>,
  cfg: &MasterConfig,
  stdio: Box<dyn Conduit>,
) -> io::Result<()> {
  let message = Message::Foreground {
    exec: cfg.exec.clone(),
    pty: cfg.pty,
  };
  if cfg.pty {
    let (data, size_ctl) = core.send_with_stream_pair(&message)?;
    let _raw = match RawModeGuard::enable() {
      Ok(guard) => Some(guard),
      Err(err) => {
        debug!("raw mode unavailable: {err}");
        None
      }
    };
    spawn_size_watcher(size_ctl, core.cancel.clone());
    pipe(stdio, wrap_log(data, cfg.log_file.as_deref())?)
  } else {
    let data = core.send_with_stream(&message)?;
    pipe(stdio, wrap_log(data, cfg.log_file.as_deref())?)
  }
}

fn wrap_log(stream: Stream, log_file: Option<&Path>) -> io::Result<Box<dyn Conduit>> {
  match log_file {
    None => Ok(Box::new(stream)),
    Some(path) => Ok(Box::new(TeeConduit::create(Box::new(stream), path)?)),
  }
}

/// Polls the local terminal size and pushes changes to the slave.
fn spawn_size_watcher(mut size_ctl: Stream, cancel: Cancel) {
  thread::Builder::new()
    .name("fg-winsize".to_string())
    .spawn(move || {
      let mut last = (0u16, 0u16);
      loop {
        if cancel.is_cancelled() {
          return;
        }
        if let Ok((cols, rows)) = terminal::size()
          && (cols, rows) != last
        {
          last = (cols, rows);
          if write_frame(&mut size_ctl, &WinSize { rows, cols }).is_err() {
            return;
          }
        }
        thread::sleep(SIZE_POLL);
      }
    })
    .expect("failed to spawn size watcher");
}

/// Slave side of `Foreground{exec, pty: false}` with a command set.
pub(crate) fn serve_exec(exec: &str, stream: Stream) -> Result<()> {
  let argv = shell_words::split(exec).context("parsing the command line")?;
  exec::run_piped(&argv, stream)
}

/// Slave side of `Foreground{exec, pty: true}`: run the command inside a
/// pty, splice the data stream through it and resize on demand.
pub(crate) fn serve_pty(exec: &str, data: Stream, size_ctl: Stream) -> Result<()> {
  let argv = shell_words::split(exec).context("parsing the command line")?;
  let pty = exec::PtyProcess::spawn(&argv, 24, 80)?;

  let sizer = {
    let pty = pty.clone();
    let mut size_ctl_reader = size_ctl.clone();
    thread::Builder::new()
      .name("fg-resize".to_string())
      .spawn(move || {
        loop {
          match read_frame::<_, WinSize>(&mut size_ctl_reader) {
            Ok(size) => pty.resize(size.rows, size.cols),
            Err(_) => return,
          }
        }
      })
      .expect("failed to spawn resize listener")
  };

  let result = pipe(Box::new(data), Box::new(pty.conduit()));
  pty.kill();
  let _ = pty.wait();
  size_ctl.close();
  let _ = sizer.join();
  result?;
  Ok(())
}

/// Wraps a conduit and appends every byte crossing it, both directions,
/// to a log file. Transparent to the pipe.
pub struct TeeConduit {
  inner: Box<dyn Conduit>,
  file: Arc<Mutex<File>>,
}

impl TeeConduit {
  pub fn create(inner: Box<dyn Conduit>, path: &Path) -> io::Result<TeeConduit> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(TeeConduit {
      inner,
      file: Arc::new(Mutex::new(file)),
    })
  }
}

impl Read for TeeConduit {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    let n = self.inner.read(buf)?;
    if n > 0 {
      let _ = self.file.lock().write_all(&buf[..n]);
    }
    Ok(n)
  }
}

impl Write for TeeConduit {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    let n = self.inner.write(buf)?;
    let _ = self.file.lock().write_all(&buf[..n]);
    Ok(n)
  }

  fn flush(&mut self) -> io::Result<()> {
    let _ = self.file.lock().flush();
    self.inner.flush()
  }
}

impl Conduit for TeeConduit {
  fn try_clone(&self) -> io::Result<Box<dyn Conduit>> {
    Ok(Box::new(TeeConduit {
      inner: self.inner.try_clone()?,
      file: self.file.clone(),
    }))
  }

  fn shutdown(&self) -> io::Result<()> {
    let _ = self.file.lock().flush();
    self.inner.shutdown()
  }

  fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
    self.inner.set_read_timeout(timeout)
  }

  fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
    self.inner.set_write_timeout(timeout)
  }
}
