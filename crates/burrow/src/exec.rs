//! Host services for running commands: plain pipes or a pty.

use std::io::{self, Read, Write};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::debug;
use parking_lot::Mutex;
use portable_pty::{CommandBuilder, ExitStatus, MasterPty, PtySize, native_pty_system};

use crate::mux::Stream;
use crate::net::Conduit;

/// Runs a command with piped stdio, splicing the stream into its stdin
/// and both of its output pipes. Returns once the command exits and the
/// pumps drained.
pub fn run_piped(argv: &[String], stream: Stream) -> Result<()> {
  if argv.is_empty() {
    bail!("empty command");
  }
  let mut child = Command::new(&argv[0])
    .args(&argv[1..])
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .spawn()
    .with_context(|| format!("spawning {}", argv[0]))?;
  let mut stdin = child.stdin.take().context("child stdin missing")?;
  let mut stdout = child.stdout.take().context("child stdout missing")?;
  let mut stderr = child.stderr.take().context("child stderr missing")?;

  let mut from_tunnel = stream.clone();
  let input = thread::Builder::new()
    .name("exec-stdin".to_string())
    .spawn(move || {
      let mut buf = [0u8; 8192];
      loop {
        match from_tunnel.read(&mut buf) {
          Ok(0) | Err(_) => break,
          Ok(n) => {
            if stdin.write_all(&buf[..n]).is_err() {
              break;
            }
          }
        }
      }
      // Dropping stdin sends EOF to the child.
    })
    .expect("failed to spawn stdin pump");

  let output = spawn_output_pump("exec-stdout", move |buf| stdout.read(buf), stream.clone());
  let errors = spawn_output_pump("exec-stderr", move |buf| stderr.read(buf), stream.clone());

  let status = child.wait().context("waiting for the command")?;
  debug!("command exited with {status}");
  let _ = output.join();
  let _ = errors.join();
  stream.close();
  let _ = input.join();
  Ok(())
}

fn spawn_output_pump(
  name: &str,
  mut read: impl FnMut(&mut [u8]) -> io::Result<usize> + Send + 'static,
  mut stream: Stream,
) -> thread::JoinHandle<()> {
  thread::Builder::new()
    .name(name.to_string())
    .spawn(move || {
      let mut buf = [0u8; 8192];
      loop {
        match read(&mut buf) {
          Ok(0) | Err(_) => break,
          Ok(n) => {
            if stream.write_all(&buf[..n]).is_err() {
              break;
            }
          }
        }
      }
    })
    .expect("failed to spawn output pump")
}

/// A command running inside a pty. Handles are clonable so the resize
/// listener and the data pump can live on different threads.
#[derive(Clone)]
pub struct PtyProcess {
  master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
  reader: Arc<Mutex<Box<dyn Read + Send>>>,
  writer: Arc<Mutex<Box<dyn Write + Send>>>,
  child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
  killer: Arc<Mutex<Box<dyn portable_pty::ChildKiller + Send + Sync>>>,
}

impl PtyProcess {
  pub fn spawn(argv: &[String], rows: u16, cols: u16) -> Result<PtyProcess> {
    if argv.is_empty() {
      bail!("empty command");
    }
    let pty_system = native_pty_system();
    let pair = pty_system.openpty(PtySize {
      rows,
      cols,
      pixel_width: 0,
      pixel_height: 0,
    })?;
    let mut builder = CommandBuilder::new(&argv[0]);
    for arg in &argv[1..] {
      builder.arg(arg);
    }
    let child = pair.slave.spawn_command(builder)?;
    drop(pair.slave);

    let master: Box<dyn MasterPty + Send> = pair.master;
    let writer = master.take_writer().context("failed to take pty writer")?;
    let reader = master
      .try_clone_reader()
      .context("failed to clone pty reader")?;
    let killer = child.clone_killer();
    Ok(PtyProcess {
      master: Arc::new(Mutex::new(master)),
      reader: Arc::new(Mutex::new(reader)),
      writer: Arc::new(Mutex::new(writer)),
      child: Arc::new(Mutex::new(child)),
      killer: Arc::new(Mutex::new(killer)),
    })
  }

  pub fn resize(&self, rows: u16, cols: u16) {
    let _ = self.master.lock().resize(PtySize {
      rows,
      cols,
      pixel_width: 0,
      pixel_height: 0,
    });
  }

  pub fn kill(&self) {
    let _ = self.killer.lock().kill();
  }

  pub fn wait(&self) -> io::Result<ExitStatus> {
    self.child.lock().wait()
  }

  /// The pty master as a conduit; shutting it down kills the child.
  pub fn conduit(&self) -> PtyConduit {
    PtyConduit {
      reader: self.reader.clone(),
      writer: self.writer.clone(),
      killer: self.killer.clone(),
    }
  }
}

pub struct PtyConduit {
  reader: Arc<Mutex<Box<dyn Read + Send>>>,
  writer: Arc<Mutex<Box<dyn Write + Send>>>,
  killer: Arc<Mutex<Box<dyn portable_pty::ChildKiller + Send + Sync>>>,
}

impl Read for PtyConduit {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.reader.lock().read(buf)
  }
}

impl Write for PtyConduit {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.writer.lock().write(buf)
  }

  fn flush(&mut self) -> io::Result<()> {
    self.writer.lock().flush()
  }
}

impl Conduit for PtyConduit {
  fn try_clone(&self) -> io::Result<Box<dyn Conduit>> {
    Ok(Box::new(PtyConduit {
      reader: self.reader.clone(),
      writer: self.writer.clone(),
      killer: self.killer.clone(),
    }))
  }

  fn shutdown(&self) -> io::Result<()> {
    let _ = self.killer.lock().kill();
    Ok(())
  }

  fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
    Ok(())
  }

  fn set_write_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
    Ok(())
  }
}
