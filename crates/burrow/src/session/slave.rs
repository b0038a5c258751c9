//! The executing side of a session.

use std::io;
use std::sync::Arc;
use std::thread;

use log::{debug, error, warn};
use parking_lot::Mutex;

use super::{SessionCore, wait_hello};
use crate::cancel::Cancel;
use crate::config::{Endpoint, ForwardSpec, SlaveConfig, Tuning};
use crate::error::{SessionError, is_benign, is_timeout};
use crate::fg;
use crate::forward;
use crate::mux::{Mux, MuxConfig};
use crate::net::Conduit;
use crate::pipe::pipe;
use crate::proto::{ControlChannel, Message};
use crate::socks;

pub struct SlaveSession {
  core: Arc<SessionCore>,
  ctl_in: Mutex<Option<ControlChannel>>,
  peer_id: String,
}

impl SlaveSession {
  /// Takes the server role on the transport, accepts the two control
  /// streams in the order the master opened them, and answers the
  /// master's `Hello`.
  pub fn establish(
    transport: Box<dyn Conduit>,
    cfg: &SlaveConfig,
    tuning: Tuning,
  ) -> Result<SlaveSession, SessionError> {
    let mux = Mux::server(
      transport,
      MuxConfig {
        keepalive_interval: tuning.keepalive,
        ..MuxConfig::default()
      },
    )?;
    let result = Self::handshake(&mux, cfg, tuning);
    match result {
      Ok((ctl_out, ctl_in, peer_id)) => Ok(SlaveSession {
        core: SessionCore::new(mux, ctl_out, tuning),
        ctl_in: Mutex::new(Some(ctl_in)),
        peer_id,
      }),
      Err(err) => {
        mux.close();
        Err(err)
      }
    }
  }

  fn handshake(
    mux: &Mux,
    cfg: &SlaveConfig,
    tuning: Tuning,
  ) -> Result<(ControlChannel, ControlChannel, String), SessionError> {
    let accept = |what: &str| {
      mux.accept_timeout(tuning.handshake).map_err(|err| {
        if err.kind() == io::ErrorKind::TimedOut {
          SessionError::HandshakeTimeout
        } else {
          debug!("no {what} stream: {err}");
          SessionError::HandshakePeerClosed
        }
      })
    };
    let mut ctl_in = ControlChannel::new(accept("inbound control")?, tuning.control_op);
    let mut ctl_out = ControlChannel::new(accept("outbound control")?, tuning.control_op);
    let peer_id = wait_hello(&mut ctl_in, tuning.handshake)?;
    ctl_out.send(&Message::Hello {
      id: cfg.shared.id.clone(),
    })?;
    Ok((ctl_out, ctl_in, peer_id))
  }

  pub fn peer_id(&self) -> &str {
    &self.peer_id
  }

  pub fn cancel_handle(&self) -> Cancel {
    self.core.cancel.clone()
  }

  /// Dispatches control traffic until the master goes away. `stdio` backs
  /// a stdio foreground if the master requests one.
  pub fn run(&self, stdio: Option<Box<dyn Conduit>>) -> Result<(), SessionError> {
    let mut ctl = self.ctl_in.lock().take().ok_or_else(|| {
      SessionError::Io(io::Error::other("the receive loop is already running"))
    })?;
    let stdio = Mutex::new(stdio);
    let result = loop {
      if self.core.cancel.is_cancelled() {
        break Ok(());
      }
      match ctl.recv_timeout(self.core.tuning.poll) {
        Ok(message) => {
          if let Err(err) = self.dispatch(message, &stdio) {
            break Err(err);
          }
        }
        Err(err) if is_timeout(&err) => {}
        Err(err) if is_benign(&err) => {
          debug!("control stream closed: {err}");
          break Ok(());
        }
        Err(err) if err.kind() == io::ErrorKind::InvalidData => {
          break Err(SessionError::Decode(err.to_string()));
        }
        Err(err) => warn!("control receive failed: {err}"),
      }
    };
    self.core.cancel.cancel();
    result
  }

  fn dispatch(
    &self,
    message: Message,
    stdio: &Mutex<Option<Box<dyn Conduit>>>,
  ) -> Result<(), SessionError> {
    debug!("control message: {}", message.kind());
    match message {
      // A duplicate hello after the handshake carries no information.
      Message::Hello { .. } => {}
      Message::Foreground { exec, pty } => self.start_foreground(exec, pty, stdio)?,
      Message::PortFwd {
        proto,
        local_host,
        local_port,
        remote_host,
        remote_port,
      } => {
        let spec = ForwardSpec {
          proto,
          local: Endpoint::new(local_host, local_port),
          remote: Endpoint::new(remote_host, remote_port),
        };
        if let Err(err) = forward::spawn_listener(self.core.clone(), spec.clone()) {
          warn!("cannot bind remote forward {spec}: {err}");
        }
      }
      Message::Connect { proto, host, port } => {
        let stream = self.core.accept_paired()?;
        let tuning = self.core.tuning;
        let cancel = self.core.cancel.clone();
        thread::Builder::new()
          .name("fwd-dial".to_string())
          .spawn(move || forward::dial_and_pipe(proto, host, port, stream, tuning, cancel))
          .expect("failed to spawn dial thread");
      }
      Message::SocksConnect { host, port } => {
        let stream = self.core.accept_paired()?;
        let dial_timeout = self.core.tuning.control_op;
        thread::Builder::new()
          .name("socks-dial".to_string())
          .spawn(move || socks::connect::dial_side(stream, host, port, dial_timeout))
          .expect("failed to spawn socks dial thread");
      }
      Message::SocksAssociate => {
        let stream = self.core.accept_paired()?;
        let tuning = self.core.tuning;
        let cancel = self.core.cancel.clone();
        thread::Builder::new()
          .name("socks-associate".to_string())
          .spawn(move || socks::associate::dial_side(stream, tuning, cancel))
          .expect("failed to spawn socks associate thread");
      }
      Message::SocksDatagram { .. } => {
        warn!("stray datagram on the control stream, ignoring");
      }
    }
    Ok(())
  }

  fn start_foreground(
    &self,
    exec: String,
    pty: bool,
    stdio: &Mutex<Option<Box<dyn Conduit>>>,
  ) -> Result<(), SessionError> {
    if pty && exec.is_empty() {
      return Err(SessionError::PtyWithoutCommand);
    }
    if pty {
      let data = self.core.accept_paired()?;
      let size_ctl = self.core.accept_paired()?;
      let cleanup = (data.clone(), size_ctl.clone());
      thread::Builder::new()
        .name("fg-pty".to_string())
        .spawn(move || {
          if let Err(err) = fg::serve_pty(&exec, data, size_ctl) {
            error!("pty foreground failed: {err:#}");
          }
          // A spawn failure must not leave the master's pipe hanging.
          cleanup.0.close();
          cleanup.1.close();
        })
        .expect("failed to spawn foreground thread");
    } else if exec.is_empty() {
      let data = self.core.accept_paired()?;
      match stdio.lock().take() {
        Some(local) => {
          thread::Builder::new()
            .name("fg-stdio".to_string())
            .spawn(move || {
              if let Err(err) = pipe(local, Box::new(data)) {
                error!("stdio foreground failed: {err}");
              }
            })
            .expect("failed to spawn foreground thread");
        }
        None => {
          warn!("foreground already running, closing the new stream");
          data.close();
        }
      }
    } else {
      let data = self.core.accept_paired()?;
      let cleanup = data.clone();
      thread::Builder::new()
        .name("fg-exec".to_string())
        .spawn(move || {
          if let Err(err) = fg::serve_exec(&exec, data) {
            error!("foreground command failed: {err:#}");
          }
          cleanup.close();
        })
        .expect("failed to spawn foreground thread");
    }
    Ok(())
  }
}
