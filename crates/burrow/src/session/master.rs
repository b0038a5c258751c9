//! The driving side of a session.

use std::sync::Arc;
use std::thread;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use super::{SessionCore, wait_hello};
use crate::cancel::Cancel;
use crate::config::{ForwardSpec, MasterConfig, Tuning};
use crate::error::{SessionError, is_benign, is_timeout};
use crate::fg;
use crate::forward;
use crate::mux::{Mux, MuxConfig};
use crate::net::Conduit;
use crate::proto::{ControlChannel, Message, Proto};
use crate::socks;

pub struct MasterSession {
  core: Arc<SessionCore>,
  ctl_in: Mutex<Option<ControlChannel>>,
  peer_id: String,
  /// Remote forward specs; the only destinations a slave may ask us to
  /// dial.
  allow: Arc<Vec<ForwardSpec>>,
}

impl std::fmt::Debug for MasterSession {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MasterSession")
      .field("peer_id", &self.peer_id)
      .finish_non_exhaustive()
  }
}

impl MasterSession {
  /// Takes the client role on the transport, opens the two control
  /// streams and exchanges identities.
  pub fn establish(
    transport: Box<dyn Conduit>,
    cfg: &MasterConfig,
    tuning: Tuning,
  ) -> Result<MasterSession, SessionError> {
    let mux = Mux::client(
      transport,
      MuxConfig {
        keepalive_interval: tuning.keepalive,
        ..MuxConfig::default()
      },
    )?;
    let result = Self::handshake(&mux, cfg, tuning);
    match result {
      Ok((ctl_out, ctl_in, peer_id)) => Ok(MasterSession {
        core: SessionCore::new(mux, ctl_out, tuning),
        ctl_in: Mutex::new(Some(ctl_in)),
        peer_id,
        allow: Arc::new(cfg.remotes.clone()),
      }),
      Err(err) => {
        mux.close();
        Err(err)
      }
    }
  }

  fn handshake(
    mux: &Mux,
    cfg: &MasterConfig,
    tuning: Tuning,
  ) -> Result<(ControlChannel, ControlChannel, String), SessionError> {
    let mut ctl_out = ControlChannel::new(mux.open()?, tuning.control_op);
    let mut ctl_in = ControlChannel::new(mux.open()?, tuning.control_op);
    ctl_out.send(&Message::Hello {
      id: cfg.shared.id.clone(),
    })?;
    let peer_id = wait_hello(&mut ctl_in, tuning.handshake)?;
    Ok((ctl_out, ctl_in, peer_id))
  }

  pub fn peer_id(&self) -> &str {
    &self.peer_id
  }

  pub fn cancel_handle(&self) -> Cancel {
    self.core.cancel.clone()
  }

  /// Runs the whole master side and returns when the session is over.
  /// Remote forwards are announced first, local services started next,
  /// and the foreground job goes last; when it finishes, everything else
  /// is torn down with it.
  pub fn run(&self, cfg: &MasterConfig, stdio: Box<dyn Conduit>) -> Result<(), SessionError> {
    for spec in &cfg.remotes {
      self.core.send(&Message::PortFwd {
        proto: spec.proto,
        local_host: spec.local.host.clone(),
        local_port: spec.local.port,
        remote_host: spec.remote.host.clone(),
        remote_port: spec.remote.port,
      })?;
      info!("requested remote forward {spec}");
    }
    forward::spawn_listeners(&self.core, &cfg.locals)?;
    if let Some(socks) = &cfg.socks {
      socks::spawn_server(&self.core, socks)?;
    }

    let receiver = self.ctl_in.lock().take().map(|ctl| {
      let core = self.core.clone();
      let allow = self.allow.clone();
      thread::Builder::new()
        .name("master-recv".to_string())
        .spawn(move || receive_loop(core, allow, ctl))
        .expect("failed to spawn receive loop")
    });

    let result = fg::run_master(&self.core, cfg, stdio);
    self.core.cancel.cancel();
    if let Some(handle) = receiver {
      let _ = handle.join();
    }
    result.map_err(SessionError::Io)
  }
}

/// Handles control traffic from the slave. The only messages a slave may
/// initiate are `Connect` requests for configured remote forwards.
fn receive_loop(core: Arc<SessionCore>, allow: Arc<Vec<ForwardSpec>>, mut ctl: ControlChannel) {
  loop {
    if core.cancel.is_cancelled() {
      return;
    }
    match ctl.recv_timeout(core.tuning.poll) {
      Ok(Message::Connect { proto, host, port }) => {
        if handle_connect(&core, &allow, proto, host, port).is_err() {
          return;
        }
      }
      // A duplicate hello after the handshake carries no information.
      Ok(Message::Hello { .. }) => {}
      Ok(other) => warn!("unexpected {} message from the slave", other.kind()),
      Err(err) if is_timeout(&err) => {}
      Err(err) if is_benign(&err) => {
        debug!("control stream closed: {err}");
        core.cancel.cancel();
        return;
      }
      // A stream that no longer frames correctly cannot be trusted.
      Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
        error!("control stream decode failed: {err}");
        core.cancel.cancel();
        return;
      }
      Err(err) => warn!("control receive failed: {err}"),
    }
  }
}

fn handle_connect(
  core: &Arc<SessionCore>,
  allow: &[ForwardSpec],
  proto: Proto,
  host: String,
  port: u16,
) -> Result<(), ()> {
  // The slave opened the data stream right after sending the message, so
  // it must be accepted even if the request is then refused.
  let stream = match core.accept_paired() {
    Ok(stream) => stream,
    Err(err) => {
      error!("{err}");
      core.cancel.cancel();
      return Err(());
    }
  };
  let allowed = allow
    .iter()
    .any(|spec| spec.proto == proto && spec.remote.host == host && spec.remote.port == port);
  if !allowed {
    warn!("dropping connect to {proto} {host}:{port}: not in the remote forward list");
    stream.close();
    return Ok(());
  }
  let tuning = core.tuning;
  let cancel = core.cancel.clone();
  thread::Builder::new()
    .name("fwd-dial".to_string())
    .spawn(move || forward::dial_and_pipe(proto, host, port, stream, tuning, cancel))
    .expect("failed to spawn dial thread");
  Ok(())
}
