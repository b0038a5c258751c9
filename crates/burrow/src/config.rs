//! Configuration records and their command-line syntax.
//!
//! Forward specs use the classic `[U:]LOCALHOST:LPORT:REMOTEHOST:RPORT`
//! notation where a leading `U:` selects UDP. The session address is a
//! `tcp://host:port` URL; other schemes belong to transport layers this
//! build does not ship.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::proto::Proto;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Marker error used to signal that offenders were already reported and
/// the process should exit with the validation code.
#[derive(Debug, Error)]
#[error("invalid configuration")]
pub struct ValidationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
  pub host: String,
  pub port: u16,
}

impl Endpoint {
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Endpoint {
      host: host.into(),
      port,
    }
  }
}

impl fmt::Display for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.host, self.port)
  }
}

impl FromStr for Endpoint {
  type Err = String;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    let (host, port) = value
      .rsplit_once(':')
      .ok_or_else(|| format!("`{value}` is not HOST:PORT"))?;
    if host.is_empty() {
      return Err(format!("`{value}` is missing a host"));
    }
    let port: u16 = port
      .parse()
      .map_err(|_| format!("`{port}` is not a valid port"))?;
    Ok(Endpoint::new(host, port))
  }
}

/// One configured port forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
  pub proto: Proto,
  pub local: Endpoint,
  pub remote: Endpoint,
}

impl fmt::Display for ForwardSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {} -> {}", self.proto, self.local, self.remote)
  }
}

impl FromStr for ForwardSpec {
  type Err = String;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    let (proto, rest) = match value.split_once(':') {
      Some((prefix, rest)) if prefix.eq_ignore_ascii_case("u") => (Proto::Udp, rest),
      _ => (Proto::Tcp, value),
    };
    let parts: Vec<&str> = rest.split(':').collect();
    if parts.len() != 4 {
      return Err(format!(
        "`{value}` is not [U:]LOCALHOST:LPORT:REMOTEHOST:RPORT"
      ));
    }
    let local_port: u16 = parts[1]
      .parse()
      .map_err(|_| format!("`{}` is not a valid port in `{value}`", parts[1]))?;
    let remote_port: u16 = parts[3]
      .parse()
      .map_err(|_| format!("`{}` is not a valid port in `{value}`", parts[3]))?;
    if parts[0].is_empty() || parts[2].is_empty() {
      return Err(format!("`{value}` is missing a host"));
    }
    Ok(ForwardSpec {
      proto,
      local: Endpoint::new(parts[0], local_port),
      remote: Endpoint::new(parts[2], remote_port),
    })
  }
}

/// The session transport address, `tcp://host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
  pub host: String,
  pub port: u16,
}

impl fmt::Display for Address {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "tcp://{}:{}", self.host, self.port)
  }
}

impl FromStr for Address {
  type Err = String;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    let (scheme, rest) = value
      .split_once("://")
      .ok_or_else(|| format!("`{value}` is not SCHEME://HOST:PORT"))?;
    match scheme {
      "tcp" => {}
      "udp" | "ws" | "wss" => {
        return Err(format!(
          "the {scheme} transport is not available in this build; use tcp://"
        ));
      }
      other => return Err(format!("unknown scheme `{other}` in `{value}`")),
    }
    let endpoint: Endpoint = rest.parse()?;
    Ok(Address {
      host: endpoint.host,
      port: endpoint.port,
    })
  }
}

/// Options shared by both roles.
#[derive(Debug, Clone)]
pub struct SharedConfig {
  pub address: Address,
  /// Opaque identity announced in the handshake.
  pub id: String,
  pub verbose: bool,
  /// Ceiling for the handshake and every control operation.
  pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
  pub shared: SharedConfig,
  /// Command for the foreground job; empty pipes raw stdio instead.
  pub exec: String,
  pub pty: bool,
  /// Appends every foreground byte, both directions, to this file.
  pub log_file: Option<PathBuf>,
  pub locals: Vec<ForwardSpec>,
  pub remotes: Vec<ForwardSpec>,
  pub socks: Option<Endpoint>,
}

impl MasterConfig {
  /// Returns every constraint violation, empty when the config is usable.
  pub fn validate(&self) -> Vec<String> {
    let mut offenders = Vec::new();
    if self.pty && self.exec.is_empty() {
      offenders.push("--pty requires --exec; a pty needs a command to run".to_string());
    }
    offenders
  }
}

#[derive(Debug, Clone)]
pub struct SlaveConfig {
  pub shared: SharedConfig,
}

/// Every timeout knob in one place, threaded through constructors so tests
/// can shrink them without touching global state.
#[derive(Debug, Clone, Copy)]
pub struct Tuning {
  /// Budget for the whole identity exchange.
  pub handshake: Duration,
  /// Per-operation bound on control sends, receives and stream accepts.
  pub control_op: Duration,
  /// Budget for each SOCKS negotiation step.
  pub socks_parse: Duration,
  /// Idle cutoff for forwarded UDP flows.
  pub udp_idle: Duration,
  /// Poll interval used wherever a blocking loop checks for cancellation.
  pub poll: Duration,
  /// Multiplexer ping cadence.
  pub keepalive: Duration,
}

impl Default for Tuning {
  fn default() -> Self {
    Tuning {
      handshake: DEFAULT_TIMEOUT,
      control_op: DEFAULT_TIMEOUT,
      socks_parse: Duration::from_secs(5),
      udp_idle: Duration::from_secs(60),
      poll: Duration::from_millis(200),
      keepalive: Duration::from_secs(30),
    }
  }
}

impl Tuning {
  /// Applies the user-facing `--timeout` ceiling to the handshake and
  /// control deadlines.
  pub fn with_ceiling(timeout: Duration) -> Tuning {
    Tuning {
      handshake: timeout,
      control_op: timeout,
      ..Tuning::default()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn forward_spec_defaults_to_tcp() {
    let spec: ForwardSpec = "127.0.0.1:8000:10.0.0.5:9000".parse().expect("parse");
    assert_eq!(spec.proto, Proto::Tcp);
    assert_eq!(spec.local, Endpoint::new("127.0.0.1", 8000));
    assert_eq!(spec.remote, Endpoint::new("10.0.0.5", 9000));
  }

  #[test]
  fn forward_spec_udp_prefix() {
    let spec: ForwardSpec = "U:0.0.0.0:53:1.1.1.1:53".parse().expect("parse");
    assert_eq!(spec.proto, Proto::Udp);
    let spec: ForwardSpec = "u:0.0.0.0:53:1.1.1.1:53".parse().expect("parse");
    assert_eq!(spec.proto, Proto::Udp);
  }

  #[test]
  fn forward_spec_rejects_malformed_input() {
    assert!("127.0.0.1:8000:9000".parse::<ForwardSpec>().is_err());
    assert!("127.0.0.1:eight:host:9000".parse::<ForwardSpec>().is_err());
    assert!(":8000:host:9000".parse::<ForwardSpec>().is_err());
  }

  #[test]
  fn address_accepts_only_tcp() {
    let addr: Address = "tcp://0.0.0.0:4444".parse().expect("parse");
    assert_eq!(addr.host, "0.0.0.0");
    assert_eq!(addr.port, 4444);

    let err = "wss://example.org:443".parse::<Address>().unwrap_err();
    assert!(err.contains("not available"), "unexpected message: {err}");
    assert!("gopher://x:1".parse::<Address>().is_err());
    assert!("plainhost:1".parse::<Address>().is_err());
  }

  #[test]
  fn master_validation_flags_pty_without_exec() {
    let cfg = MasterConfig {
      shared: SharedConfig {
        address: "tcp://127.0.0.1:1".parse().expect("addr"),
        id: "anonymous".to_string(),
        verbose: false,
        timeout: DEFAULT_TIMEOUT,
      },
      exec: String::new(),
      pty: true,
      log_file: None,
      locals: Vec::new(),
      remotes: Vec::new(),
      socks: None,
    };
    let offenders = cfg.validate();
    assert_eq!(offenders.len(), 1);
    assert!(offenders[0].contains("--pty requires --exec"));
  }
}
