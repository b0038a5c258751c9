//! Multiplexed remote shell, port forwarding and SOCKS5 proxying over a
//! single connection.
//!
//! Two processes form a session: a *master* that drives and a *slave*
//! that executes. Either side may listen or connect; once the transport
//! is up, the master multiplexes an interactive foreground (raw stdio or
//! a command, optionally under a pty), TCP and UDP port forwards in both
//! directions, and a SOCKS5 proxy across it. Typed control messages ride
//! two dedicated streams; every service gets its own data streams.

pub mod cancel;
pub mod config;
pub mod error;
pub mod exec;
pub mod fg;
pub mod forward;
pub mod mux;
pub mod net;
pub mod pipe;
pub mod proto;
pub mod session;
pub mod socks;
pub mod term;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info};

use config::{
  Address, Endpoint, ForwardSpec, MasterConfig, SharedConfig, SlaveConfig, Tuning,
  ValidationError,
};
use net::StdioConduit;
use session::{MasterSession, SlaveSession};

/// Burrow - remote shell and tunneling over one multiplexed connection.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
  #[command(subcommand)]
  pub role: Role,
}

#[derive(Debug, Subcommand)]
pub enum Role {
  /// Drive the session: run the foreground and issue service requests.
  Master {
    #[command(subcommand)]
    mode: MasterMode,
  },
  /// Execute whatever the master asks for.
  Slave {
    #[command(subcommand)]
    mode: SlaveMode,
  },
}

#[derive(Debug, Subcommand)]
pub enum MasterMode {
  /// Bind the address and wait for the slave.
  Listen(MasterArgs),
  /// Connect out to a listening slave.
  Connect(MasterArgs),
}

#[derive(Debug, Subcommand)]
pub enum SlaveMode {
  /// Bind the address and wait for the master.
  Listen(SlaveArgs),
  /// Connect out to a listening master.
  Connect(SlaveArgs),
}

#[derive(Debug, Args)]
pub struct MasterArgs {
  /// Transport address, e.g. tcp://0.0.0.0:4444
  pub addr: String,
  /// Command for the foreground job; omit to pipe raw stdio instead
  #[arg(long, default_value = "")]
  pub exec: String,
  /// Run the foreground command inside a pty on the slave
  #[arg(long)]
  pub pty: bool,
  /// Append every foreground byte, both directions, to this file
  #[arg(long, value_name = "FILE")]
  pub log_file: Option<PathBuf>,
  /// Local forward [U:]LOCALHOST:LPORT:REMOTEHOST:RPORT, repeatable
  #[arg(short = 'L', value_name = "SPEC")]
  pub local: Vec<String>,
  /// Remote forward [U:]LOCALHOST:LPORT:REMOTEHOST:RPORT, repeatable
  #[arg(short = 'R', value_name = "SPEC")]
  pub remote: Vec<String>,
  /// SOCKS5 proxy bind address HOST:PORT
  #[arg(short = 'D', long = "socks", value_name = "ADDR")]
  pub socks: Option<String>,
  #[command(flatten)]
  pub shared: SharedArgs,
}

#[derive(Debug, Args)]
pub struct SlaveArgs {
  /// Transport address, e.g. tcp://0.0.0.0:4444
  pub addr: String,
  #[command(flatten)]
  pub shared: SharedArgs,
}

#[derive(Debug, Args)]
pub struct SharedArgs {
  /// Opaque identity announced to the peer
  #[arg(long, default_value = "anonymous")]
  pub id: String,
  /// Handshake and control deadline ceiling, in seconds
  #[arg(long, default_value_t = 10)]
  pub timeout: u64,
  /// Log at debug level
  #[arg(short, long)]
  pub verbose: bool,
}

pub fn run() -> Result<()> {
  let cli = Cli::parse();
  match cli.role {
    Role::Master { mode } => {
      let (listen, args) = match mode {
        MasterMode::Listen(args) => (true, args),
        MasterMode::Connect(args) => (false, args),
      };
      init_logging(args.shared.verbose);
      let cfg = build_master_config(&args)?;
      run_master(listen, cfg)
    }
    Role::Slave { mode } => {
      let (listen, args) = match mode {
        SlaveMode::Listen(args) => (true, args),
        SlaveMode::Connect(args) => (false, args),
      };
      init_logging(args.shared.verbose);
      let cfg = build_slave_config(&args)?;
      run_slave(listen, cfg)
    }
  }
}

fn init_logging(verbose: bool) {
  let default = if verbose { "debug" } else { "info" };
  let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
    .format_timestamp_secs()
    .try_init();
}

fn build_shared(
  addr: &str,
  shared: &SharedArgs,
  offenders: &mut Vec<String>,
) -> Option<SharedConfig> {
  match addr.parse::<Address>() {
    Ok(address) => Some(SharedConfig {
      address,
      id: shared.id.clone(),
      verbose: shared.verbose,
      timeout: Duration::from_secs(shared.timeout.max(1)),
    }),
    Err(err) => {
      offenders.push(err);
      None
    }
  }
}

fn build_master_config(args: &MasterArgs) -> Result<MasterConfig> {
  let mut offenders = Vec::new();
  let shared = build_shared(&args.addr, &args.shared, &mut offenders);

  let mut locals = Vec::new();
  for spec in &args.local {
    match spec.parse::<ForwardSpec>() {
      Ok(spec) => locals.push(spec),
      Err(err) => offenders.push(err),
    }
  }
  let mut remotes = Vec::new();
  for spec in &args.remote {
    match spec.parse::<ForwardSpec>() {
      Ok(spec) => remotes.push(spec),
      Err(err) => offenders.push(err),
    }
  }
  let socks = match &args.socks {
    None => None,
    Some(spec) => match spec.parse::<Endpoint>() {
      Ok(endpoint) => Some(endpoint),
      Err(err) => {
        offenders.push(err);
        None
      }
    },
  };

  let cfg = shared.map(|shared| MasterConfig {
    shared,
    exec: args.exec.clone(),
    pty: args.pty,
    log_file: args.log_file.clone(),
    locals,
    remotes,
    socks,
  });
  if let Some(cfg) = &cfg {
    offenders.extend(cfg.validate());
  }
  report_offenders(offenders)?;
  cfg.ok_or_else(|| ValidationError.into())
}

fn build_slave_config(args: &SlaveArgs) -> Result<SlaveConfig> {
  let mut offenders = Vec::new();
  let shared = build_shared(&args.addr, &args.shared, &mut offenders);
  report_offenders(offenders)?;
  shared
    .map(|shared| SlaveConfig { shared })
    .ok_or_else(|| ValidationError.into())
}

/// Lists every offender before failing, so one run surfaces all of them.
fn report_offenders(offenders: Vec<String>) -> Result<()> {
  if offenders.is_empty() {
    return Ok(());
  }
  for offender in &offenders {
    error!("{offender}");
  }
  Err(ValidationError.into())
}

fn run_master(listen: bool, cfg: MasterConfig) -> Result<()> {
  let tuning = Tuning::with_ceiling(cfg.shared.timeout);
  let transport = establish_transport(listen, &cfg.shared.address)?;
  let remote = peer_name(&transport);
  let session = MasterSession::establish(Box::new(transport), &cfg, tuning)?;
  info!("session established with {} at {remote}", session.peer_id());
  let result = session.run(&cfg, Box::new(StdioConduit::new()));
  info!("session with {remote} closed");
  result.map_err(Into::into)
}

fn run_slave(listen: bool, cfg: SlaveConfig) -> Result<()> {
  let tuning = Tuning::with_ceiling(cfg.shared.timeout);
  let transport = establish_transport(listen, &cfg.shared.address)?;
  let remote = peer_name(&transport);
  let session = SlaveSession::establish(Box::new(transport), &cfg, tuning)?;
  info!("session established with {} at {remote}", session.peer_id());
  let result = session.run(Some(Box::new(StdioConduit::new())));
  info!("session with {remote} closed");
  result.map_err(Into::into)
}

fn peer_name(transport: &std::net::TcpStream) -> String {
  transport
    .peer_addr()
    .map(|addr| addr.to_string())
    .unwrap_or_else(|_| "unknown".to_string())
}

fn establish_transport(listen: bool, address: &Address) -> Result<std::net::TcpStream> {
  if listen {
    info!("listening on {address}");
    net::listen_one(address, &cancel::Cancel::new()).context("waiting for a peer")
  } else {
    info!("connecting to {address}");
    net::connect(address).with_context(|| format!("connecting to {address}"))
  }
}
