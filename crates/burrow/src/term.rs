//! Terminal helpers for the interactive foreground.
//!
//! Raw mode makes the local terminal transparent: every byte, including
//! control characters, goes to the remote side instead of the local line
//! discipline.

use anyhow::Result;
use crossterm::terminal;

/// Enables raw terminal mode for the lifetime of this guard and restores
/// the previous mode when dropped.
pub struct RawModeGuard;

impl RawModeGuard {
  pub fn enable() -> Result<Self> {
    terminal::enable_raw_mode()?;
    Ok(Self)
  }
}

impl Drop for RawModeGuard {
  fn drop(&mut self) {
    let _ = terminal::disable_raw_mode();
  }
}
