use std::io;
use thiserror::Error;

/// Errors that terminate a session or prevent one from being established.
///
/// Per-connection service failures (a refused dial, a malformed SOCKS
/// request) are handled locally and never become a `SessionError`.
#[derive(Debug, Error)]
pub enum SessionError {
  #[error("handshake: timeout")]
  HandshakeTimeout,
  #[error("handshake: peer closed")]
  HandshakePeerClosed,
  #[error("control stream decode failed: {0}")]
  Decode(String),
  #[error("stream pairing broken: {0}")]
  StreamPairing(String),
  #[error("a pty foreground requires a command to execute")]
  PtyWithoutCommand,
  #[error(transparent)]
  Io(#[from] io::Error),
}

/// Whether an IO error indicates normal termination of a connection or
/// stream. Benign errors are swallowed by teardown paths and never logged
/// above debug level.
pub fn is_benign(err: &io::Error) -> bool {
  matches!(
    err.kind(),
    io::ErrorKind::UnexpectedEof
      | io::ErrorKind::BrokenPipe
      | io::ErrorKind::ConnectionReset
      | io::ErrorKind::ConnectionAborted
      | io::ErrorKind::NotConnected
      | io::ErrorKind::TimedOut
      | io::ErrorKind::WouldBlock
  )
}

/// Like `is_benign`, but for read timeouts used as cancellation polls.
/// Both `TimedOut` and `WouldBlock` show up depending on the platform.
pub fn is_timeout(err: &io::Error) -> bool {
  matches!(
    err.kind(),
    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn eof_and_reset_are_benign() {
    assert!(is_benign(&io::Error::from(io::ErrorKind::UnexpectedEof)));
    assert!(is_benign(&io::Error::from(io::ErrorKind::ConnectionReset)));
    assert!(!is_benign(&io::Error::from(io::ErrorKind::PermissionDenied)));
  }

  #[test]
  fn handshake_errors_render_verbatim() {
    assert_eq!(SessionError::HandshakeTimeout.to_string(), "handshake: timeout");
    assert_eq!(
      SessionError::HandshakePeerClosed.to_string(),
      "handshake: peer closed"
    );
  }
}
