//! Typed control messages and their wire framing.
//!
//! Every message is a tagged enum value encoded with bincode behind a
//! little-endian `u32` length prefix, so a receiver can decode whatever
//! arrives without prior agreement on the type. The same framing carries
//! the terminal-size updates on the pty control stream and the datagram
//! envelopes inside SOCKS relay streams.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use crate::error::is_timeout;
use crate::mux::Stream;
use crate::net::Conduit;

/// Number of bytes in the frame header (little-endian `u32`).
pub const FRAME_HEADER_LEN: usize = 4;

/// Upper bound on a single frame; anything larger is a decode error.
const MAX_FRAME_LEN: usize = 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Transport protocol of a forwarded connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Proto {
  Tcp,
  Udp,
}

impl fmt::Display for Proto {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Proto::Tcp => f.write_str("tcp"),
      Proto::Udp => f.write_str("udp"),
    }
  }
}

/// Control messages exchanged between master and slave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
  /// Identity exchange during the handshake. The id is opaque.
  Hello { id: String },
  /// Start the foreground job: run `exec` (or pipe stdio when empty),
  /// with a pty when requested. Opens one data stream, plus a size
  /// control stream in pty mode.
  Foreground { exec: String, pty: bool },
  /// Ask the slave to bind a listener and tunnel everything it accepts.
  PortFwd {
    proto: Proto,
    local_host: String,
    local_port: u16,
    remote_host: String,
    remote_port: u16,
  },
  /// Ask the receiver to dial a target and splice it to the next data
  /// stream.
  Connect { proto: Proto, host: String, port: u16 },
  /// SOCKS CONNECT: dial, answer with an RFC 1928 reply on the stream,
  /// then splice.
  SocksConnect { host: String, port: u16 },
  /// SOCKS UDP ASSOCIATE: open a relay socket and translate datagrams.
  SocksAssociate,
  /// One relayed UDP datagram inside an associate stream.
  SocksDatagram {
    host: String,
    port: u16,
    data: Vec<u8>,
  },
}

impl Message {
  /// Short name for log lines.
  pub fn kind(&self) -> &'static str {
    match self {
      Message::Hello { .. } => "hello",
      Message::Foreground { .. } => "foreground",
      Message::PortFwd { .. } => "portfwd",
      Message::Connect { .. } => "connect",
      Message::SocksConnect { .. } => "socks-connect",
      Message::SocksAssociate => "socks-associate",
      Message::SocksDatagram { .. } => "socks-datagram",
    }
  }
}

/// Terminal size update carried on the pty control stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinSize {
  pub rows: u16,
  pub cols: u16,
}

/// Writes one framed payload to the given writer.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, payload: &T) -> io::Result<()> {
  let data = bincode::serde::encode_to_vec(payload, bincode::config::standard())
    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, format!("encode frame: {err}")))?;
  let len = data.len() as u32;
  writer.write_all(&len.to_le_bytes())?;
  writer.write_all(&data)?;
  Ok(())
}

/// Reads one framed payload from the given reader.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> io::Result<T> {
  let mut header = [0u8; FRAME_HEADER_LEN];
  reader.read_exact(&mut header)?;
  let len = u32::from_le_bytes(header) as usize;
  if len > MAX_FRAME_LEN {
    return Err(io::Error::new(
      io::ErrorKind::InvalidData,
      format!("frame of {len} bytes exceeds the limit"),
    ));
  }
  let mut buf = vec![0u8; len];
  reader.read_exact(&mut buf)?;
  decode_slice(&buf)
}

fn decode_slice<T: DeserializeOwned>(buf: &[u8]) -> io::Result<T> {
  let (value, _): (T, usize) =
    bincode::serde::decode_from_slice(buf, bincode::config::standard())
      .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, format!("decode frame: {err}")))?;
  Ok(value)
}

/// One direction of the control plane, riding a dedicated stream.
///
/// Receiving buffers partial frames across calls, so a poll timeout in the
/// middle of a frame never desynchronizes the stream. Writers serialize at
/// a higher level; a channel itself has one owner.
pub struct ControlChannel {
  stream: Stream,
  buf: Vec<u8>,
  op_deadline: Duration,
}

impl ControlChannel {
  pub fn new(stream: Stream, op_deadline: Duration) -> Self {
    Self {
      stream,
      buf: Vec::new(),
      op_deadline,
    }
  }

  /// Sends one message, bounded by the control-op deadline.
  pub fn send(&mut self, message: &Message) -> io::Result<()> {
    self
      .stream
      .set_write_timeout(Some(self.op_deadline))?;
    write_frame(&mut self.stream, message)
  }

  /// Receives one message, waiting at most `timeout` (capped by the
  /// control-op deadline). Returns `TimedOut` when nothing complete
  /// arrived in time; any partial frame stays buffered for the next call.
  pub fn recv_timeout(&mut self, timeout: Duration) -> io::Result<Message> {
    let deadline = Instant::now() + timeout.min(self.op_deadline);
    loop {
      if let Some(message) = self.try_decode()? {
        return Ok(message);
      }
      let now = Instant::now();
      if now >= deadline {
        return Err(io::Error::new(
          io::ErrorKind::TimedOut,
          "control receive timed out",
        ));
      }
      self.stream.set_read_timeout(Some(deadline - now))?;
      let mut chunk = [0u8; READ_CHUNK];
      match self.stream.read(&mut chunk) {
        Ok(0) => {
          return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "control stream closed",
          ));
        }
        Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
        Err(err) if is_timeout(&err) => {
          return Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "control receive timed out",
          ));
        }
        Err(err) => return Err(err),
      }
    }
  }

  /// Closes the underlying stream.
  pub fn close(&self) {
    self.stream.close();
  }

  fn try_decode(&mut self) -> io::Result<Option<Message>> {
    if self.buf.len() < FRAME_HEADER_LEN {
      return Ok(None);
    }
    let len =
      u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
    if len > MAX_FRAME_LEN {
      return Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("control frame of {len} bytes exceeds the limit"),
      ));
    }
    if self.buf.len() < FRAME_HEADER_LEN + len {
      return Ok(None);
    }
    let message = decode_slice(&self.buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len])?;
    self.buf.drain(..FRAME_HEADER_LEN + len);
    Ok(Some(message))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mux::{Mux, MuxConfig};
  use std::os::unix::net::UnixStream;

  fn stream_pair() -> (Stream, Stream, Mux, Mux) {
    let (near, far) = UnixStream::pair().expect("socket pair");
    let client = Mux::client(Box::new(near), MuxConfig::default()).expect("client");
    let server = Mux::server(Box::new(far), MuxConfig::default()).expect("server");
    let outbound = client.open().expect("open");
    let inbound = server.accept().expect("accept");
    (outbound, inbound, client, server)
  }

  #[test]
  fn tagged_messages_decode_without_prior_agreement() {
    let (tx, rx, _c, _s) = stream_pair();
    let mut out = ControlChannel::new(tx, Duration::from_secs(5));
    let mut inc = ControlChannel::new(rx, Duration::from_secs(5));

    let messages = vec![
      Message::Hello {
        id: "alpha".to_string(),
      },
      Message::Foreground {
        exec: "/bin/sh".to_string(),
        pty: true,
      },
      Message::Connect {
        proto: Proto::Udp,
        host: "10.0.0.1".to_string(),
        port: 53,
      },
      Message::SocksDatagram {
        host: "example.org".to_string(),
        port: 4242,
        data: vec![1, 2, 3, 4],
      },
    ];
    for message in &messages {
      out.send(message).expect("send");
    }
    for expected in &messages {
      let got = inc.recv_timeout(Duration::from_secs(2)).expect("recv");
      assert_eq!(&got, expected);
    }
  }

  #[test]
  fn recv_times_out_when_nothing_arrives() {
    let (_tx, rx, _c, _s) = stream_pair();
    let mut inc = ControlChannel::new(rx, Duration::from_secs(5));
    let before = Instant::now();
    let err = inc
      .recv_timeout(Duration::from_millis(100))
      .expect_err("nothing was sent");
    assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    assert!(before.elapsed() < Duration::from_secs(2));
  }

  #[test]
  fn partial_frames_survive_a_poll_timeout() {
    let (mut tx, rx, _c, _s) = stream_pair();
    let mut inc = ControlChannel::new(rx, Duration::from_secs(5));

    let mut encoded = Vec::new();
    write_frame(
      &mut encoded,
      &Message::Hello {
        id: "split".to_string(),
      },
    )
    .expect("encode");

    // First half only: the receiver must time out and keep the bytes.
    tx.write_all(&encoded[..3]).expect("write prefix");
    let err = inc
      .recv_timeout(Duration::from_millis(80))
      .expect_err("frame is incomplete");
    assert_eq!(err.kind(), io::ErrorKind::TimedOut);

    tx.write_all(&encoded[3..]).expect("write rest");
    let got = inc.recv_timeout(Duration::from_secs(2)).expect("recv");
    assert_eq!(
      got,
      Message::Hello {
        id: "split".to_string()
      }
    );
  }

  #[test]
  fn oversized_frames_are_a_decode_error() {
    let (mut tx, rx, _c, _s) = stream_pair();
    let mut inc = ControlChannel::new(rx, Duration::from_secs(5));
    tx.write_all(&(u32::MAX).to_le_bytes()).expect("write");
    let err = inc
      .recv_timeout(Duration::from_secs(1))
      .expect_err("oversized");
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
  }

  #[test]
  fn winsize_uses_the_same_framing() {
    let (mut tx, mut rx, _c, _s) = stream_pair();
    write_frame(&mut tx, &WinSize { rows: 50, cols: 132 }).expect("send");
    let size: WinSize = read_frame(&mut rx).expect("recv");
    assert_eq!(size, WinSize { rows: 50, cols: 132 });
  }
}
