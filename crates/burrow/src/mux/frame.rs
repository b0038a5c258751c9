//! Multiplexer wire format.
//!
//! Every frame starts with a fixed 12-byte big-endian header:
//!
//! ```text
//! | version u8 | type u8 | flags u16 | stream id u32 | length u32 |
//! ```
//!
//! For `Data` frames `length` counts payload bytes that follow the header.
//! For `WindowUpdate` it is a credit delta, for `Ping` an opaque value
//! echoed by the `ACK` reply, and for `GoAway` it is unused.

use std::fmt;
use std::io;

pub(crate) const HEADER_LEN: usize = 12;
pub(crate) const VERSION: u8 = 0;

/// Initial flow-control window per stream and direction.
pub const INITIAL_WINDOW: u32 = 256 * 1024;
/// Largest payload carried by a single `Data` frame.
pub(crate) const MAX_DATA_LEN: usize = 16 * 1024;

pub(crate) mod flags {
  /// First frame of a new stream.
  pub const SYN: u16 = 0x1;
  /// Reply marker, currently only used by ping echoes.
  pub const ACK: u16 = 0x2;
  /// Sender is done writing to this stream.
  pub const FIN: u16 = 0x4;
  /// Stream torn down abruptly.
  pub const RST: u16 = 0x8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameType {
  Data,
  WindowUpdate,
  Ping,
  GoAway,
}

impl FrameType {
  fn from_u8(value: u8) -> Option<FrameType> {
    match value {
      0x0 => Some(FrameType::Data),
      0x1 => Some(FrameType::WindowUpdate),
      0x2 => Some(FrameType::Ping),
      0x3 => Some(FrameType::GoAway),
      _ => None,
    }
  }

  fn as_u8(self) -> u8 {
    match self {
      FrameType::Data => 0x0,
      FrameType::WindowUpdate => 0x1,
      FrameType::Ping => 0x2,
      FrameType::GoAway => 0x3,
    }
  }
}

impl fmt::Display for FrameType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      FrameType::Data => "data",
      FrameType::WindowUpdate => "window-update",
      FrameType::Ping => "ping",
      FrameType::GoAway => "goaway",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
  pub ty: FrameType,
  pub flags: u16,
  pub stream_id: u32,
  pub length: u32,
}

impl Header {
  pub fn syn(stream_id: u32) -> Header {
    Header {
      ty: FrameType::WindowUpdate,
      flags: flags::SYN,
      stream_id,
      length: 0,
    }
  }

  pub fn data(stream_id: u32, length: u32) -> Header {
    Header {
      ty: FrameType::Data,
      flags: 0,
      stream_id,
      length,
    }
  }

  pub fn fin(stream_id: u32) -> Header {
    Header {
      ty: FrameType::Data,
      flags: flags::FIN,
      stream_id,
      length: 0,
    }
  }

  pub fn window_update(stream_id: u32, delta: u32) -> Header {
    Header {
      ty: FrameType::WindowUpdate,
      flags: 0,
      stream_id,
      length: delta,
    }
  }

  pub fn ping(value: u32) -> Header {
    Header {
      ty: FrameType::Ping,
      flags: 0,
      stream_id: 0,
      length: value,
    }
  }

  pub fn ping_ack(value: u32) -> Header {
    Header {
      ty: FrameType::Ping,
      flags: flags::ACK,
      stream_id: 0,
      length: value,
    }
  }

  pub fn goaway() -> Header {
    Header {
      ty: FrameType::GoAway,
      flags: 0,
      stream_id: 0,
      length: 0,
    }
  }

  pub fn has(&self, flag: u16) -> bool {
    self.flags & flag != 0
  }

  pub fn encode(&self) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0] = VERSION;
    buf[1] = self.ty.as_u8();
    buf[2..4].copy_from_slice(&self.flags.to_be_bytes());
    buf[4..8].copy_from_slice(&self.stream_id.to_be_bytes());
    buf[8..12].copy_from_slice(&self.length.to_be_bytes());
    buf
  }

  pub fn decode(buf: &[u8; HEADER_LEN]) -> io::Result<Header> {
    if buf[0] != VERSION {
      return Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unsupported frame version {}", buf[0]),
      ));
    }
    let ty = FrameType::from_u8(buf[1]).ok_or_else(|| {
      io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unknown frame type {}", buf[1]),
      )
    })?;
    Ok(Header {
      ty,
      flags: u16::from_be_bytes([buf[2], buf[3]]),
      stream_id: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
      length: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn header_roundtrip() {
    let header = Header {
      ty: FrameType::Data,
      flags: flags::SYN | flags::FIN,
      stream_id: 0xDEAD_BEEF,
      length: 0x0102_0304,
    };
    let decoded = Header::decode(&header.encode()).expect("decode");
    assert_eq!(decoded.ty, FrameType::Data);
    assert_eq!(decoded.flags, flags::SYN | flags::FIN);
    assert_eq!(decoded.stream_id, 0xDEAD_BEEF);
    assert_eq!(decoded.length, 0x0102_0304);
  }

  #[test]
  fn rejects_unknown_version_and_type() {
    let mut buf = Header::ping(7).encode();
    buf[0] = 9;
    assert!(Header::decode(&buf).is_err());

    let mut buf = Header::ping(7).encode();
    buf[1] = 0x77;
    assert!(Header::decode(&buf).is_err());
  }
}
