//! RFC 1928 wire format: method selection, requests, replies and the UDP
//! request header.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

pub const VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Error)]
pub enum WireError {
  #[error("unsupported socks version {0:#04x}")]
  BadVersion(u8),
  #[error("address type {0:#04x} is not supported")]
  UnsupportedAddrType(u8),
  #[error("malformed datagram: {0}")]
  Malformed(&'static str),
  #[error(transparent)]
  Io(#[from] io::Error),
}

impl WireError {
  /// Reply code a server answers with before closing the connection.
  pub fn reply(&self) -> Reply {
    match self {
      WireError::UnsupportedAddrType(_) => Reply::AddressTypeNotSupported,
      _ => Reply::GeneralFailure,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
  Succeeded,
  GeneralFailure,
  ConnectionNotAllowed,
  NetworkUnreachable,
  HostUnreachable,
  ConnectionRefused,
  TtlExpired,
  CommandNotSupported,
  AddressTypeNotSupported,
}

impl Reply {
  pub fn code(self) -> u8 {
    match self {
      Reply::Succeeded => 0x00,
      Reply::GeneralFailure => 0x01,
      Reply::ConnectionNotAllowed => 0x02,
      Reply::NetworkUnreachable => 0x03,
      Reply::HostUnreachable => 0x04,
      Reply::ConnectionRefused => 0x05,
      Reply::TtlExpired => 0x06,
      Reply::CommandNotSupported => 0x07,
      Reply::AddressTypeNotSupported => 0x08,
    }
  }
}

/// A destination: a literal address or a name the dialing side resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestAddr {
  Ip(IpAddr),
  Domain(String),
}

impl DestAddr {
  pub fn host_string(&self) -> String {
    match self {
      DestAddr::Ip(ip) => ip.to_string(),
      DestAddr::Domain(domain) => domain.clone(),
    }
  }
}

impl fmt::Display for DestAddr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      DestAddr::Ip(ip) => ip.fmt(f),
      DestAddr::Domain(domain) => f.write_str(domain),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  /// Raw command byte; callers decide which commands they serve.
  pub command: u8,
  pub addr: DestAddr,
  pub port: u16,
}

/// Reads the method selection request and returns the offered methods.
pub fn read_methods<R: Read>(reader: &mut R) -> Result<Vec<u8>, WireError> {
  let mut head = [0u8; 2];
  reader.read_exact(&mut head)?;
  if head[0] != VERSION {
    return Err(WireError::BadVersion(head[0]));
  }
  let mut methods = vec![0u8; head[1] as usize];
  reader.read_exact(&mut methods)?;
  Ok(methods)
}

/// Writes the method selection reply.
pub fn write_method_selection<W: Write>(writer: &mut W, method: u8) -> io::Result<()> {
  writer.write_all(&[VERSION, method])
}

/// Reads a SOCKS request (`VER CMD RSV ATYP DST.ADDR DST.PORT`).
pub fn read_request<R: Read>(reader: &mut R) -> Result<Request, WireError> {
  let mut head = [0u8; 4];
  reader.read_exact(&mut head)?;
  if head[0] != VERSION {
    return Err(WireError::BadVersion(head[0]));
  }
  let (addr, port) = read_addr(reader, head[3])?;
  Ok(Request {
    command: head[1],
    addr,
    port,
  })
}

fn read_addr<R: Read>(reader: &mut R, atyp: u8) -> Result<(DestAddr, u16), WireError> {
  let addr = match atyp {
    ATYP_IPV4 => {
      let mut octets = [0u8; 4];
      reader.read_exact(&mut octets)?;
      DestAddr::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
    }
    ATYP_IPV6 => {
      let mut octets = [0u8; 16];
      reader.read_exact(&mut octets)?;
      DestAddr::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
    }
    ATYP_DOMAIN => {
      let mut len = [0u8; 1];
      reader.read_exact(&mut len)?;
      let mut name = vec![0u8; len[0] as usize];
      reader.read_exact(&mut name)?;
      let name =
        String::from_utf8(name).map_err(|_| WireError::Malformed("domain is not utf-8"))?;
      DestAddr::Domain(name)
    }
    other => return Err(WireError::UnsupportedAddrType(other)),
  };
  let mut port = [0u8; 2];
  reader.read_exact(&mut port)?;
  Ok((addr, u16::from_be_bytes(port)))
}

/// Writes a reply (`VER REP RSV ATYP BND.ADDR BND.PORT`).
pub fn write_reply<W: Write>(writer: &mut W, reply: Reply, bind: SocketAddr) -> io::Result<()> {
  let mut buf = Vec::with_capacity(22);
  buf.push(VERSION);
  buf.push(reply.code());
  buf.push(0x00);
  push_socket_addr(&mut buf, bind);
  writer.write_all(&buf)
}

fn push_socket_addr(buf: &mut Vec<u8>, addr: SocketAddr) {
  match addr.ip() {
    IpAddr::V4(ip) => {
      buf.push(ATYP_IPV4);
      buf.extend_from_slice(&ip.octets());
    }
    IpAddr::V6(ip) => {
      buf.push(ATYP_IPV6);
      buf.extend_from_slice(&ip.octets());
    }
  }
  buf.extend_from_slice(&addr.port().to_be_bytes());
}

/// Reads a complete reply and returns its raw bytes, so a relay can pass
/// it on verbatim.
pub fn read_reply_raw<R: Read>(reader: &mut R) -> Result<Vec<u8>, WireError> {
  let mut head = [0u8; 4];
  reader.read_exact(&mut head)?;
  if head[0] != VERSION {
    return Err(WireError::BadVersion(head[0]));
  }
  let mut raw = head.to_vec();
  let addr_len = match head[3] {
    ATYP_IPV4 => 4,
    ATYP_IPV6 => 16,
    ATYP_DOMAIN => {
      let mut len = [0u8; 1];
      reader.read_exact(&mut len)?;
      raw.push(len[0]);
      len[0] as usize
    }
    other => return Err(WireError::UnsupportedAddrType(other)),
  };
  let mut rest = vec![0u8; addr_len + 2];
  reader.read_exact(&mut rest)?;
  raw.extend_from_slice(&rest);
  Ok(raw)
}

/// Parses an RFC 1928 section 7 UDP request:
/// `RSV RSV FRAG ATYP DST.ADDR DST.PORT DATA`.
pub fn parse_udp_datagram(buf: &[u8]) -> Result<(u8, DestAddr, u16, &[u8]), WireError> {
  if buf.len() < 4 {
    return Err(WireError::Malformed("datagram too short"));
  }
  if buf[0] != 0 || buf[1] != 0 {
    return Err(WireError::Malformed("non-zero reserved bytes"));
  }
  let frag = buf[2];
  let (addr, addr_end) = match buf[3] {
    ATYP_IPV4 => {
      if buf.len() < 10 {
        return Err(WireError::Malformed("truncated ipv4 address"));
      }
      let mut octets = [0u8; 4];
      octets.copy_from_slice(&buf[4..8]);
      (DestAddr::Ip(IpAddr::V4(Ipv4Addr::from(octets))), 8)
    }
    ATYP_IPV6 => {
      if buf.len() < 22 {
        return Err(WireError::Malformed("truncated ipv6 address"));
      }
      let mut octets = [0u8; 16];
      octets.copy_from_slice(&buf[4..20]);
      (DestAddr::Ip(IpAddr::V6(Ipv6Addr::from(octets))), 20)
    }
    ATYP_DOMAIN => {
      let len = *buf.get(4).ok_or(WireError::Malformed("missing domain length"))? as usize;
      let end = 5 + len;
      if buf.len() < end + 2 {
        return Err(WireError::Malformed("truncated domain"));
      }
      let name = String::from_utf8(buf[5..end].to_vec())
        .map_err(|_| WireError::Malformed("domain is not utf-8"))?;
      (DestAddr::Domain(name), end)
    }
    other => return Err(WireError::UnsupportedAddrType(other)),
  };
  let port = u16::from_be_bytes([buf[addr_end], buf[addr_end + 1]]);
  Ok((frag, addr, port, &buf[addr_end + 2..]))
}

/// Builds an RFC 1928 section 7 UDP datagram around a payload.
pub fn encode_udp_datagram(host: &str, port: u16, payload: &[u8]) -> Vec<u8> {
  let mut buf = Vec::with_capacity(payload.len() + 22);
  buf.extend_from_slice(&[0x00, 0x00, 0x00]);
  match host.parse::<IpAddr>() {
    Ok(IpAddr::V4(ip)) => {
      buf.push(ATYP_IPV4);
      buf.extend_from_slice(&ip.octets());
    }
    Ok(IpAddr::V6(ip)) => {
      buf.push(ATYP_IPV6);
      buf.extend_from_slice(&ip.octets());
    }
    Err(_) => {
      let name = &host.as_bytes()[..host.len().min(255)];
      buf.push(ATYP_DOMAIN);
      buf.push(name.len() as u8);
      buf.extend_from_slice(name);
    }
  }
  buf.extend_from_slice(&port.to_be_bytes());
  buf.extend_from_slice(payload);
  buf
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn method_selection_bytes_are_rfc_exact() {
    let mut out = Vec::new();
    write_method_selection(&mut out, METHOD_NO_AUTH).expect("write");
    assert_eq!(out, vec![0x05, 0x00]);

    let mut out = Vec::new();
    write_method_selection(&mut out, METHOD_NO_ACCEPTABLE).expect("write");
    assert_eq!(out, vec![0x05, 0xFF]);
  }

  #[test]
  fn reply_bytes_are_rfc_exact() {
    let bind: SocketAddr = "192.0.2.1:4096".parse().expect("addr");
    let mut out = Vec::new();
    write_reply(&mut out, Reply::Succeeded, bind).expect("write");
    assert_eq!(out, vec![0x05, 0x00, 0x00, 0x01, 192, 0, 2, 1, 0x10, 0x00]);

    let mut out = Vec::new();
    write_reply(&mut out, Reply::ConnectionRefused, "0.0.0.0:0".parse().expect("addr"))
      .expect("write");
    assert_eq!(out, vec![0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
  }

  #[test]
  fn request_parses_every_address_type() {
    let mut wire = vec![0x05, CMD_CONNECT, 0x00, 0x01, 127, 0, 0, 1, 0x23, 0x28];
    let request = read_request(&mut wire.as_slice()).expect("parse");
    assert_eq!(request.command, CMD_CONNECT);
    assert_eq!(request.addr, DestAddr::Ip("127.0.0.1".parse().expect("ip")));
    assert_eq!(request.port, 9000);

    wire = vec![0x05, CMD_UDP_ASSOCIATE, 0x00, 0x03, 0x04];
    wire.extend_from_slice(b"host");
    wire.extend_from_slice(&[0x00, 0x35]);
    let request = read_request(&mut wire.as_slice()).expect("parse");
    assert_eq!(request.command, CMD_UDP_ASSOCIATE);
    assert_eq!(request.addr, DestAddr::Domain("host".to_string()));
    assert_eq!(request.port, 53);
  }

  #[test]
  fn request_rejects_bad_version_and_atyp() {
    let wire = vec![0x04, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0, 80];
    assert!(matches!(
      read_request(&mut wire.as_slice()),
      Err(WireError::BadVersion(0x04))
    ));

    let wire = vec![0x05, 0x01, 0x00, 0x02, 1, 2, 3, 4, 0, 80];
    let err = read_request(&mut wire.as_slice()).expect_err("bad atyp");
    assert!(matches!(err, WireError::UnsupportedAddrType(0x02)));
    assert_eq!(err.reply(), Reply::AddressTypeNotSupported);
  }

  #[test]
  fn reply_raw_roundtrip_is_verbatim() {
    let bind: SocketAddr = "10.1.2.3:65535".parse().expect("addr");
    let mut wire = Vec::new();
    write_reply(&mut wire, Reply::Succeeded, bind).expect("write");
    let raw = read_reply_raw(&mut wire.as_slice()).expect("read");
    assert_eq!(raw, wire);
  }

  #[test]
  fn udp_datagram_roundtrip() {
    let packet = encode_udp_datagram("127.0.0.1", 8080, b"payload");
    assert_eq!(&packet[..4], &[0x00, 0x00, 0x00, 0x01]);
    let (frag, addr, port, payload) = parse_udp_datagram(&packet).expect("parse");
    assert_eq!(frag, 0);
    assert_eq!(addr, DestAddr::Ip("127.0.0.1".parse().expect("ip")));
    assert_eq!(port, 8080);
    assert_eq!(payload, b"payload");

    let packet = encode_udp_datagram("tracker.example", 6881, b"x");
    let (_, addr, port, payload) = parse_udp_datagram(&packet).expect("parse");
    assert_eq!(addr, DestAddr::Domain("tracker.example".to_string()));
    assert_eq!(port, 6881);
    assert_eq!(payload, b"x");
  }

  #[test]
  fn udp_datagram_rejects_garbage() {
    assert!(parse_udp_datagram(&[0, 0]).is_err());
    assert!(parse_udp_datagram(&[1, 0, 0, 0x01, 1, 2, 3, 4, 0, 1]).is_err());
    assert!(parse_udp_datagram(&[0, 0, 0, 0x09, 1, 2, 3, 4, 0, 1]).is_err());
  }

  #[test]
  fn fragment_flag_is_surfaced_to_the_caller() {
    let mut packet = encode_udp_datagram("127.0.0.1", 53, b"q");
    packet[2] = 2;
    let (frag, _, _, _) = parse_udp_datagram(&packet).expect("parse");
    assert_eq!(frag, 2);
  }
}
