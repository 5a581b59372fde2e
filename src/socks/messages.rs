//! SOCKS5 wire format (RFC 1928), client side only

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::{Error, Result};

pub const SOCKS_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xff;
pub const CMD_CONNECT: u8 = 0x01;
pub const RESERVED: u8 = 0x00;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;

/// The address length field is a single byte.
pub const MAX_DOMAIN_LEN: usize = 255;

/// Version 5, one method offered, no authentication.
pub const GREETING: [u8; 3] = [SOCKS_VERSION, 0x01, METHOD_NO_AUTH];

/// Check the proxy's answer to [`GREETING`].
pub fn parse_method_selection(reply: &[u8]) -> Result<()> {
    if reply.len() < 2 {
        return Err(Error::protocol_violation(format!(
            "method selection reply is {} bytes, expected 2",
            reply.len()
        )));
    }
    if reply[0] != SOCKS_VERSION {
        return Err(Error::protocol_violation(format!(
            "proxy answered with SOCKS version {:#04x}",
            reply[0]
        )));
    }

    match reply[1] {
        METHOD_NO_AUTH => Ok(()),
        METHOD_NO_ACCEPTABLE => Err(Error::negotiation(
            "proxy accepts none of the offered authentication methods",
        )),
        other => Err(Error::negotiation(format!(
            "proxy selected unsupported method {:#04x}",
            other
        ))),
    }
}

/// `05 01 00 03 LEN <domain> PORT_HI PORT_LO`
pub fn encode_connect(domain: &str, port: u16) -> Result<Bytes> {
    let name = domain.as_bytes();
    if name.is_empty() {
        return Err(Error::encoding("domain name is empty"));
    }
    if name.len() > MAX_DOMAIN_LEN {
        return Err(Error::encoding(format!(
            "domain name is {} bytes, at most {} can be encoded",
            name.len(),
            MAX_DOMAIN_LEN
        )));
    }

    let mut buf = BytesMut::with_capacity(7 + name.len());
    buf.put_u8(SOCKS_VERSION);
    buf.put_u8(CMD_CONNECT);
    buf.put_u8(RESERVED);
    buf.put_u8(ATYP_DOMAIN);
    buf.put_u8(name.len() as u8);
    buf.put_slice(name);
    buf.put_u16(port);
    Ok(buf.freeze())
}

/// Address the proxy reports having bound for the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundAddress {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl fmt::Display for BoundAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundAddress::Ip(addr) => write!(f, "{}", addr),
            BoundAddress::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReply {
    pub status: u8,
    /// `None` when the reply was cut short or used an unknown address type
    pub bound: Option<BoundAddress>,
}

impl ConnectReply {
    pub fn succeeded(&self) -> bool {
        self.status == REPLY_SUCCEEDED
    }
}

/// `VER STATUS RSV ATYP BND.ADDR BND.PORT`; only the first two bytes are required.
pub fn parse_connect_reply(reply: &[u8]) -> Result<ConnectReply> {
    if reply.len() < 2 {
        return Err(Error::protocol_violation(format!(
            "CONNECT reply is {} bytes, expected at least 2",
            reply.len()
        )));
    }
    if reply[0] != SOCKS_VERSION {
        return Err(Error::protocol_violation(format!(
            "proxy answered with SOCKS version {:#04x}",
            reply[0]
        )));
    }

    Ok(ConnectReply {
        status: reply[1],
        bound: parse_bound_address(reply),
    })
}

fn parse_bound_address(reply: &[u8]) -> Option<BoundAddress> {
    let atyp = *reply.get(3)?;
    let rest = &reply[4..];

    let (addr, port_bytes) = match atyp {
        ATYP_IPV4 => {
            let octets: [u8; 4] = rest.get(..4)?.try_into().ok()?;
            let port = rest.get(4..6)?;
            (BoundAddress::Ip(SocketAddr::from((Ipv4Addr::from(octets), 0))), port)
        }
        ATYP_IPV6 => {
            let octets: [u8; 16] = rest.get(..16)?.try_into().ok()?;
            let port = rest.get(16..18)?;
            (BoundAddress::Ip(SocketAddr::from((Ipv6Addr::from(octets), 0))), port)
        }
        ATYP_DOMAIN => {
            let len = *rest.first()? as usize;
            let name = std::str::from_utf8(rest.get(1..1 + len)?).ok()?;
            let port = rest.get(1 + len..3 + len)?;
            (BoundAddress::Domain(name.to_string(), 0), port)
        }
        _ => return None,
    };

    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
    Some(match addr {
        BoundAddress::Ip(mut ip) => {
            ip.set_port(port);
            BoundAddress::Ip(ip)
        }
        BoundAddress::Domain(name, _) => BoundAddress::Domain(name, port),
    })
}

/// Human-readable meaning of a CONNECT reply status.
pub fn reply_reason(status: u8) -> &'static str {
    match status {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unassigned status",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_bytes() {
        assert_eq!(GREETING, [0x05, 0x01, 0x00]);
    }

    #[test]
    fn test_method_selection() {
        assert!(parse_method_selection(&[0x05, 0x00]).is_ok());
        assert!(matches!(
            parse_method_selection(&[0x05, 0x01]),
            Err(Error::Negotiation(_))
        ));
        assert!(matches!(
            parse_method_selection(&[0x05, 0xff]),
            Err(Error::Negotiation(_))
        ));
    }

    #[test]
    fn test_short_method_selection_is_violation() {
        assert!(matches!(
            parse_method_selection(&[0x05]),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(matches!(
            parse_method_selection(&[]),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(matches!(
            parse_method_selection(&[0x04, 0x00]),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_encode_connect_example() {
        let request = encode_connect("example.com", 50001).unwrap();
        assert_eq!(
            request.as_ref(),
            &[
                5, 1, 0, 3, 11, 101, 120, 97, 109, 112, 108, 101, 46, 99, 111, 109, 195, 81
            ]
        );
    }

    #[test]
    fn test_encode_connect_port_bytes() {
        for port in [0u16, 1, 80, 255, 256, 443, 9050, 50001, 65535] {
            let request = encode_connect("a.b", port).unwrap();
            let n = request.len();
            assert_eq!(request[n - 2], (port >> 8) as u8);
            assert_eq!(request[n - 1], (port & 0xff) as u8);
        }
    }

    #[test]
    fn test_encode_connect_length_limit() {
        let longest = "a".repeat(MAX_DOMAIN_LEN);
        let request = encode_connect(&longest, 80).unwrap();
        assert_eq!(request[4], 255);
        assert_eq!(request.len(), 7 + MAX_DOMAIN_LEN);

        let too_long = "a".repeat(MAX_DOMAIN_LEN + 1);
        assert!(matches!(
            encode_connect(&too_long, 80),
            Err(Error::Encoding(_))
        ));
        assert!(matches!(encode_connect("", 80), Err(Error::Encoding(_))));
    }

    #[test]
    fn test_connect_reply_ipv4() {
        let reply = parse_connect_reply(&[5, 0, 0, 1, 10, 0, 0, 1, 0x1f, 0x90]).unwrap();
        assert!(reply.succeeded());
        assert_eq!(
            reply.bound,
            Some(BoundAddress::Ip("10.0.0.1:8080".parse().unwrap()))
        );
    }

    #[test]
    fn test_connect_reply_domain() {
        let reply = parse_connect_reply(&[5, 0, 0, 3, 3, b'f', b'o', b'o', 0, 80]).unwrap();
        assert_eq!(reply.bound, Some(BoundAddress::Domain("foo".to_string(), 80)));
    }

    #[test]
    fn test_connect_reply_truncated_bound_address() {
        let reply = parse_connect_reply(&[5, 4, 0, 1, 0, 0]).unwrap();
        assert_eq!(reply.status, 4);
        assert!(!reply.succeeded());
        assert_eq!(reply.bound, None);

        let reply = parse_connect_reply(&[5, 0]).unwrap();
        assert!(reply.succeeded());
        assert_eq!(reply.bound, None);
    }

    #[test]
    fn test_short_connect_reply_is_violation() {
        assert!(matches!(
            parse_connect_reply(&[5]),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_reply_reason() {
        assert_eq!(reply_reason(0x05), "connection refused");
        assert_eq!(reply_reason(0x42), "unassigned status");
    }
}
