use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

/// Protocol version byte carried by every SOCKS5 frame.
pub const VERSION: u8 = 0x05;

/// Method: no authentication required.
pub const METHOD_NO_AUTH: u8 = 0x00;
/// Method reply: none of the offered methods is acceptable.
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Socks5Error {
    #[error("unsupported SOCKS version {0:#04x}")]
    BadVersion(u8),

    #[error("client offered no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("address body has {got} bytes, expected {expected}")]
    Truncated { expected: usize, got: usize },

    #[error("domain name is empty or not valid UTF-8")]
    InvalidDomain,
}

/// Request command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
    Unknown(u8),
}

impl From<u8> for Command {
    fn from(b: u8) -> Self {
        match b {
            0x01 => Command::Connect,
            0x02 => Command::Bind,
            0x03 => Command::UdpAssociate,
            other => Command::Unknown(other),
        }
    }
}

/// REP field of a server reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset.
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Destination address as the client sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ip(IpAddr),
    Domain(String),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(IpAddr::V6(ip)) => write!(f, "[{}]", ip),
            Address::Ip(ip) => write!(f, "{}", ip),
            Address::Domain(name) => write!(f, "{}", name),
        }
    }
}

/// Address + port of a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub addr: Address,
    pub port: u16,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Check the two-byte greeting header (`VER NMETHODS`) and return how many
/// method bytes follow.
pub fn parse_greeting(header: [u8; 2]) -> Result<usize, Socks5Error> {
    if header[0] != VERSION {
        return Err(Socks5Error::BadVersion(header[0]));
    }
    Ok(header[1] as usize)
}

/// Pick the authentication method. Only "no authentication" is supported.
pub fn select_method(offered: &[u8]) -> Result<u8, Socks5Error> {
    if offered.contains(&METHOD_NO_AUTH) {
        Ok(METHOD_NO_AUTH)
    } else {
        Err(Socks5Error::NoAcceptableMethod)
    }
}

/// Fixed four-byte head of a request: `VER CMD RSV ATYP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub command: Command,
    pub atyp: u8,
}

impl RequestHeader {
    pub fn parse(buf: [u8; 4]) -> Result<Self, Socks5Error> {
        if buf[0] != VERSION {
            return Err(Socks5Error::BadVersion(buf[0]));
        }
        Ok(Self {
            command: Command::from(buf[1]),
            atyp: buf[3],
        })
    }

    /// Number of address bytes that follow the header, not counting the
    /// length prefix of a domain name. `None` for an unknown address type.
    pub fn fixed_address_len(&self) -> Option<usize> {
        match self.atyp {
            ATYP_IPV4 => Some(4),
            ATYP_IPV6 => Some(16),
            _ => None,
        }
    }
}

/// Decode the DST.ADDR field for `atyp`. For domains `body` is the name
/// without its length byte.
pub fn decode_address(atyp: u8, body: &[u8]) -> Result<Address, Socks5Error> {
    match atyp {
        ATYP_IPV4 => {
            let octets: [u8; 4] = body.try_into().map_err(|_| Socks5Error::Truncated {
                expected: 4,
                got: body.len(),
            })?;
            Ok(Address::Ip(IpAddr::V4(Ipv4Addr::from(octets))))
        }
        ATYP_IPV6 => {
            let octets: [u8; 16] = body.try_into().map_err(|_| Socks5Error::Truncated {
                expected: 16,
                got: body.len(),
            })?;
            Ok(Address::Ip(IpAddr::V6(Ipv6Addr::from(octets))))
        }
        ATYP_DOMAIN => {
            let name = std::str::from_utf8(body).map_err(|_| Socks5Error::InvalidDomain)?;
            if name.is_empty() {
                return Err(Socks5Error::InvalidDomain);
            }
            // Some clients put a literal address in the domain field.
            match name.parse::<IpAddr>() {
                Ok(ip) => Ok(Address::Ip(ip)),
                Err(_) => Ok(Address::Domain(name.to_string())),
            }
        }
        other => Err(Socks5Error::UnsupportedAddressType(other)),
    }
}

/// Encode a server reply. `bound` is BND.ADDR/BND.PORT; error replies carry
/// the all-zero IPv4 address.
pub fn encode_reply(code: ReplyCode, bound: Option<SocketAddr>) -> Vec<u8> {
    let mut buf = vec![VERSION, code as u8, 0x00];
    match bound {
        Some(SocketAddr::V4(addr)) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
        Some(SocketAddr::V6(addr)) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
        None => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }
    buf
}

/// Encode a client CONNECT request. The daemon never sends these; guest-side
/// tooling and tests do.
pub fn encode_connect(target: &Target) -> Vec<u8> {
    let mut buf = vec![VERSION, 0x01, 0x00];
    match &target.addr {
        Address::Ip(IpAddr::V4(ip)) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        Address::Ip(IpAddr::V6(ip)) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
        Address::Domain(name) => {
            buf.push(ATYP_DOMAIN);
            buf.push(name.len().min(255) as u8);
            buf.extend_from_slice(&name.as_bytes()[..name.len().min(255)]);
        }
    }
    buf.extend_from_slice(&target.port.to_be_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_rejects_socks4() {
        assert_eq!(parse_greeting([0x04, 0x01]), Err(Socks5Error::BadVersion(0x04)));
    }

    #[test]
    fn greeting_returns_method_count() {
        assert_eq!(parse_greeting([0x05, 0x03]), Ok(3));
    }

    #[test]
    fn select_method_requires_no_auth() {
        assert_eq!(select_method(&[0x02, 0x00]), Ok(METHOD_NO_AUTH));
        assert_eq!(select_method(&[0x02]), Err(Socks5Error::NoAcceptableMethod));
        assert_eq!(select_method(&[]), Err(Socks5Error::NoAcceptableMethod));
    }

    #[test]
    fn request_header_parses_command_and_atyp() {
        let hdr = RequestHeader::parse([0x05, 0x01, 0x00, ATYP_IPV6]).unwrap();
        assert_eq!(hdr.command, Command::Connect);
        assert_eq!(hdr.fixed_address_len(), Some(16));

        let hdr = RequestHeader::parse([0x05, 0x02, 0x00, ATYP_DOMAIN]).unwrap();
        assert_eq!(hdr.command, Command::Bind);
        assert_eq!(hdr.fixed_address_len(), None);

        assert!(matches!(
            RequestHeader::parse([0x05, 0x09, 0x00, 0x01]).unwrap().command,
            Command::Unknown(0x09)
        ));
    }

    #[test]
    fn request_header_rejects_wrong_version() {
        assert_eq!(
            RequestHeader::parse([0x04, 0x01, 0x00, 0x01]),
            Err(Socks5Error::BadVersion(0x04))
        );
    }

    #[test]
    fn decode_ipv4_and_ipv6() {
        assert_eq!(
            decode_address(ATYP_IPV4, &[1, 1, 1, 1]).unwrap(),
            Address::Ip("1.1.1.1".parse().unwrap())
        );
        let v6: Ipv6Addr = "2606:4700::1111".parse().unwrap();
        assert_eq!(
            decode_address(ATYP_IPV6, &v6.octets()).unwrap(),
            Address::Ip(IpAddr::V6(v6))
        );
        assert_eq!(
            decode_address(ATYP_IPV4, &[1, 2, 3]),
            Err(Socks5Error::Truncated { expected: 4, got: 3 })
        );
    }

    #[test]
    fn decode_domain_and_literal_in_domain_field() {
        assert_eq!(
            decode_address(ATYP_DOMAIN, b"api.github.com").unwrap(),
            Address::Domain("api.github.com".into())
        );
        assert_eq!(
            decode_address(ATYP_DOMAIN, b"10.0.0.1").unwrap(),
            Address::Ip("10.0.0.1".parse().unwrap())
        );
        assert_eq!(decode_address(ATYP_DOMAIN, b""), Err(Socks5Error::InvalidDomain));
        assert_eq!(
            decode_address(ATYP_DOMAIN, &[0xff, 0xfe]),
            Err(Socks5Error::InvalidDomain)
        );
        assert_eq!(
            decode_address(0x05, &[]),
            Err(Socks5Error::UnsupportedAddressType(0x05))
        );
    }

    #[test]
    fn error_reply_is_ten_bytes_of_zero_address() {
        assert_eq!(
            encode_reply(ReplyCode::NotAllowed, None),
            vec![0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn success_reply_carries_bound_address() {
        let bound: SocketAddr = "192.168.1.10:40000".parse().unwrap();
        let reply = encode_reply(ReplyCode::Succeeded, Some(bound));
        assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, ATYP_IPV4]);
        assert_eq!(&reply[4..8], &[192, 168, 1, 10]);
        assert_eq!(u16::from_be_bytes([reply[8], reply[9]]), 40000);

        let bound6: SocketAddr = "[::1]:8080".parse().unwrap();
        let reply = encode_reply(ReplyCode::Succeeded, Some(bound6));
        assert_eq!(reply[3], ATYP_IPV6);
        assert_eq!(reply.len(), 4 + 16 + 2);
    }

    #[test]
    fn connect_request_encodes_domain_with_length_prefix() {
        let target = Target {
            addr: Address::Domain("example.com".into()),
            port: 443,
        };
        let buf = encode_connect(&target);
        assert_eq!(&buf[..4], &[0x05, 0x01, 0x00, ATYP_DOMAIN]);
        assert_eq!(buf[4] as usize, "example.com".len());
        assert_eq!(&buf[5..16], b"example.com");
        assert_eq!(&buf[16..], &443u16.to_be_bytes());
    }

    #[test]
    fn target_display_brackets_ipv6() {
        let target = Target {
            addr: Address::Ip("::1".parse().unwrap()),
            port: 22,
        };
        assert_eq!(target.to_string(), "[::1]:22");
    }
}
