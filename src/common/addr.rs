use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};

use crate::common::Error;

/// 代理目标地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

pub const ADDR_TYPE_IPV4: u8 = 0x01;
pub const ADDR_TYPE_DOMAIN: u8 = 0x02;
pub const ADDR_TYPE_IPV6: u8 = 0x03;

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn is_fqdn(&self) -> bool {
        matches!(self, Address::Domain(..))
    }

    /// 仅接受 IP 目标；域名目标返回 FqdnUnsupported
    pub fn to_socket_addr(&self) -> Result<SocketAddr, Error> {
        match self {
            Address::Ip(addr) => Ok(*addr),
            Address::Domain(..) => Err(Error::FqdnUnsupported),
        }
    }

    /// 编码 VMess 地址格式：端口在前，随后类型字节与地址体
    /// [Port: 2B big-endian] [AddrType: 1B] [Address: 变长]
    /// AddrType: 0x01=IPv4, 0x02=Domain, 0x03=IPv6
    pub fn write_addr_port(&self, buf: &mut BytesMut) {
        buf.put_u16(self.port());
        match self {
            Address::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(ADDR_TYPE_IPV4);
                buf.put_slice(&addr.ip().octets());
            }
            Address::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(ADDR_TYPE_IPV6);
                buf.put_slice(&addr.ip().octets());
            }
            Address::Domain(domain, _) => {
                buf.put_u8(ADDR_TYPE_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
            }
        }
    }

    /// 从缓冲区解码 VMess 地址格式（与 write_addr_port 对称）
    pub fn read_addr_port(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 3 {
            anyhow::bail!("truncated address: missing port or type byte");
        }
        let port = buf.get_u16();
        let addr_type = buf.get_u8();
        match addr_type {
            ADDR_TYPE_IPV4 => {
                if buf.remaining() < 4 {
                    anyhow::bail!("truncated IPv4 address");
                }
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                Ok(Address::Ip(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(octets)),
                    port,
                )))
            }
            ADDR_TYPE_DOMAIN => {
                if buf.remaining() < 1 {
                    anyhow::bail!("truncated domain length");
                }
                let len = buf.get_u8() as usize;
                if buf.remaining() < len {
                    anyhow::bail!("truncated domain name");
                }
                let mut raw = vec![0u8; len];
                buf.copy_to_slice(&mut raw);
                let domain = String::from_utf8(raw)
                    .map_err(|_| anyhow::anyhow!("invalid domain name encoding"))?;
                Ok(Address::Domain(domain, port))
            }
            ADDR_TYPE_IPV6 => {
                if buf.remaining() < 16 {
                    anyhow::bail!("truncated IPv6 address");
                }
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                Ok(Address::Ip(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(octets)),
                    port,
                )))
            }
            _ => anyhow::bail!("unknown address type: 0x{:02x}", addr_type),
        }
    }

    /// 地址加端口的编码长度，用于预计算头部大小
    pub fn addr_port_len(&self) -> usize {
        2 + 1
            + match self {
                Address::Ip(SocketAddr::V4(_)) => 4,
                Address::Ip(SocketAddr::V6(_)) => 16,
                Address::Domain(domain, _) => 1 + domain.len(),
            }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(addr: Address) {
        let mut buf = BytesMut::new();
        addr.write_addr_port(&mut buf);
        assert_eq!(buf.len(), addr.addr_port_len());
        let mut cursor = &buf[..];
        let decoded = Address::read_addr_port(&mut cursor).unwrap();
        assert_eq!(decoded, addr);
        assert!(cursor.is_empty());
    }

    #[test]
    fn ipv4_round_trip() {
        round_trip(Address::Ip("1.2.3.4:443".parse().unwrap()));
    }

    #[test]
    fn ipv6_round_trip() {
        round_trip(Address::Ip("[2001:db8::1]:53".parse().unwrap()));
    }

    #[test]
    fn domain_round_trip() {
        round_trip(Address::Domain("test.com".to_string(), 443));
    }

    #[test]
    fn ipv4_layout() {
        let addr = Address::Ip("1.2.3.4:80".parse().unwrap());
        let mut buf = BytesMut::new();
        addr.write_addr_port(&mut buf);
        assert_eq!(&buf[..], &[0, 80, 0x01, 1, 2, 3, 4]);
    }

    #[test]
    fn domain_layout() {
        let addr = Address::Domain("test.com".to_string(), 443);
        let mut buf = BytesMut::new();
        addr.write_addr_port(&mut buf);
        assert_eq!(&buf[..2], &443u16.to_be_bytes());
        assert_eq!(buf[2], 0x02);
        assert_eq!(buf[3], 8);
        assert_eq!(&buf[4..], b"test.com");
    }

    #[test]
    fn ipv6_tag_byte() {
        let addr = Address::Ip("[::1]:53".parse().unwrap());
        let mut buf = BytesMut::new();
        addr.write_addr_port(&mut buf);
        assert_eq!(buf[2], 0x03);
        assert_eq!(buf.len(), 2 + 1 + 16);
    }

    #[test]
    fn unknown_type_rejected() {
        let raw = [0u8, 80, 0x07, 1, 2, 3, 4];
        assert!(Address::read_addr_port(&mut &raw[..]).is_err());
    }

    #[test]
    fn truncated_domain_rejected() {
        let raw = [0u8, 80, 0x02, 10, b'a', b'b'];
        assert!(Address::read_addr_port(&mut &raw[..]).is_err());
    }

    #[test]
    fn to_socket_addr_rejects_fqdn() {
        let addr = Address::Domain("example.com".to_string(), 443);
        assert!(matches!(
            addr.to_socket_addr(),
            Err(Error::FqdnUnsupported)
        ));
        let ip = Address::Ip("127.0.0.1:1080".parse().unwrap());
        assert_eq!(ip.to_socket_addr().unwrap(), "127.0.0.1:1080".parse().unwrap());
    }

    #[test]
    fn display_format() {
        let addr = Address::Domain("example.com".to_string(), 443);
        assert_eq!(format!("{}", addr), "example.com:443");
        let addr = Address::Ip("1.2.3.4:80".parse().unwrap());
        assert_eq!(format!("{}", addr), "1.2.3.4:80");
    }
}
