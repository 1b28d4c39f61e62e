//! PROXY协议 v2 解码
//!
//! 负载均衡器在TCP流前附加的二进制头部，携带原始客户端地址。
//! 解码是尽力而为的：头部缺失或损坏时返回空信息，调用方退回使用套接字地址，
//! 连接本身不会因此中断。

use gateway_core::{AddressFamily, ProxyProtocolInfo};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, warn};

/// 固定的12字节签名
pub const SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// 签名 + 版本/命令 + 地址族 + 长度
pub const HEADER_LEN: usize = 16;

const COMMAND_LOCAL: u8 = 0x0;
const COMMAND_PROXY: u8 = 0x1;
const TCP_OVER_IPV4: u8 = 0x11;
const TCP_OVER_IPV6: u8 = 0x21;

/// 解码结果：可选的地址信息加上剩余的应用数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDecoded<'a> {
    pub info: Option<ProxyProtocolInfo>,
    pub payload: &'a [u8],
}

impl<'a> ProxyDecoded<'a> {
    fn unchanged(buf: &'a [u8]) -> Self {
        Self {
            info: None,
            payload: buf,
        }
    }
}

/// 缓冲区是否以v2签名开头
pub fn has_signature(buf: &[u8]) -> bool {
    buf.len() >= SIGNATURE.len() && buf[..SIGNATURE.len()] == SIGNATURE
}

/// 根据已读取的固定头部计算完整头部长度
///
/// 不是v2头部或数据不足16字节时返回 `None`。
pub fn header_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < HEADER_LEN || !has_signature(buf) {
        return None;
    }
    let declared = u16::from_be_bytes([buf[14], buf[15]]) as usize;
    Some(HEADER_LEN + declared)
}

/// 解码PROXY v2头部
pub fn decode(buf: &[u8]) -> ProxyDecoded<'_> {
    if !has_signature(buf) || buf.len() < HEADER_LEN {
        return ProxyDecoded::unchanged(buf);
    }

    let version = buf[12] >> 4;
    let command = buf[12] & 0x0F;
    if version != 2 {
        warn!("Malformed PROXY header: unsupported version {}", version);
        return ProxyDecoded::unchanged(buf);
    }

    let family = buf[13];
    let declared = u16::from_be_bytes([buf[14], buf[15]]) as usize;
    let end = HEADER_LEN + declared;
    if end > buf.len() {
        warn!(
            "Truncated PROXY header: declared {} bytes, {} available",
            declared,
            buf.len() - HEADER_LEN
        );
        return ProxyDecoded::unchanged(buf);
    }

    let block = &buf[HEADER_LEN..end];
    let payload = &buf[end..];

    if command == COMMAND_LOCAL {
        debug!("PROXY LOCAL command, using socket addresses");
        return ProxyDecoded {
            info: None,
            payload,
        };
    }
    if command != COMMAND_PROXY {
        warn!("Unknown PROXY command 0x{:x}", command);
        return ProxyDecoded {
            info: None,
            payload,
        };
    }

    let info = match family {
        TCP_OVER_IPV4 => parse_ipv4(block),
        TCP_OVER_IPV6 => parse_ipv6(block),
        other => {
            debug!("Unsupported PROXY address family 0x{:02x}", other);
            None
        }
    };

    ProxyDecoded { info, payload }
}

fn parse_ipv4(block: &[u8]) -> Option<ProxyProtocolInfo> {
    if block.len() < 12 {
        warn!("Short IPv4 PROXY address block: {} bytes", block.len());
        return None;
    }
    let src = Ipv4Addr::new(block[0], block[1], block[2], block[3]);
    let dst = Ipv4Addr::new(block[4], block[5], block[6], block[7]);
    Some(ProxyProtocolInfo {
        address_family: AddressFamily::Ipv4,
        source_ip: IpAddr::V4(src),
        destination_ip: IpAddr::V4(dst),
        source_port: u16::from_be_bytes([block[8], block[9]]),
        destination_port: u16::from_be_bytes([block[10], block[11]]),
    })
}

fn parse_ipv6(block: &[u8]) -> Option<ProxyProtocolInfo> {
    if block.len() < 36 {
        warn!("Short IPv6 PROXY address block: {} bytes", block.len());
        return None;
    }
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&block[0..16]);
    dst.copy_from_slice(&block[16..32]);
    Some(ProxyProtocolInfo {
        address_family: AddressFamily::Ipv6,
        source_ip: IpAddr::V6(Ipv6Addr::from(src)),
        destination_ip: IpAddr::V6(Ipv6Addr::from(dst)),
        source_port: u16::from_be_bytes([block[32], block[33]]),
        destination_port: u16::from_be_bytes([block[34], block[35]]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_header(command: u8, family: u8, block: &[u8]) -> Vec<u8> {
        let mut buf = SIGNATURE.to_vec();
        buf.push(0x20 | command);
        buf.push(family);
        buf.extend_from_slice(&(block.len() as u16).to_be_bytes());
        buf.extend_from_slice(block);
        buf
    }

    fn ipv4_block(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Vec<u8> {
        let mut block = Vec::new();
        block.extend_from_slice(&src);
        block.extend_from_slice(&dst);
        block.extend_from_slice(&sport.to_be_bytes());
        block.extend_from_slice(&dport.to_be_bytes());
        block
    }

    #[test]
    fn test_decode_ipv4() {
        let block = ipv4_block([192, 168, 1, 10], [10, 0, 0, 5], 5000, 8080);
        let mut buf = build_header(COMMAND_PROXY, TCP_OVER_IPV4, &block);
        buf.extend_from_slice(b"\x0bMSH|payload");

        let decoded = decode(&buf);
        let info = decoded.info.expect("ipv4 info");
        assert_eq!(info.address_family, AddressFamily::Ipv4);
        assert_eq!(info.source_ip.to_string(), "192.168.1.10");
        assert_eq!(info.destination_ip.to_string(), "10.0.0.5");
        assert_eq!(info.source_port, 5000);
        assert_eq!(info.destination_port, 8080);
        assert_eq!(decoded.payload, b"\x0bMSH|payload");
        assert_eq!(header_len(&buf), Some(HEADER_LEN + 12));
    }

    #[test]
    fn test_decode_ipv6() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst: Ipv6Addr = "fe80::abcd".parse().unwrap();
        let mut block = Vec::new();
        block.extend_from_slice(&src.octets());
        block.extend_from_slice(&dst.octets());
        block.extend_from_slice(&443u16.to_be_bytes());
        block.extend_from_slice(&2575u16.to_be_bytes());
        let mut buf = build_header(COMMAND_PROXY, TCP_OVER_IPV6, &block);
        buf.extend_from_slice(b"data");

        let decoded = decode(&buf);
        let info = decoded.info.expect("ipv6 info");
        assert_eq!(info.source_ip, IpAddr::V6(src));
        assert_eq!(info.destination_ip, IpAddr::V6(dst));
        assert_eq!(info.source_port, 443);
        assert_eq!(info.destination_port, 2575);
        assert_eq!(decoded.payload, b"data");
    }

    #[test]
    fn test_no_signature_returns_original() {
        let buf = b"\x0bMSH|^~\\&|A|B\x1c\x0d";
        let decoded = decode(buf);
        assert!(decoded.info.is_none());
        assert_eq!(decoded.payload, &buf[..]);
        assert_eq!(header_len(buf), None);
    }

    #[test]
    fn test_truncated_address_block() {
        let block = ipv4_block([1, 2, 3, 4], [5, 6, 7, 8], 1, 2);
        let buf = build_header(COMMAND_PROXY, TCP_OVER_IPV4, &block);
        // 截断声明长度之内的数据
        let truncated = &buf[..buf.len() - 3];
        let decoded = decode(truncated);
        assert!(decoded.info.is_none());
        assert_eq!(decoded.payload, truncated);
    }

    #[test]
    fn test_wrong_version_returns_original() {
        let block = ipv4_block([1, 2, 3, 4], [5, 6, 7, 8], 1, 2);
        let mut buf = build_header(COMMAND_PROXY, TCP_OVER_IPV4, &block);
        buf[12] = 0x11;
        let decoded = decode(&buf);
        assert!(decoded.info.is_none());
        assert_eq!(decoded.payload, &buf[..]);
    }

    #[test]
    fn test_local_command_skips_block() {
        let block = ipv4_block([1, 2, 3, 4], [5, 6, 7, 8], 1, 2);
        let mut buf = build_header(COMMAND_LOCAL, TCP_OVER_IPV4, &block);
        buf.extend_from_slice(b"rest");
        let decoded = decode(&buf);
        assert!(decoded.info.is_none());
        assert_eq!(decoded.payload, b"rest");
    }

    #[test]
    fn test_unsupported_family_and_short_block() {
        // UNIX套接字地址族
        let mut buf = build_header(COMMAND_PROXY, 0x31, &[0u8; 216]);
        buf.extend_from_slice(b"x");
        let decoded = decode(&buf);
        assert!(decoded.info.is_none());
        assert_eq!(decoded.payload, b"x");

        // 声明为IPv4但地址块过短
        let buf = build_header(COMMAND_PROXY, TCP_OVER_IPV4, &[1, 2, 3]);
        let decoded = decode(&buf);
        assert!(decoded.info.is_none());
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_short_buffer_with_signature() {
        let buf = SIGNATURE.to_vec();
        let decoded = decode(&buf);
        assert!(decoded.info.is_none());
        assert_eq!(decoded.payload, &buf[..]);
    }
}
