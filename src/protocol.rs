//! VLESS handshake wire format
//!
//! The first frame of every session carries a binary header identifying the
//! caller and the destination:
//!
//! ```text
//! +---------+--------+---------+-----------+---------+------+-------+----------+---------+
//! | version | secret | ext len | ext bytes | command | port | atype | address  | payload |
//! +---------+--------+---------+-----------+---------+------+-------+----------+---------+
//! |    1    |   16   |    1    |     M     |    1    |  2   |   1   | variable |   rest  |
//! +---------+--------+---------+-----------+---------+------+-------+----------+---------+
//! ```
//!
//! All integers are big-endian. The extension block is skipped, never
//! interpreted. Parsing is a pure function of the frame bytes and the
//! expected secret; all I/O lives elsewhere.

use bytes::Bytes;

use crate::TunnelError;

/// Raw token length in the header (128-bit secret)
pub const SECRET_LEN: usize = 16;

/// Smallest frame that can hold a complete header
pub const MIN_HEADER_LEN: usize = 24;

const COMMAND_TCP: u8 = 0x01;
const COMMAND_UDP: u8 = 0x02;

const ADDRESS_TYPE_IPV4: u8 = 0x01;
const ADDRESS_TYPE_DOMAIN: u8 = 0x02;
const ADDRESS_TYPE_IPV6: u8 = 0x03;

/// DNS port, the only UDP destination that is forwarded
pub const DNS_PORT: u16 = 53;

/// Tunnel commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Tcp,
    /// DNS-over-UDP, re-framed through DoH; only valid with port 53
    Udp,
}

/// Destination address families carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    IPv4,
    DomainName,
    IPv6,
}

/// Parsed handshake, derived exactly once from the first inbound frame
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    /// Protocol version, echoed back unmodified in the response preamble
    pub version: u8,
    pub command: Command,
    pub address_type: AddressType,
    /// Destination host: dotted-quad, hostname, or colon-grouped hex
    pub address: String,
    pub port: u16,
    /// Remainder of the first frame; forwarded to the destination as the
    /// first outbound write (typically the inner protocol's own handshake)
    pub payload: Bytes,
}

/// Two-byte response header sent exactly once per session, prepended to the
/// first destination-to-client delivery.
pub fn response_preamble(version: u8) -> [u8; 2] {
    [version, 0x00]
}

/// Decode a handshake frame against the expected secret.
///
/// Pure function: same bytes always produce the same result. The caller
/// guarantees the full header arrived in one frame; no partial-frame
/// buffering happens here.
pub fn parse_header(frame: &[u8], secret: &[u8; SECRET_LEN]) -> Result<TunnelRequest, TunnelError> {
    if frame.len() < MIN_HEADER_LEN {
        return Err(TunnelError::Protocol("header too short"));
    }

    let version = frame[0];

    if frame[1..1 + SECRET_LEN] != secret[..] {
        return Err(TunnelError::Auth);
    }

    // Skip the extension block without interpreting it
    let ext_len = frame[17] as usize;
    let mut pos = 18 + ext_len;

    if frame.len() < pos + 4 {
        return Err(TunnelError::Protocol("truncated header"));
    }

    let command_byte = frame[pos];
    pos += 1;

    let port = u16::from_be_bytes([frame[pos], frame[pos + 1]]);
    pos += 2;

    let command = match command_byte {
        COMMAND_TCP => Command::Tcp,
        COMMAND_UDP if port == DNS_PORT => Command::Udp,
        // MUX and arbitrary-port UDP are not proxied
        _ => return Err(TunnelError::UnsupportedCommand(command_byte)),
    };

    let address_type_byte = frame[pos];
    pos += 1;

    let (address_type, address) = match address_type_byte {
        ADDRESS_TYPE_IPV4 => {
            let octets = take(frame, pos, 4)?;
            pos += 4;
            let addr = format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]);
            (AddressType::IPv4, addr)
        }
        ADDRESS_TYPE_DOMAIN => {
            let len = take(frame, pos, 1)?[0] as usize;
            pos += 1;
            let name = take(frame, pos, len)?;
            pos += len;
            let addr = String::from_utf8(name.to_vec())
                .map_err(|_| TunnelError::Address("domain name is not valid UTF-8".to_string()))?;
            (AddressType::DomainName, addr)
        }
        ADDRESS_TYPE_IPV6 => {
            let b = take(frame, pos, 16)?;
            pos += 16;
            // Eight zero-padded lowercase groups, no compression, no brackets
            let addr = format!(
                "{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}",
                b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
            );
            (AddressType::IPv6, addr)
        }
        other => {
            return Err(TunnelError::Address(format!("unknown address type: {other}")));
        }
    };

    if address.is_empty() {
        return Err(TunnelError::Address("empty destination address".to_string()));
    }

    Ok(TunnelRequest {
        version,
        command,
        address_type,
        address,
        port,
        payload: Bytes::copy_from_slice(&frame[pos..]),
    })
}

fn take(frame: &[u8], pos: usize, len: usize) -> Result<&[u8], TunnelError> {
    frame
        .get(pos..pos + len)
        .ok_or(TunnelError::Protocol("truncated header"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: [u8; 16] = [
        0xd3, 0x42, 0xd1, 0x1e, 0xd2, 0x4e, 0x41, 0x07, 0xa1, 0x0c, 0x8f, 0x2e, 0x7f, 0xa6,
        0xdd, 0x11,
    ];

    fn frame(command: u8, port: u16, atype: u8, addr: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut f = vec![0x00];
        f.extend_from_slice(&SECRET);
        f.push(0x00); // no extension block
        f.push(command);
        f.extend_from_slice(&port.to_be_bytes());
        f.push(atype);
        f.extend_from_slice(addr);
        f.extend_from_slice(payload);
        f
    }

    #[test]
    fn test_parse_is_deterministic() {
        let f = frame(0x01, 443, ADDRESS_TYPE_IPV4, &[93, 184, 216, 34], b"hello");
        let a = parse_header(&f, &SECRET).unwrap();
        let b = parse_header(&f, &SECRET).unwrap();
        assert_eq!(a.address, b.address);
        assert_eq!(a.port, b.port);
        assert_eq!(a.payload, b.payload);
    }

    #[test]
    fn test_short_buffer_rejected() {
        for len in 0..MIN_HEADER_LEN {
            let buf = vec![0u8; len];
            assert!(matches!(
                parse_header(&buf, &SECRET),
                Err(TunnelError::Protocol("header too short"))
            ));
        }
    }

    #[test]
    fn test_secret_must_match_exactly() {
        let f = frame(0x01, 80, ADDRESS_TYPE_IPV4, &[1, 2, 3, 4], b"");
        assert!(parse_header(&f, &SECRET).is_ok());

        // Flip a single bit in each secret byte in turn
        for i in 0..SECRET_LEN {
            let mut bad = f.clone();
            bad[1 + i] ^= 0x01;
            assert!(matches!(parse_header(&bad, &SECRET), Err(TunnelError::Auth)));
        }
    }

    #[test]
    fn test_ipv4_renders_dotted_decimal() {
        let f = frame(0x01, 443, ADDRESS_TYPE_IPV4, &[93, 184, 216, 34], b"");
        let req = parse_header(&f, &SECRET).unwrap();
        assert_eq!(req.address, "93.184.216.34");
        assert_eq!(req.address_type, AddressType::IPv4);
        assert_eq!(req.port, 443);
    }

    #[test]
    fn test_ipv6_renders_full_lowercase_groups() {
        let addr: [u8; 16] = [
            0x20, 0x01, 0x0d, 0xb8, 0x85, 0xa3, 0x00, 0x00, 0x00, 0x00, 0x8a, 0x2e, 0x03,
            0x70, 0x73, 0x34,
        ];
        let f = frame(0x01, 443, ADDRESS_TYPE_IPV6, &addr, b"");
        let req = parse_header(&f, &SECRET).unwrap();
        assert_eq!(req.address, "2001:0db8:85a3:0000:0000:8a2e:0370:7334");
        assert_eq!(req.address_type, AddressType::IPv6);
    }

    #[test]
    fn test_domain_name_decodes_utf8() {
        let mut addr = vec![11u8];
        addr.extend_from_slice(b"example.com");
        let f = frame(0x01, 443, ADDRESS_TYPE_DOMAIN, &addr, b"\x16\x03\x01");
        let req = parse_header(&f, &SECRET).unwrap();
        assert_eq!(req.address, "example.com");
        assert_eq!(req.address_type, AddressType::DomainName);
        assert_eq!(&req.payload[..], b"\x16\x03\x01");
    }

    #[test]
    fn test_mux_command_rejected() {
        let f = frame(0x03, 443, ADDRESS_TYPE_IPV4, &[1, 2, 3, 4], b"");
        assert!(matches!(
            parse_header(&f, &SECRET),
            Err(TunnelError::UnsupportedCommand(0x03))
        ));
    }

    #[test]
    fn test_udp_requires_dns_port() {
        let f = frame(0x02, 5353, ADDRESS_TYPE_IPV4, &[1, 2, 3, 4], b"");
        assert!(matches!(
            parse_header(&f, &SECRET),
            Err(TunnelError::UnsupportedCommand(0x02))
        ));

        let f = frame(0x02, 53, ADDRESS_TYPE_IPV4, &[1, 1, 1, 1], b"");
        let req = parse_header(&f, &SECRET).unwrap();
        assert_eq!(req.command, Command::Udp);
    }

    #[test]
    fn test_extension_block_skipped() {
        let mut f = vec![0x00];
        f.extend_from_slice(&SECRET);
        f.push(4); // extension length
        f.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        f.push(COMMAND_TCP);
        f.extend_from_slice(&443u16.to_be_bytes());
        f.push(ADDRESS_TYPE_IPV4);
        f.extend_from_slice(&[10, 0, 0, 1]);
        f.extend_from_slice(b"data");

        let req = parse_header(&f, &SECRET).unwrap();
        assert_eq!(req.address, "10.0.0.1");
        assert_eq!(&req.payload[..], b"data");
    }

    #[test]
    fn test_empty_domain_rejected() {
        // Payload byte keeps the frame above the minimum header length so
        // the empty-address check itself is what rejects it
        let f = frame(0x01, 80, ADDRESS_TYPE_DOMAIN, &[0u8], b"x");
        assert!(f.len() >= MIN_HEADER_LEN);
        assert!(matches!(parse_header(&f, &SECRET), Err(TunnelError::Address(_))));
    }

    #[test]
    fn test_unknown_address_type_rejected() {
        let f = frame(0x01, 80, 0x07, &[1, 2, 3, 4], b"");
        assert!(matches!(parse_header(&f, &SECRET), Err(TunnelError::Address(_))));
    }

    #[test]
    fn test_truncated_domain_rejected() {
        let mut addr = vec![50u8]; // claims 50 bytes, provides 3
        addr.extend_from_slice(b"abc");
        let f = frame(0x01, 80, ADDRESS_TYPE_DOMAIN, &addr, b"");
        assert!(matches!(
            parse_header(&f, &SECRET),
            Err(TunnelError::Protocol("truncated header"))
        ));
    }

    #[test]
    fn test_version_echoed_in_preamble() {
        assert_eq!(response_preamble(0x00), [0x00, 0x00]);
        assert_eq!(response_preamble(0x01), [0x01, 0x00]);
    }
}
