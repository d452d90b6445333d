/**
 * backends/stun.rs
 *
 * STUN reflexive-address discovery (RFC 5389 binding request).
 */

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use super::{NatDiscovery, NatError};
use crate::config::NatConfig;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const MAGIC_COOKIE: u32 = 0x2112_A442;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const HEADER_LEN: usize = 20;

/// STUN client querying the configured server for our reflexive
/// (server-seen) address.
pub struct StunDiscovery {
    cfg: NatConfig,
}

impl StunDiscovery {
    pub fn new() -> Self {
        Self {
            cfg: NatConfig::default(),
        }
    }
}

impl Default for StunDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NatDiscovery for StunDiscovery {
    fn configure(&mut self, cfg: &NatConfig) {
        self.cfg = cfg.clone();
    }

    async fn discover(&self) -> Result<SocketAddr, NatError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| NatError::Bind(e.to_string()))?;
        let wait = Duration::from_secs(self.cfg.timeout_secs);
        query(&socket, &self.cfg.server, wait).await
    }
}

/// One binding request/response exchange on the given socket. Shared
/// with the tunnel backend, which warms its punching socket's NAT
/// mapping this way before probing.
pub(crate) async fn query(
    socket: &UdpSocket,
    server: &str,
    wait: Duration,
) -> Result<SocketAddr, NatError> {
    let txid: [u8; 12] = rand::random();
    let request = binding_request(&txid);

    socket
        .send_to(&request, server)
        .await
        .map_err(|e| NatError::Io(format!("send: {}", e)))?;

    let mut buf = vec![0u8; 1024];
    let (len, _) = timeout(wait, socket.recv_from(&mut buf))
        .await
        .map_err(|_| NatError::Timeout)?
        .map_err(|e| NatError::Io(format!("recv: {}", e)))?;

    let mapped = parse_binding_response(&buf[..len], &txid)?;
    debug!(%mapped, "reflexive address discovered");
    Ok(mapped)
}

fn binding_request(txid: &[u8; 12]) -> Vec<u8> {
    let mut request = Vec::with_capacity(HEADER_LEN);
    request.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    request.extend_from_slice(&0u16.to_be_bytes()); // no attributes
    request.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    request.extend_from_slice(txid);
    request
}

fn parse_binding_response(data: &[u8], txid: &[u8; 12]) -> Result<SocketAddr, NatError> {
    if data.len() < HEADER_LEN {
        return Err(NatError::Malformed("response too short".to_string()));
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != BINDING_RESPONSE {
        return Err(NatError::Malformed(format!(
            "unexpected response type 0x{:04x}",
            msg_type
        )));
    }

    let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(NatError::Malformed("bad magic cookie".to_string()));
    }

    if &data[8..HEADER_LEN] != txid {
        return Err(NatError::Malformed("transaction id mismatch".to_string()));
    }

    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if data.len() < HEADER_LEN + msg_len {
        return Err(NatError::Malformed("response truncated".to_string()));
    }

    // Attributes are type/length prefixed and padded to 4 bytes.
    let mut offset = HEADER_LEN;
    while offset + 4 <= HEADER_LEN + msg_len && offset + 4 <= data.len() {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;
        if offset + attr_len > data.len() {
            break;
        }
        let attr = &data[offset..offset + attr_len];

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => return decode_address(attr, txid, true),
            ATTR_MAPPED_ADDRESS => return decode_address(attr, txid, false),
            _ => {}
        }

        offset += (attr_len + 3) & !3;
    }

    Err(NatError::Malformed(
        "no address attribute in response".to_string(),
    ))
}

/// Decode a (XOR-)MAPPED-ADDRESS attribute. The XOR variant masks the
/// port with the cookie's top half and the address with cookie (v4) or
/// cookie plus transaction id (v6).
fn decode_address(data: &[u8], txid: &[u8; 12], xored: bool) -> Result<SocketAddr, NatError> {
    if data.len() < 8 {
        return Err(NatError::Malformed("address attribute too short".to_string()));
    }

    let family = data[1];
    let raw_port = u16::from_be_bytes([data[2], data[3]]);
    let port = if xored {
        raw_port ^ (MAGIC_COOKIE >> 16) as u16
    } else {
        raw_port
    };

    let ip = match family {
        0x01 => {
            let raw = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            let addr = if xored { raw ^ MAGIC_COOKIE } else { raw };
            IpAddr::from(addr.to_be_bytes())
        }
        0x02 => {
            if data.len() < 20 {
                return Err(NatError::Malformed("v6 address truncated".to_string()));
            }
            let mut addr = [0u8; 16];
            addr.copy_from_slice(&data[4..20]);
            if xored {
                let mut key = [0u8; 16];
                key[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                key[4..16].copy_from_slice(txid);
                for (byte, mask) in addr.iter_mut().zip(key.iter()) {
                    *byte ^= mask;
                }
            }
            IpAddr::from(addr)
        }
        other => {
            return Err(NatError::Malformed(format!(
                "unknown address family {}",
                other
            )))
        }
    };

    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TXID: [u8; 12] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];

    fn response(attrs: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        data.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
        data.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        data.extend_from_slice(&TXID);
        data.extend_from_slice(attrs);
        data
    }

    fn xor_mapped_v4(addr: [u8; 4], port: u16) -> Vec<u8> {
        let mut attr = Vec::new();
        attr.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        attr.extend_from_slice(&8u16.to_be_bytes());
        attr.push(0);
        attr.push(0x01);
        attr.extend_from_slice(&(port ^ (MAGIC_COOKIE >> 16) as u16).to_be_bytes());
        let masked = u32::from_be_bytes(addr) ^ MAGIC_COOKIE;
        attr.extend_from_slice(&masked.to_be_bytes());
        attr
    }

    #[test]
    fn decodes_xor_mapped_v4() {
        let data = response(&xor_mapped_v4([203, 0, 113, 7], 54321));
        let mapped = parse_binding_response(&data, &TXID).unwrap();
        assert_eq!(mapped, "203.0.113.7:54321".parse().unwrap());
    }

    #[test]
    fn falls_back_to_plain_mapped_address() {
        let mut attr = Vec::new();
        attr.extend_from_slice(&ATTR_MAPPED_ADDRESS.to_be_bytes());
        attr.extend_from_slice(&8u16.to_be_bytes());
        attr.push(0);
        attr.push(0x01);
        attr.extend_from_slice(&4242u16.to_be_bytes());
        attr.extend_from_slice(&[192, 0, 2, 1]);

        let data = response(&attr);
        let mapped = parse_binding_response(&data, &TXID).unwrap();
        assert_eq!(mapped, "192.0.2.1:4242".parse().unwrap());
    }

    #[test]
    fn rejects_bad_cookie_and_txid() {
        let mut data = response(&xor_mapped_v4([203, 0, 113, 7], 1));
        data[4] ^= 0xff;
        assert!(matches!(
            parse_binding_response(&data, &TXID),
            Err(NatError::Malformed(_))
        ));

        let data = response(&xor_mapped_v4([203, 0, 113, 7], 1));
        let wrong = [9u8; 12];
        assert!(matches!(
            parse_binding_response(&data, &wrong),
            Err(NatError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_short_or_empty_responses() {
        assert!(parse_binding_response(&[0u8; 5], &TXID).is_err());
        // valid header, no attributes
        let data = response(&[]);
        assert!(matches!(
            parse_binding_response(&data, &TXID),
            Err(NatError::Malformed(_))
        ));
    }

    #[test]
    fn request_has_the_fixed_header_layout() {
        let request = binding_request(&TXID);
        assert_eq!(request.len(), HEADER_LEN);
        assert_eq!(&request[0..2], &BINDING_REQUEST.to_be_bytes());
        assert_eq!(&request[4..8], &MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&request[8..20], &TXID);
    }
}
