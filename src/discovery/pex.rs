//! Peer exchange (BEP 11, `ut_pex`).
//!
//! A `ut_pex` message is a bencoded dictionary whose `added` and `dropped`
//! values pack IPv4 endpoints as 6-byte groups (4 address bytes + 2 port
//! bytes, network order), the same compact form HTTP trackers use. Sends
//! are rate-limited to one per minute per peer and capped at 50 endpoints.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use riptide_bencode::{Bencode, Value};

use crate::protocol::WireError;

/// Minimum spacing between `ut_pex` sends to one peer.
pub const SEND_INTERVAL: Duration = Duration::from_secs(60);

/// Most endpoints advertised in one message.
pub const MAX_PEERS_PER_MESSAGE: usize = 50;

/// One peer exchange payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PexMessage {
    pub added: Vec<SocketAddr>,
    pub dropped: Vec<SocketAddr>,
}

impl PexMessage {
    /// Parse a received `ut_pex` payload. Unknown keys are ignored; IPv6
    /// lists (`added6`) are not consumed.
    ///
    /// # Errors
    ///
    /// Fails when the payload is not a bencoded dictionary.
    pub fn from_payload(payload: &[u8]) -> Result<Self, WireError> {
        let (value, _) = Value::decode_prefix(payload)?;
        if value.as_dict().is_none() {
            return Err(WireError::BadExtensionHandshake);
        }

        Ok(Self {
            added: compact_to_addrs(value.lookup(b"added").and_then(Value::as_bytes).unwrap_or(&[])),
            dropped: compact_to_addrs(value.lookup(b"dropped").and_then(Value::as_bytes).unwrap_or(&[])),
        })
    }

    /// Encode for the wire, truncating to [`MAX_PEERS_PER_MESSAGE`] and
    /// skipping non-IPv4 endpoints.
    #[must_use]
    pub fn to_payload(&self) -> Vec<u8> {
        Bencode::dict([
            ("added", Bencode::bytes(addrs_to_compact(&self.added))),
            ("added.f", Bencode::bytes(flag_bytes(&self.added))),
            ("dropped", Bencode::bytes(addrs_to_compact(&self.dropped))),
        ])
        .encode()
    }
}

/// Decode 6-byte compact IPv4 groups; a trailing partial group is dropped.
pub fn compact_to_addrs(compact: &[u8]) -> Vec<SocketAddr> {
    compact
        .chunks_exact(6)
        .map(|group| {
            let ip = Ipv4Addr::new(group[0], group[1], group[2], group[3]);
            let port = u16::from_be_bytes([group[4], group[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

fn addrs_to_compact(addrs: &[SocketAddr]) -> Vec<u8> {
    let mut compact = Vec::with_capacity(6 * addrs.len().min(MAX_PEERS_PER_MESSAGE));
    for addr in addrs.iter().take(MAX_PEERS_PER_MESSAGE) {
        if let IpAddr::V4(ip) = addr.ip() {
            compact.extend_from_slice(&ip.octets());
            compact.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    compact
}

fn flag_bytes(addrs: &[SocketAddr]) -> Vec<u8> {
    addrs
        .iter()
        .take(MAX_PEERS_PER_MESSAGE)
        .filter(|addr| addr.ip().is_ipv4())
        .map(|_| 0u8)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv6Addr, SocketAddr};

    use super::{PexMessage, MAX_PEERS_PER_MESSAGE};

    fn v4(a: u8, port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, a], port))
    }

    #[test]
    fn payloads_round_trip() {
        let message = PexMessage {
            added: vec![v4(1, 6881), v4(2, 51413)],
            dropped: vec![v4(3, 6882)],
        };

        let parsed = PexMessage::from_payload(&message.to_payload()).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn encoding_caps_at_fifty_peers_and_skips_ipv6() {
        let mut added: Vec<SocketAddr> = (0..60).map(|i| v4(i, 6881)).collect();
        added.push(SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 6881));

        let message = PexMessage { added, dropped: vec![] };
        let parsed = PexMessage::from_payload(&message.to_payload()).unwrap();

        assert_eq!(parsed.added.len(), MAX_PEERS_PER_MESSAGE);
        assert!(parsed.added.iter().all(|addr| addr.ip().is_ipv4()));
    }

    #[test]
    fn truncated_groups_are_dropped() {
        let payload = riptide_bencode::Bencode::dict([(
            "added",
            riptide_bencode::Bencode::bytes(vec![10, 0, 0, 1, 0x1a, 0xe1, 99]),
        )])
        .encode();

        let parsed = PexMessage::from_payload(&payload).unwrap();
        assert_eq!(parsed.added, vec![v4(1, 6881)]);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(PexMessage::from_payload(b"le").is_err());
        assert!(PexMessage::from_payload(b"nonsense").is_err());
    }
}
